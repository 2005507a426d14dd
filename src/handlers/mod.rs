pub mod config;
pub mod sessions;

pub use config::*;
pub use sessions::*;
