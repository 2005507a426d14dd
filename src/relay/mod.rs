//! # Relay
//!
//! Everything between an accepted client socket and its upstream link:
//! - [`chunker`]: sentence-aligned text splitting for synthesis
//! - [`frame`]: client and server frame types
//! - [`session`]: the per-connection state machine
//! - [`registry`]: bookkeeping of live sessions

pub mod chunker;
pub mod frame;
pub mod registry;
pub mod session;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which upstream a relay endpoint is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// `/ws/transcribe`: audio in, transcripts out
    Transcription,
    /// `/ws/speech`: text in, audio out
    Synthesis,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Transcription => "transcription",
            RelayKind::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide relay counters, shared by every session.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub sessions_opened: AtomicU64,
    pub frames_to_upstream: AtomicU64,
    pub frames_to_client: AtomicU64,
    pub error_frames: AtomicU64,
    pub connect_failures: AtomicU64,
    pub rejected_upgrades: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`] for the metrics endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub sessions_opened: u64,
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
    pub error_frames: u64,
    pub connect_failures: u64,
    pub rejected_upgrades: u64,
}

impl RelayStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            frames_to_upstream: self.frames_to_upstream.load(Ordering::Relaxed),
            frames_to_client: self.frames_to_client.load(Ordering::Relaxed),
            error_frames: self.error_frames.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            rejected_upgrades: self.rejected_upgrades.load(Ordering::Relaxed),
        }
    }
}
