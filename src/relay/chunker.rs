//! # Sentence Chunker
//!
//! Splits text into bounded fragments on sentence boundaries before it is sent
//! to the synthesis upstream. Smaller fragments let the upstream start emitting
//! audio sooner instead of waiting for a whole paragraph.
//!
//! ## Rules:
//! - A sentence is a run of non-terminal characters followed by one or more of `.`, `!`, `?`
//! - Text after the last terminal punctuation is kept as a final (partial) sentence
//! - Sentences are packed greedily while the fragment stays within `max_len` characters
//! - A sentence longer than `max_len` is emitted whole, never split

use regex::Regex;
use std::sync::LazyLock;

/// Default fragment bound used by the synthesis relay.
pub const DEFAULT_MAX_CHUNK_LEN: usize = 100;

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]+").expect("sentence pattern is valid"));

/// Split `text` into sentence-aligned fragments of at most `max_len` characters,
/// unless a single sentence is longer than that.
///
/// ## Example:
/// ```rust
/// let fragments = chunk("Hi there. How are you?", 12);
/// assert_eq!(fragments, vec!["Hi there.", " How are you?"]);
/// ```
pub fn chunk(text: &str, max_len: usize) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for sentence in sentences(text) {
        let sentence_len = sentence.chars().count();

        if current_len + sentence_len <= max_len {
            current.push_str(sentence);
            current_len += sentence_len;
        } else {
            if !current.is_empty() {
                fragments.push(std::mem::take(&mut current));
            }
            current.push_str(sentence);
            current_len = sentence_len;
        }
    }

    if !current.is_empty() {
        fragments.push(current);
    }

    fragments
}

/// Segment `text` into sentences, keeping every character.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut end = 0;

    for m in SENTENCE.find_iter(text) {
        // Matches are contiguous except for a possible leading run of punctuation
        if m.start() > end {
            out.push(&text[end..m.start()]);
        }
        out.push(m.as_str());
        end = m.end();
    }

    // Unterminated tail (or the whole input when nothing matched)
    if end < text.len() {
        out.push(&text[end..]);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_no_fragments() {
        assert!(chunk("", DEFAULT_MAX_CHUNK_LEN).is_empty());
    }

    #[test]
    fn test_single_short_sentence() {
        assert_eq!(chunk("Hello world.", 100), vec!["Hello world."]);
    }

    #[test]
    fn test_greedy_packing_is_deterministic() {
        // "A." + " B." = 5 chars fits, " C." would make 8
        assert_eq!(chunk("A. B. C.", 5), vec!["A. B.", " C."]);
        assert_eq!(chunk("A. B. C.", 3), vec!["A.", " B.", " C."]);
        assert_eq!(chunk("A. B. C.", 5), chunk("A. B. C.", 5));
    }

    #[test]
    fn test_text_without_punctuation_is_one_sentence() {
        assert_eq!(chunk("no punctuation here", 100), vec!["no punctuation here"]);
    }

    #[test]
    fn test_trailing_partial_sentence_is_kept() {
        let fragments = chunk("First one. And a tail", 100);
        assert_eq!(fragments, vec!["First one. And a tail"]);

        let fragments = chunk("First one. And a tail", 10);
        assert_eq!(fragments, vec!["First one.", " And a tail"]);
    }

    #[test]
    fn test_oversized_sentence_is_not_split() {
        let long = "This sentence is definitely longer than the tiny bound.";
        let fragments = chunk(&format!("Hi. {} Bye.", long), 10);
        assert_eq!(fragments, vec!["Hi.".to_string(), format!(" {}", long), " Bye.".to_string()]);
    }

    #[test]
    fn test_repeated_punctuation_stays_with_sentence() {
        assert_eq!(chunk("Wait... What?! Ok", 6), vec!["Wait...", " What?!", " Ok"]);
    }

    #[test]
    fn test_leading_punctuation_is_preserved() {
        assert_eq!(chunk("?! Then words.", 100), vec!["?! Then words."]);
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 7 characters in total, 11 bytes
        assert_eq!(chunk("éé. üü.", 7), vec!["éé. üü."]);
    }

    #[test]
    fn test_fragments_respect_bound_and_reassemble() {
        let inputs = [
            "One. Two! Three? Four. Five six seven eight nine ten. Eleven",
            "A much longer first sentence that overflows the bound by itself. Short. Tiny!",
            "   leading spaces. and trailing   ",
            "...",
            "Mixed!? punctuation... everywhere.",
        ];

        for max_len in [1, 5, 10, 25, 100] {
            for text in inputs {
                let fragments = chunk(text, max_len);
                assert_eq!(fragments.concat(), text, "reassembly failed for {:?}", text);

                let sentences = sentences(text);
                for fragment in &fragments {
                    let len = fragment.chars().count();
                    let is_single_sentence = sentences.contains(&fragment.as_str());
                    assert!(
                        len <= max_len || is_single_sentence,
                        "fragment {:?} exceeds {} and is not a single sentence",
                        fragment,
                        max_len
                    );
                }
            }
        }
    }
}
