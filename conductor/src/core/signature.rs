//! Stable failure signatures and repeated-failure detection.
//!
//! Verification output carries noise that changes between otherwise
//! identical failures (addresses, timestamps, timings). Signatures are
//! computed over a normalized form so that the same defect hashes the same.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static NOISE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
            "<timestamp>",
        ),
        (r"0x[0-9a-fA-F]+", "<addr>"),
        (r"\b\d+(\.\d+)?\s?(ms|us|µs|ns|s)\b", "<duration>"),
        (r"\d{5,}", "<n>"),
        (r"\s+", " "),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("noise pattern should be valid"),
            replacement,
        )
    })
    .collect()
});

/// Strip run-specific noise from failure text.
pub fn normalize_failure(detail: &str) -> String {
    let mut normalized = detail.to_string();
    for (pattern, replacement) in NOISE.iter() {
        normalized = pattern.replace_all(&normalized, *replacement).into_owned();
    }
    normalized.trim().to_string()
}

/// SHA-256 of the normalized failure text, hex encoded.
pub fn failure_signature(detail: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_failure(detail).as_bytes());
    hex::encode(hasher.finalize())
}

/// Length of the run of identical signatures at the end of `history`.
pub fn trailing_repeats(history: &[String]) -> usize {
    let Some(last) = history.last() else {
        return 0;
    };
    history
        .iter()
        .rev()
        .take_while(|signature| *signature == last)
        .count()
}

/// True once the same signature has been seen more than `max_repeat` times in a row.
pub fn is_repeating(history: &[String], max_repeat: u32) -> bool {
    trailing_repeats(history) > max_repeat as usize
}
