//! Pattern matching over raw session output.
//!
//! A session's stream is noisy free text with occasional structured
//! markers. The classifier answers three marker questions — finished,
//! failed, visibly thinking — and leaves velocity and quiet-period
//! judgments to the monitor, which owns the timing data.

use regex::Regex;

/// Compiled marker patterns for session output.
#[derive(Debug)]
pub struct OutputClassifier {
    result_marker: Regex,
    error_marker: Regex,
    thinking_marker: Regex,
}

impl OutputClassifier {
    /// Compile the marker set.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Patterns are literals; cannot fail to compile.
    pub fn new() -> Self {
        Self {
            result_marker: Regex::new(r#""type"\s*:\s*"result""#).unwrap(),
            error_marker: Regex::new(
                r"(?im)(panicked at|fatal error|traceback \(most recent call last\)|^error:|\bapi error\b|unhandled exception)",
            )
            .unwrap(),
            thinking_marker: Regex::new(r"(?i)\b(thinking|reasoning)\b|✻").unwrap(),
        }
    }

    /// Whether the output carries a structured result marker.
    #[must_use]
    pub fn is_complete(&self, output: &str) -> bool {
        self.result_marker.is_match(output)
    }

    /// Whether the output matches a known failure pattern.
    #[must_use]
    pub fn is_error(&self, output: &str) -> bool {
        self.error_marker.is_match(output)
    }

    /// Whether the output shows an active thinking indicator.
    #[must_use]
    pub fn is_thinking(&self, output: &str) -> bool {
        self.thinking_marker.is_match(output)
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new()
    }
}
