//! Invocation outcome classification.
//!
//! Decides whether an agent run succeeded from its exit code and output, and
//! distils a one-line reason when it did not. Only a fixed vocabulary of
//! transport/provider failure markers counts. Agents print the word "error"
//! constantly while doing perfectly normal work, so the bare word never does.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Fixed string an agent prints when it believes the whole checklist is done.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

const MAX_ERROR_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Success,
    /// Counts toward failover.
    Retryable,
    /// Ends the run. Only setup-level problems (missing executable) produce it.
    Fatal,
}

impl Classification {
    pub fn is_success(self) -> bool {
        self == Classification::Success
    }
}

static FAILURE_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(api error|rate limit|quota exceeded|authentication failed|connection refused|\btimeout\b|timed out|\b(?:429|500|502|503|504)\b|internal server error|bad gateway|service unavailable|gateway timeout|overloaded)",
    )
    .unwrap()
});

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(error|failed|timeout|timed out|refused)").unwrap());

/// True when the output carries one of the provider failure markers.
pub fn has_failure_marker(output: &str) -> bool {
    FAILURE_MARKERS.is_match(output)
}

/// Classify a finished invocation.
///
/// Success requires exit code 0, some non-whitespace output, and no failure
/// marker. Everything else is retryable.
pub fn classify(exit_code: i32, output: &str) -> Classification {
    if exit_code == 0 && !output.trim().is_empty() && !has_failure_marker(output) {
        Classification::Success
    } else {
        Classification::Retryable
    }
}

/// Build the concise last-error message for a failed invocation.
pub fn extract_error(exit_code: i32, output: &str) -> String {
    if exit_code != 0 {
        return format!("Exit code {exit_code}");
    }
    if output.trim().is_empty() {
        return "Empty output".to_string();
    }
    output
        .lines()
        .map(str::trim)
        .find(|line| ERROR_LINE.is_match(line) || FAILURE_MARKERS.is_match(line))
        .map(|line| truncate_chars(line, MAX_ERROR_LEN))
        .unwrap_or_else(|| "Unknown error".to_string())
}

/// True when `text` contains the completion marker.
pub fn detect_completion_marker(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_run_is_success() {
        assert_eq!(classify(0, "Implemented US-001, tests pass."), Classification::Success);
    }

    #[test]
    fn nonzero_exit_is_retryable() {
        assert_eq!(classify(1, "looks fine"), Classification::Retryable);
        assert_eq!(classify(-1, ""), Classification::Retryable);
    }

    #[test]
    fn empty_or_whitespace_output_is_retryable() {
        assert_eq!(classify(0, ""), Classification::Retryable);
        assert_eq!(classify(0, "  \n\t\n"), Classification::Retryable);
    }

    #[test]
    fn provider_markers_are_retryable() {
        for output in [
            "API Error: 500",
            "hit the rate limit, backing off",
            "Quota exceeded for project",
            "Authentication failed",
            "connect ECONNREFUSED: Connection refused",
            "request timeout",
            "operation timed out",
            "HTTP 502 from upstream",
            "status 503",
            "429 Too Many Requests",
            "Service Unavailable",
            "model is overloaded",
        ] {
            assert_eq!(classify(0, output), Classification::Retryable, "{output}");
        }
    }

    #[test]
    fn generic_error_word_is_not_a_failure() {
        assert_eq!(
            classify(0, "Fixed the error handling in parser.rs"),
            Classification::Success
        );
        assert_eq!(classify(0, "TypeError: fixed"), Classification::Success);
    }

    #[test]
    fn status_codes_need_word_boundaries() {
        assert_eq!(classify(0, "processed 15029 rows"), Classification::Success);
        assert_eq!(classify(0, "commit 4290abc"), Classification::Success);
    }

    #[test]
    fn classification_is_never_fatal_automatically() {
        for (code, out) in [(0, ""), (127, "command not found"), (0, "rate limit")] {
            assert_ne!(classify(code, out), Classification::Fatal);
        }
    }

    #[test]
    fn extract_error_prefers_exit_code() {
        assert_eq!(extract_error(2, "rate limit"), "Exit code 2");
    }

    #[test]
    fn extract_error_reports_empty_output() {
        assert_eq!(extract_error(0, "\n  \n"), "Empty output");
    }

    #[test]
    fn extract_error_finds_first_marker_line() {
        let output = "Starting work\nRequest failed: rate limit reached\nretrying later";
        assert_eq!(extract_error(0, output), "Request failed: rate limit reached");
    }

    #[test]
    fn extract_error_truncates_long_lines() {
        let line = format!("API error: {}", "x".repeat(300));
        let msg = extract_error(0, &line);
        assert_eq!(msg.chars().count(), MAX_ERROR_LEN);
        assert!(msg.starts_with("API error"));
    }

    #[test]
    fn extract_error_falls_back_to_unknown() {
        assert_eq!(extract_error(0, "all quiet"), "Unknown error");
    }

    #[test]
    fn completion_marker_detection() {
        assert!(detect_completion_marker("done\n<promise>COMPLETE</promise>\n"));
        assert!(!detect_completion_marker("<promise>complete</promise>"));
        assert!(!detect_completion_marker("COMPLETE"));
    }
}
