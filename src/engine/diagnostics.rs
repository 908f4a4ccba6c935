//! Rendering task errors for the activity archive.
//!
//! Archived text is later shown verbatim, so line endings are always `\n`
//! whatever platform produced the error.

use std::fmt::Write as _;

use tracing::debug;

/// Longest error message kept in an activity record, in characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// One-line message for the archive: the error and its causes, truncated.
/// `None` if the error could not be rendered.
pub fn error_message(error: &anyhow::Error) -> Option<String> {
    render(format_args!("{error:#}"), "message")
        .map(|text| truncate(&text, MAX_ERROR_MESSAGE_LEN))
}

/// Full diagnostic text: the cause chain plus the backtrace when one was
/// captured. `None` if the error could not be rendered.
pub fn stacktrace_for_persistence(error: &anyhow::Error) -> Option<String> {
    render(format_args!("{error:?}"), "stacktrace")
}

/// Format into a fresh buffer. A `Display`/`Debug` impl that fails makes
/// `format!` panic; here it only costs the text.
fn render(args: std::fmt::Arguments<'_>, what: &'static str) -> Option<String> {
    let mut out = String::new();
    match out.write_fmt(args) {
        Ok(()) => Some(normalize_line_endings(&out)),
        Err(e) => {
            debug!(error = %e, what, "failed to render task error");
            None
        }
    }
}

/// Replace `\r\n` and lone `\r` with `\n`.
pub fn normalize_line_endings(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carriage_returns_become_newlines() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\nd"), "a\nb\nc\nd");
        assert_eq!(normalize_line_endings("plain"), "plain");
    }

    #[test]
    fn message_includes_cause_chain() {
        let error = anyhow::anyhow!("disk full").context("failed to write report");
        assert_eq!(
            error_message(&error).as_deref(),
            Some("failed to write report: disk full")
        );
    }

    #[test]
    fn message_is_truncated_on_char_boundary() {
        let error = anyhow::anyhow!("é".repeat(MAX_ERROR_MESSAGE_LEN + 10));
        let message = error_message(&error).unwrap();
        assert_eq!(message.chars().count(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn stacktrace_lists_causes_without_carriage_returns() {
        let error = anyhow::anyhow!("line one\r\nline two").context("outer");
        let trace = stacktrace_for_persistence(&error).unwrap();
        assert!(trace.starts_with("outer"));
        assert!(trace.contains("Caused by:"));
        assert!(trace.contains("line one\n"));
        assert!(trace.contains("line two"));
        assert!(!trace.contains('\r'));
    }

    #[derive(Debug)]
    struct Unprintable;

    impl std::fmt::Display for Unprintable {
        fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Err(std::fmt::Error)
        }
    }

    impl std::error::Error for Unprintable {}

    #[test]
    fn unrenderable_error_degrades_to_none() {
        let error = anyhow::Error::new(Unprintable);
        assert_eq!(error_message(&error), None);
        assert_eq!(stacktrace_for_persistence(&error), None);
    }
}
