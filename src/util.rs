//! Small helpers shared by the store, the session manager and the CLI.

use chrono::{DateTime, SubsecRound, Utc};

/// Current time at the precision the store persists (microseconds).
///
/// Values produced here survive a store round trip unchanged, which keeps
/// in-memory copies equal to what a later read returns.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Cuts on character boundaries, so prompts with emoji or CJK text are safe.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Collapse newlines and runs of whitespace so a prompt fits on one line.
pub fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_now_has_microsecond_precision() {
        let ts = timestamp_now();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn truncate_short_prompt_unchanged() {
        assert_eq!(truncate_with_ellipsis("a red fox", 20), "a red fox");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn truncate_long_prompt_trims_trailing_space() {
        assert_eq!(
            truncate_with_ellipsis("a watercolor lighthouse at dusk", 13),
            "a watercolor..."
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "夕焼けの灯台と海";
        assert_eq!(truncate_with_ellipsis(s, 3), "夕焼け...");
        assert_eq!(truncate_with_ellipsis("🦀🦀🦀", 1), "🦀...");
    }

    #[test]
    fn single_line_collapses_whitespace() {
        assert_eq!(single_line("make it\n  bluer\t please"), "make it bluer please");
    }
}
