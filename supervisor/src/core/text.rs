//! Bounded text helpers for log tails and diagnostics.

/// Return at most the last `max_chars` characters of `text`, cut on a char boundary.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Diagnostic payload for a crash report; `"No output"` when the tail is blank.
pub fn diagnostic(text: &str, max_chars: usize) -> String {
    let tail = tail_chars(text, max_chars);
    if tail.trim().is_empty() {
        "No output".to_string()
    } else {
        tail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_short_text() {
        assert_eq!(tail_chars("abc", 10), "abc");
    }

    #[test]
    fn tail_cuts_from_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abcdef", 0), "");
    }

    #[test]
    fn tail_respects_multibyte_boundaries() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
    }

    #[test]
    fn blank_output_has_placeholder() {
        assert_eq!(diagnostic("  \n", 100), "No output");
        assert_eq!(diagnostic("boom", 100), "boom");
    }
}
