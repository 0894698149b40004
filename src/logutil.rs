//! Log helpers for mesh text. Radio payloads are user-controlled and often
//! multi-line; these keep every log record on one line and bounded.

use std::fmt::Write;

/// Escape control characters so `s` prints on a single line:
/// `\n`, `\r`, `\t` and backslash become two-character escapes, other control
/// characters become `\xNN`.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escaped preview of at most `max_bytes` of `s`, cut on a UTF-8 boundary,
/// with `...` appended when truncated.
pub fn preview(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return escape_log(s);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&s[..cut]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_controls() {
        assert_eq!(escape_log("a\nb\r\tc\\"), "a\\nb\\r\\tc\\\\");
        assert_eq!(escape_log("bell\u{7}"), "bell\\x07");
    }

    #[test]
    fn preview_never_splits_multibyte() {
        // em dash is 3 bytes; a cut at 7 would land inside it
        assert_eq!(preview("12345\u{2014}7890", 10), "12345...");
        assert_eq!(preview("ab\u{1F642}cd", 5), "ab...");
        assert_eq!(preview("hello", 10), "hello");
    }
}
