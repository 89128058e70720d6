use std::borrow::Cow;

/// Remove control characters that have no place in names or titles.
///
/// Tabs, newlines and carriage returns survive. ANSI escape sequences
/// (`ESC [ ... final`) are removed whole; any other C0 byte, DEL or C1
/// control is dropped. Clean input is returned borrowed.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let needs_strip = s.chars().any(is_stripped);
    if !needs_strip {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // Parameter and intermediate bytes up to the final byte.
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        if !is_stripped(c) {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

fn is_stripped(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

/// Clean a folder name: strip controls, collapse runs of whitespace and trim.
/// Returns `None` when nothing printable is left.
pub fn clean_name(name: &str) -> Option<String> {
    let stripped = strip_control_chars(name);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Plain-text excerpt of an HTML fragment, at most `max_chars` characters.
///
/// Tags are dropped, entities decoded and whitespace collapsed. Longer text
/// is cut at the last word boundary and suffixed with `...`.
pub fn summarize(html: &str, max_chars: usize) -> String {
    let mut text = String::with_capacity(html.len().min(max_chars * 4));
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let decoded = html_escape::decode_html_entities(&text);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    let trimmed = match cut.rfind(' ') {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}...", trimmed.trim_end())
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`
/// pattern.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_clean_text_returns_borrowed() {
        assert!(matches!(strip_control_chars("Hello\tworld\n"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_control_chars_removes_controls() {
        assert_eq!(strip_control_chars("a\x00b\x07c\x7fd"), "abcd");
        assert_eq!(strip_control_chars("x\u{0085}y"), "xy");
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_control_chars("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_control_chars("bare\x1besc"), "bareesc");
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("  Tech \n  News\x00 ").as_deref(), Some("Tech News"));
        assert_eq!(clean_name(" \t\x01 "), None);
    }

    #[test]
    fn test_summarize_strips_markup() {
        assert_eq!(
            summarize("<p>Fish &amp; <b>chips</b></p><p>today</p>", 200),
            "Fish & chips today"
        );
    }

    #[test]
    fn test_summarize_truncates_on_word_boundary() {
        let body = "one two three four five six";
        assert_eq!(summarize(body, 12), "one two...");
        assert_eq!(summarize("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn test_summarize_multibyte() {
        let s = summarize(&"é".repeat(300), 10);
        assert_eq!(s.chars().count(), 13);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like(r"50%_off\now"), r"50\%\_off\\now");
    }
}
