/// Escapes a string for the wire using the seven valid katcp escape sequences.
///
/// An empty string stays empty, which serializes as an empty argument token.
pub(crate) fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str(r"\\"),
            ' ' => out.push_str(r"\_"),
            '\0' => out.push_str(r"\0"),
            '\n' => out.push_str(r"\n"),
            '\r' => out.push_str(r"\r"),
            '\u{001B}' => out.push_str(r"\e"),
            '\t' => out.push_str(r"\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Decodes the escape sequences of a wire argument token.
///
/// The token must already have been validated by the parser, every `\` is
/// followed by one of the seven escape characters.
pub(crate) fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('_') => out.push(' '),
            Some('0') => out.push('\0'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('e') => out.push('\u{001B}'),
            Some('t') => out.push('\t'),
            _ => unreachable!("parser admitted an invalid escape"),
        }
    }
    out
}

#[cfg(test)]
mod strings {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(r"This\_is\_my\_foo\n", escape("This is my foo\n"));
        assert_eq!("This is my foo\n", unescape(r"This\_is\_my\_foo\n"));
    }

    #[test]
    fn test_escape_order() {
        // A literal backslash followed by an underscore must not collapse
        // into an escaped space on the way back
        assert_eq!(r"\\_", escape(r"\_"));
        assert_eq!(r"\_", unescape(r"\\_"));
    }

    #[test]
    fn test_empty() {
        assert_eq!("", escape(""));
        assert_eq!("", unescape(""));
    }

    #[test]
    fn test_all_escapes() {
        let raw = "\\ \0\n\r\u{001B}\t";
        assert_eq!(r"\\\_\0\n\r\e\t", escape(raw));
        assert_eq!(raw, unescape(r"\\\_\0\n\r\e\t"));
    }
}
