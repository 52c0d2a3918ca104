//! ER7 escape codec.
//!
//! Leaf values live in the tree in decoded form; these two functions convert
//! between that form and the escaped text found on the wire. Both are driven
//! by the message's own `DelimiterSet`.

use crate::delimiters::DelimiterSet;
use crate::errors::{EncodingError, EncodingErrorKind};

/// Decode every escape sequence in `raw`.
///
/// `\F\ \S\ \T\ \R\ \E\` become the corresponding delimiter, `\.br\` becomes a
/// line feed and `\Xhh..\` becomes the bytes it spells (UTF-8 when valid,
/// otherwise one Latin-1 character per byte). Vendor (`\Z..\`), highlighting
/// (`\H\`, `\N\`), character-set (`\C..\`, `\M..\`) and the remaining
/// formatting commands are kept verbatim for the caller to interpret.
pub fn decode(raw: &str, ds: &DelimiterSet) -> Result<String, EncodingError> {
    let esc = ds.escape();
    if !raw.contains(esc) {
        return Ok(raw.to_string());
    }

    let esc_len = esc.len_utf8();
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut consumed = 0;

    while let Some(start) = rest.find(esc) {
        out.push_str(&rest[..start]);
        let after = &rest[start + esc_len..];
        let end = match after.find(esc) {
            Some(end) => end,
            None => {
                return Err(EncodingError {
                    kind: EncodingErrorKind::UnterminatedEscape,
                    position: consumed + start,
                    sequence: rest[start..].to_string(),
                })
            }
        };

        let sequence_len = esc_len * 2 + end;
        let sequence = &rest[start..start + sequence_len];
        decode_tag(&after[..end], sequence, ds, &mut out).map_err(|kind| EncodingError {
            kind,
            position: consumed + start,
            sequence: sequence.to_string(),
        })?;

        consumed += start + sequence_len;
        rest = &rest[start + sequence_len..];
    }

    out.push_str(rest);
    Ok(out)
}

fn decode_tag(
    tag: &str,
    sequence: &str,
    ds: &DelimiterSet,
    out: &mut String,
) -> Result<(), EncodingErrorKind> {
    match tag {
        "F" => out.push(ds.field()),
        "S" => out.push(ds.component()),
        "T" => out.push(ds.subcomponent()),
        "R" => out.push(ds.repetition()),
        "E" => out.push(ds.escape()),
        ".br" => out.push('\n'),
        "H" | "N" => out.push_str(sequence),
        _ if tag.starts_with('X') => decode_hex(&tag[1..], out)?,
        _ if tag.starts_with('Z') => out.push_str(sequence),
        _ if (tag.starts_with('C') || tag.starts_with('M')) && is_hex_run(&tag[1..]) => {
            out.push_str(sequence)
        }
        _ if is_formatting_command(tag) => out.push_str(sequence),
        _ => return Err(EncodingErrorKind::InvalidEscape),
    }
    Ok(())
}

fn decode_hex(digits: &str, out: &mut String) -> Result<(), EncodingErrorKind> {
    if !is_hex_run(digits) || digits.len() % 2 != 0 {
        return Err(EncodingErrorKind::InvalidEscape);
    }
    let bytes = hex::decode(digits).map_err(|_| EncodingErrorKind::InvalidEscape)?;
    match String::from_utf8(bytes) {
        Ok(text) => out.push_str(&text),
        Err(e) => out.extend(e.into_bytes().into_iter().map(char::from)),
    }
    Ok(())
}

fn is_hex_run(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

// .sp/.sk take an optional count, .in/.ti an optional signed count
fn is_formatting_command(tag: &str) -> bool {
    if matches!(tag, ".ce" | ".fi" | ".nf") {
        return true;
    }
    let Some(command) = tag.get(..3) else {
        return false;
    };
    let arg = &tag[3..];
    match command {
        ".sp" | ".sk" => arg.chars().all(|c| c.is_ascii_digit()),
        ".in" | ".ti" => {
            let digits = arg.strip_prefix(['+', '-']).unwrap_or(arg);
            digits.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Escape every delimiter and escape character in `text`.
///
/// Line feeds become `\.br\` and carriage returns `\X0D\` so that the result
/// can never be mistaken for a segment boundary.
pub fn encode(text: &str, ds: &DelimiterSet) -> String {
    if !needs_encoding(text, ds) {
        return text.to_string();
    }

    let esc = ds.escape();
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        let tag = if c == ds.field() {
            "F"
        } else if c == ds.component() {
            "S"
        } else if c == ds.subcomponent() {
            "T"
        } else if c == ds.repetition() {
            "R"
        } else if c == esc {
            "E"
        } else if c == '\n' {
            ".br"
        } else if c == '\r' {
            "X0D"
        } else {
            out.push(c);
            continue;
        };
        out.push(esc);
        out.push_str(tag);
        out.push(esc);
    }
    out
}

/// True when `encode` would change `text`.
pub fn needs_encoding(text: &str, ds: &DelimiterSet) -> bool {
    text.chars()
        .any(|c| ds.is_delimiter(c) || c == '\n' || c == '\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds() -> DelimiterSet {
        DelimiterSet::default()
    }

    #[test]
    fn test_decode_field_separator() {
        assert_eq!(decode("DOE\\F\\JOHN", &ds()).unwrap(), "DOE|JOHN");
    }

    #[test]
    fn test_encode_field_separator() {
        assert_eq!(encode("DOE|JOHN", &ds()), "DOE\\F\\JOHN");
    }

    #[test]
    fn test_decode_all_delimiter_tags() {
        let decoded = decode("a\\F\\b\\S\\c\\T\\d\\R\\e\\E\\f", &ds()).unwrap();
        assert_eq!(decoded, "a|b^c&d~e\\f");
    }

    #[test]
    fn test_escape_law_holds() {
        let samples = [
            "",
            "plain",
            "|^~\\&",
            "\\\\\\",
            "line one\nline two",
            "cr\rinside",
            "mixed \\F\\ literal",
            "ünïcödé ^ 日本",
        ];
        for s in samples {
            assert_eq!(decode(&encode(s, &ds()), &ds()).unwrap(), s, "sample {:?}", s);
        }
    }

    #[test]
    fn test_escape_law_with_custom_delimiters() {
        let custom = DelimiterSet::new('#', '$', '*', '!', '@').unwrap();
        let s = "a#b$c*d!e@f|^~\\&";
        let encoded = encode(s, &custom);
        assert_eq!(encoded, "a!F!b!S!c!R!d!E!e!T!f|^~\\&");
        assert_eq!(decode(&encoded, &custom).unwrap(), s);
    }

    #[test]
    fn test_decode_line_break() {
        assert_eq!(decode("one\\.br\\two", &ds()).unwrap(), "one\ntwo");
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode("\\X414243\\", &ds()).unwrap(), "ABC");
        assert_eq!(decode("\\XC3A9\\", &ds()).unwrap(), "é");
        // not UTF-8, falls back to one char per byte
        assert_eq!(decode("\\XE9\\", &ds()).unwrap(), "é");
    }

    #[test]
    fn test_decode_hex_rejects_odd_digits() {
        let err = decode("\\X414\\", &ds()).unwrap_err();
        assert_eq!(err.kind, EncodingErrorKind::InvalidEscape);
        assert!(decode("\\X\\", &ds()).is_err());
        assert!(decode("\\XZZ\\", &ds()).is_err());
    }

    #[test]
    fn test_vendor_and_formatting_pass_through() {
        assert_eq!(decode("a\\Zvendor\\b", &ds()).unwrap(), "a\\Zvendor\\b");
        assert_eq!(decode("\\H\\bold\\N\\", &ds()).unwrap(), "\\H\\bold\\N\\");
        assert_eq!(decode("x\\.sp2\\y", &ds()).unwrap(), "x\\.sp2\\y");
        assert_eq!(decode("\\.in-4\\", &ds()).unwrap(), "\\.in-4\\");
        assert_eq!(decode("\\C2842\\", &ds()).unwrap(), "\\C2842\\");
    }

    #[test]
    fn test_unknown_tag_is_invalid() {
        let err = decode("abc\\Q\\def", &ds()).unwrap_err();
        assert_eq!(err.kind, EncodingErrorKind::InvalidEscape);
        assert_eq!(err.position, 3);
        assert_eq!(err.sequence, "\\Q\\");

        let err = decode("\\\\", &ds()).unwrap_err();
        assert_eq!(err.kind, EncodingErrorKind::InvalidEscape);
    }

    #[test]
    fn test_unterminated_escape() {
        let err = decode("ok\\F\\then\\F", &ds()).unwrap_err();
        assert_eq!(err.kind, EncodingErrorKind::UnterminatedEscape);
        assert_eq!(err.position, 9);
    }

    #[test]
    fn test_encode_newlines() {
        assert_eq!(encode("a\nb", &ds()), "a\\.br\\b");
        assert_eq!(encode("a\rb", &ds()), "a\\X0D\\b");
        assert!(!needs_encoding("nothing special", &ds()));
    }
}
