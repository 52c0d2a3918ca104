use crate::errors::{Position, SyntaxError, SyntaxErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment boundary used when emitting ER7 text.
pub const SEGMENT_TERMINATOR: char = '\r';

/// Segments whose fields 1 and 2 declare the delimiters instead of carrying
/// data.
pub const HEADER_SEGMENTS: [&str; 3] = ["MSH", "BHS", "FHS"];

/// Batch and file envelope segments.
pub const ENVELOPE_SEGMENTS: [&str; 4] = ["FHS", "BHS", "BTS", "FTS"];

pub fn is_header_segment(name: &str) -> bool {
    HEADER_SEGMENTS.contains(&name)
}

/// The five separator characters a message declares in MSH-1 and MSH-2.
///
/// Once bound to a `Message` the set never changes. The default (`|^~\&`) is
/// only meant for building messages from scratch; parsed messages always
/// carry whatever their own header declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DelimiterSet {
    field: char,
    component: char,
    repetition: char,
    escape: char,
    subcomponent: char,
}

impl DelimiterSet {
    /// Build a set from explicit characters.
    ///
    /// Fails with `MalformedHeader` when two characters coincide or one of
    /// them is a segment terminator.
    pub fn new(
        field: char,
        component: char,
        repetition: char,
        escape: char,
        subcomponent: char,
    ) -> Result<Self, SyntaxError> {
        let chars = [field, component, repetition, escape, subcomponent];
        for (i, c) in chars.iter().enumerate() {
            if *c == '\r' || *c == '\n' {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::MalformedHeader,
                    Position::segment(1, 3 + i),
                    "delimiter cannot be a segment terminator",
                ));
            }
            if chars[..i].contains(c) {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::MalformedHeader,
                    Position::segment(1, 3 + i),
                    format!("delimiter {:?} is declared twice", c),
                ));
            }
        }

        Ok(Self {
            field,
            component,
            repetition,
            escape,
            subcomponent,
        })
    }

    /// Read the delimiters declared by a leading `MSH` segment.
    ///
    /// Returns the set and the byte offset just past the four encoding
    /// characters.
    pub fn extract(text: &str) -> Result<(Self, usize), SyntaxError> {
        if !text.starts_with("MSH") {
            return Err(SyntaxError::new(
                SyntaxErrorKind::MissingMsh,
                Position::segment(1, 0),
                "message does not start with MSH",
            ));
        }
        Self::read_declaration(text)
    }

    /// Like [`DelimiterSet::extract`] but also accepts `BHS` and `FHS`
    /// envelope headers.
    pub fn from_header(text: &str) -> Result<(Self, usize), SyntaxError> {
        match text.get(..3) {
            Some(name) if is_header_segment(name) => Self::read_declaration(text),
            _ => Err(SyntaxError::new(
                SyntaxErrorKind::MissingBatchHeader,
                Position::segment(1, 0),
                "text does not start with MSH, BHS or FHS",
            )),
        }
    }

    fn read_declaration(text: &str) -> Result<(Self, usize), SyntaxError> {
        let mut chars = text[3..].chars();
        let field = match chars.next() {
            Some(c) if c != '\r' && c != '\n' => c,
            _ => {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::MalformedHeader,
                    Position { segment: 1, field: 1, offset: 3, ..Position::default() },
                    "header has no field separator",
                ))
            }
        };

        let mut offset = 3 + field.len_utf8();
        let mut encoding = ['\0'; 4];
        for (found, slot) in encoding.iter_mut().enumerate() {
            match chars.next() {
                Some(c) if c != field && c != '\r' && c != '\n' => {
                    *slot = c;
                    offset += c.len_utf8();
                }
                _ => {
                    return Err(SyntaxError::new(
                        SyntaxErrorKind::MalformedHeader,
                        Position { segment: 1, field: 2, offset, ..Position::default() },
                        format!("expected 4 encoding characters, found {}", found),
                    ))
                }
            }
        }

        let set = Self::new(field, encoding[0], encoding[1], encoding[2], encoding[3])?;
        Ok((set, offset))
    }

    pub fn field(&self) -> char {
        self.field
    }

    pub fn component(&self) -> char {
        self.component
    }

    pub fn repetition(&self) -> char {
        self.repetition
    }

    pub fn escape(&self) -> char {
        self.escape
    }

    pub fn subcomponent(&self) -> char {
        self.subcomponent
    }

    /// MSH-2 as it appears on the wire: component, repetition, escape,
    /// subcomponent.
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    /// True for any of the five delimiter characters.
    pub fn is_delimiter(&self, c: char) -> bool {
        c == self.field
            || c == self.component
            || c == self.repetition
            || c == self.escape
            || c == self.subcomponent
    }
}

impl Default for DelimiterSet {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl fmt::Display for DelimiterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.field, self.encoding_characters())
    }
}

impl TryFrom<String> for DelimiterSet {
    type Error = SyntaxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() != 5 {
            return Err(SyntaxError::new(
                SyntaxErrorKind::MalformedHeader,
                Position::default(),
                format!("expected 5 delimiter characters, found {}", chars.len()),
            ));
        }
        Self::new(chars[0], chars[1], chars[2], chars[3], chars[4])
    }
}

impl From<DelimiterSet> for String {
    fn from(value: DelimiterSet) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_default_delimiters() {
        let (ds, offset) = DelimiterSet::extract("MSH|^~\\&|A|B").unwrap();
        assert_eq!(ds, DelimiterSet::default());
        assert_eq!(offset, 8);
        assert_eq!(ds.encoding_characters(), "^~\\&");
    }

    #[test]
    fn test_extract_custom_delimiters() {
        let (ds, _) = DelimiterSet::extract("MSH#$*!@#APP").unwrap();
        assert_eq!(ds.field(), '#');
        assert_eq!(ds.component(), '$');
        assert_eq!(ds.repetition(), '*');
        assert_eq!(ds.escape(), '!');
        assert_eq!(ds.subcomponent(), '@');
    }

    #[test]
    fn test_extract_requires_msh() {
        let err = DelimiterSet::extract("PID|^~\\&").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::MissingMsh);
    }

    #[test]
    fn test_extract_short_header_is_malformed() {
        let err = DelimiterSet::extract("MSH|^~|A").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::MalformedHeader);

        let err = DelimiterSet::extract("MSH|^~\\").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::MalformedHeader);

        let err = DelimiterSet::extract("MSH").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::MalformedHeader);
    }

    #[test]
    fn test_extract_rejects_duplicates() {
        let err = DelimiterSet::extract("MSH|^^\\&|A").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::MalformedHeader);
    }

    #[test]
    fn test_from_header_accepts_envelopes() {
        assert!(DelimiterSet::from_header("BHS|^~\\&|X").is_ok());
        assert!(DelimiterSet::from_header("FHS|^~\\&").is_ok());
        let err = DelimiterSet::from_header("PID|1").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::MissingBatchHeader);
    }

    #[test]
    fn test_serde_string_form() {
        let json = serde_json::to_string(&DelimiterSet::default()).unwrap();
        assert_eq!(json, r#""|^~\\&""#);
        let back: DelimiterSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DelimiterSet::default());
        assert!(serde_json::from_str::<DelimiterSet>(r#""||~\\&""#).is_err());
    }
}
