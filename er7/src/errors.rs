use serde::{Deserialize, Serialize};
use std::fmt;

/// Where in a message an error was detected.
///
/// Indices are 1-based; `0` means "not applicable" (e.g. an error in the
/// segment name has no field). `offset` is a byte offset into the text handed
/// to the parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub segment: usize,
    pub field: usize,
    pub repetition: usize,
    pub component: usize,
    pub offset: usize,
}

impl Position {
    pub fn at_offset(offset: usize) -> Self {
        Self { offset, ..Self::default() }
    }

    pub fn segment(segment: usize, offset: usize) -> Self {
        Self { segment, offset, ..Self::default() }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segment == 0 {
            return write!(f, "offset {}", self.offset);
        }
        write!(f, "segment {}", self.segment)?;
        if self.field > 0 {
            write!(f, ", field {}", self.field)?;
        }
        if self.repetition > 1 {
            write!(f, ", repetition {}", self.repetition)?;
        }
        if self.component > 1 {
            write!(f, ", component {}", self.component)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyntaxErrorKind {
    EmptyInput,
    MissingMsh,
    MalformedHeader,
    UnterminatedEscape,
    UnexpectedDelimiter,
    InvalidEscape,
    InvalidSegmentName,
    MissingBatchHeader,
    IncompleteInput,
}

impl fmt::Display for SyntaxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyntaxErrorKind::EmptyInput => "empty input",
            SyntaxErrorKind::MissingMsh => "missing MSH",
            SyntaxErrorKind::MalformedHeader => "malformed header",
            SyntaxErrorKind::UnterminatedEscape => "unterminated escape",
            SyntaxErrorKind::UnexpectedDelimiter => "unexpected delimiter",
            SyntaxErrorKind::InvalidEscape => "invalid escape",
            SyntaxErrorKind::InvalidSegmentName => "invalid segment name",
            SyntaxErrorKind::MissingBatchHeader => "missing batch header",
            SyntaxErrorKind::IncompleteInput => "incomplete input",
        };
        f.write_str(name)
    }
}

/// Parser-level failure. Parsing aborts on the first one; no partial tree is
/// ever returned alongside it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{position}: {reason}")]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub position: Position,
    pub reason: String,
    #[source]
    pub source: Option<EncodingError>,
}

impl SyntaxError {
    pub fn new(kind: SyntaxErrorKind, position: Position, reason: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn empty_input() -> Self {
        Self::new(SyntaxErrorKind::EmptyInput, Position::default(), "empty input")
    }

    /// Lift a codec error raised while decoding a leaf. `base` is the position
    /// of the leaf; the codec's own offset is relative to the leaf text.
    pub fn from_encoding(error: EncodingError, base: Position) -> Self {
        let kind = match error.kind {
            EncodingErrorKind::InvalidEscape => SyntaxErrorKind::InvalidEscape,
            EncodingErrorKind::UnterminatedEscape => SyntaxErrorKind::UnterminatedEscape,
        };
        let position = Position {
            offset: base.offset + error.position,
            ..base
        };
        Self {
            kind,
            position,
            reason: error.to_string(),
            source: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncodingErrorKind {
    InvalidEscape,
    UnterminatedEscape,
}

impl fmt::Display for EncodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingErrorKind::InvalidEscape => f.write_str("invalid escape sequence"),
            EncodingErrorKind::UnterminatedEscape => f.write_str("unterminated escape sequence"),
        }
    }
}

/// Escape codec failure. `position` is the byte offset of the opening escape
/// character inside the decoded text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} {sequence:?} at offset {position}")]
pub struct EncodingError {
    pub kind: EncodingErrorKind,
    pub position: usize,
    pub sequence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuralErrorKind {
    CardinalityViolation,
    UnknownSegment,
    MissingMsh,
    DatatypeViolation,
    TableViolation,
    HeaderMismatch,
}

impl fmt::Display for StructuralErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StructuralErrorKind::CardinalityViolation => "cardinality violation",
            StructuralErrorKind::UnknownSegment => "unknown segment",
            StructuralErrorKind::MissingMsh => "missing MSH",
            StructuralErrorKind::DatatypeViolation => "datatype violation",
            StructuralErrorKind::TableViolation => "table violation",
            StructuralErrorKind::HeaderMismatch => "header mismatch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StructuralError {
    pub kind: StructuralErrorKind,
    pub message: String,
}

impl StructuralError {
    pub fn new(kind: StructuralErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_msh() -> Self {
        Self::new(StructuralErrorKind::MissingMsh, "message has no MSH segment")
    }
}

/// Raised by `StreamingParser::finish` when buffered input does not form a
/// complete message.
#[derive(Debug, thiserror::Error)]
#[error("stream ended with {buffered} unparsed bytes")]
pub struct IncompleteStreamError {
    pub buffered: usize,
    #[source]
    pub source: Option<SyntaxError>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("ER7 syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("Incomplete stream: {0}")]
    IncompleteStream(#[from] IncompleteStreamError),
    #[error("{0}")]
    Custom(String),
}

impl From<String> for ParseError {
    fn from(msg: String) -> Self {
        ParseError::Custom(msg)
    }
}

impl From<&str> for ParseError {
    fn from(msg: &str) -> Self {
        ParseError::Custom(msg.to_string())
    }
}
