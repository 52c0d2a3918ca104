use crate::batch::BatchResult;
use crate::delimiters::DelimiterSet;
use crate::ParseError;
use std::io::Read;

/// Base trait that all parsers must implement
/// Uses Box<dyn Read> to be object-safe (dyn compatible)
pub trait Parser: Send + Sync {
    /// Returns the name of this parser (e.g., "er7", "batch", "json")
    fn name(&self) -> &'static str;

    /// Returns the file extensions this parser supports (e.g., ["hl7", "er7"])
    fn extensions(&self) -> &'static [&'static str];

    /// The content hint this parser answers to; custom parsers are only
    /// picked through `can_parse`
    fn format(&self) -> FormatHint {
        FormatHint::Unknown
    }

    /// Checks if this parser can handle the given data by inspecting content
    fn can_parse(&self, data: &[u8]) -> bool;

    /// Read every message from `reader`. A message that fails to parse is
    /// reported in the result's `errors` and does not stop the others; only
    /// I/O and whole-input failures are returned as `Err`.
    fn parse(&self, reader: Box<dyn Read>) -> Result<BatchResult, ParseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    /// Messages starting with `MSH`
    Er7,
    /// `FHS`/`BHS` envelope
    Batch,
    /// Message trees as JSON
    Json,
    Unknown,
}

/// First line of the sample, without a byte order mark or leading blanks.
fn leading_line(data: &[u8]) -> String {
    let sample = String::from_utf8_lossy(data);
    let trimmed = sample.trim_start_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    let end = trimmed.find(['\r', '\n']).unwrap_or(trimmed.len());
    trimmed[..end].to_string()
}

/// Helper to detect format from content
pub fn detect_format(data: &[u8]) -> FormatHint {
    let line = leading_line(data);
    match line.get(..3) {
        Some("MSH") => FormatHint::Er7,
        Some("BHS") | Some("FHS") => FormatHint::Batch,
        _ if line.starts_with('[') || line.starts_with('{') => FormatHint::Json,
        _ => FormatHint::Unknown,
    }
}

/// Delimiters declared by the header the sample starts with, if it is a
/// well-formed `MSH`, `BHS` or `FHS`.
pub fn sniff_delimiters(data: &[u8]) -> Option<DelimiterSet> {
    DelimiterSet::from_header(&leading_line(data)).ok().map(|(set, _)| set)
}
