use crate::base_parser::{FormatHint, Parser};
use crate::batch::{BatchError, BatchResult};
use crate::config::StreamOptions;
use crate::delimiters::{is_header_segment, DelimiterSet};
use crate::errors::{IncompleteStreamError, ParseError, Position, SyntaxError, SyntaxErrorKind};
use crate::escape;
use crate::streaming::StreamingParser;
use crate::types::{Component, Field, Message, Repetition, Segment, Subcomponent};
use std::io::Read;
use tracing::{debug, warn};

/// Parse one ER7 message.
///
/// Segments are separated by `\r`; `\r\n` and bare `\n` are accepted too and
/// blank lines are skipped. The delimiters come from the leading `MSH`. On
/// failure nothing is returned but the error, which carries the segment and
/// field position and the byte offset into `text`.
pub fn parse(text: &str) -> Result<Message, SyntaxError> {
    let lines = segment_lines(text);
    let Some(&(first_offset, first)) = lines.first() else {
        return Err(SyntaxError::empty_input());
    };

    if !first.starts_with("MSH") {
        return Err(SyntaxError::new(
            SyntaxErrorKind::MissingMsh,
            Position::segment(1, first_offset),
            format!("message starts with {:?} instead of MSH", first.get(..3).unwrap_or(first)),
        ));
    }

    let (delimiters, _) = DelimiterSet::extract(first).map_err(|e| rebase(e, first_offset))?;

    let mut segments = Vec::with_capacity(lines.len());
    for (index, (offset, line)) in lines.iter().enumerate() {
        segments.push(parse_segment(line, &delimiters, index + 1, *offset)?);
    }

    let message = Message::new(delimiters, segments).map_err(|e| {
        SyntaxError::new(SyntaxErrorKind::MissingMsh, Position::segment(1, first_offset), e.to_string())
    })?;

    debug!(
        "Parsed ER7 message with {} segments (control id {:?})",
        message.segments().len(),
        message.control_id()
    );
    Ok(message)
}

/// Non-blank lines of `text` with their byte offsets. Any run of `\r` / `\n`
/// is a segment boundary.
pub(crate) fn segment_lines(text: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '\r' || c == '\n' {
            push_line(&mut lines, text, start, i);
            start = i + 1;
        }
    }
    push_line(&mut lines, text, start, text.len());
    lines
}

fn push_line<'a>(lines: &mut Vec<(usize, &'a str)>, text: &'a str, start: usize, end: usize) {
    let line = &text[start..end];
    if !line.trim().is_empty() {
        lines.push((start, line));
    }
}

fn rebase(mut error: SyntaxError, offset: usize) -> SyntaxError {
    error.position.offset += offset;
    error
}

/// Parse a single segment line (no terminator) with the given delimiters.
/// `segment` is its 1-based index and `offset` its byte offset in the input.
pub(crate) fn parse_segment(
    line: &str,
    delimiters: &DelimiterSet,
    segment: usize,
    offset: usize,
) -> Result<Segment, SyntaxError> {
    let name = line
        .get(..3)
        .filter(|n| n.chars().all(|c| c.is_ascii_alphanumeric()))
        .ok_or_else(|| {
            SyntaxError::new(
                SyntaxErrorKind::InvalidSegmentName,
                Position::segment(segment, offset),
                format!("invalid segment name in {:?}", line),
            )
        })?;

    let rest = &line[3..];
    if rest.is_empty() {
        return Ok(Segment::new(name));
    }

    let sep = delimiters.field();
    if !rest.starts_with(sep) {
        return Err(SyntaxError::new(
            SyntaxErrorKind::UnexpectedDelimiter,
            Position::segment(segment, offset + 3),
            format!("segment name {} is not followed by the field separator {:?}", name, sep),
        ));
    }

    let body_start = 3 + sep.len_utf8();
    let mut fields = Vec::new();

    let (body, body_start) = if is_header_segment(name) {
        let (declared, _) = DelimiterSet::from_header(line).map_err(|e| {
            let mut e = rebase(e, offset);
            e.position.segment = segment;
            e
        })?;
        if declared != *delimiters {
            return Err(SyntaxError::new(
                SyntaxErrorKind::UnexpectedDelimiter,
                Position { segment, field: 2, offset: offset + body_start, ..Position::default() },
                format!("{} declares {} but the message uses {}", name, declared, delimiters),
            ));
        }

        // fields 1 and 2 are taken literally
        let encoding_end = line[body_start..]
            .find(sep)
            .map_or(line.len(), |i| body_start + i);
        fields.push(Field::text(sep.to_string()));
        fields.push(Field::text(&line[body_start..encoding_end]));
        if encoding_end == line.len() {
            return Ok(Segment::with_fields(name, fields));
        }
        let next = encoding_end + sep.len_utf8();
        (&line[next..], next)
    } else {
        (&line[body_start..], body_start)
    };

    let first_field = fields.len() + 1;
    let base = Position::segment(segment, offset + body_start);
    for (i, (start, text)) in split_level(body, sep, delimiters, base, first_field)?.into_iter().enumerate() {
        let position = Position {
            field: first_field + i,
            offset: base.offset + start,
            ..base
        };
        fields.push(parse_field(text, delimiters, position)?);
    }

    Ok(Segment::with_fields(name, fields))
}

/// Split on `sep` outside escape runs, turning an unclosed run into a
/// positioned `UnterminatedEscape`.
fn split_level<'a>(
    text: &'a str,
    sep: char,
    delimiters: &DelimiterSet,
    base: Position,
    first_index: usize,
) -> Result<Vec<(usize, &'a str)>, SyntaxError> {
    split_escaped(text, sep, delimiters.escape()).map_err(|(at, piece)| {
        let mut position = Position {
            offset: base.offset + at,
            ..base
        };
        if position.field == 0 {
            position.field = first_index + piece;
        }
        SyntaxError::new(
            SyntaxErrorKind::UnterminatedEscape,
            position,
            format!("escape sequence opened at offset {} is never closed", base.offset + at),
        )
    })
}

/// Split `text` on `sep`, treating everything between a pair of escape
/// characters as opaque. Returns `(offset, piece)` pairs or, for an unclosed
/// escape, its offset and the 0-based piece it occurs in.
pub(crate) fn split_escaped(text: &str, sep: char, esc: char) -> Result<Vec<(usize, &str)>, (usize, usize)> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut open_escape = None;

    for (i, c) in text.char_indices() {
        if open_escape.is_some() {
            if c == esc {
                open_escape = None;
            }
            continue;
        }
        if c == esc {
            open_escape = Some(i);
        } else if c == sep {
            parts.push((start, &text[start..i]));
            start = i + c.len_utf8();
        }
    }

    if let Some(at) = open_escape {
        return Err((at, parts.len()));
    }
    parts.push((start, &text[start..]));
    Ok(parts)
}

fn parse_field(text: &str, delimiters: &DelimiterSet, position: Position) -> Result<Field, SyntaxError> {
    let pieces = split_level(text, delimiters.repetition(), delimiters, position, 0)?;
    let mut repetitions = Vec::with_capacity(pieces.len());
    for (i, (start, piece)) in pieces.into_iter().enumerate() {
        let position = Position {
            repetition: i + 1,
            offset: position.offset + start,
            ..position
        };
        repetitions.push(parse_repetition(piece, delimiters, position)?);
    }
    Ok(Field::new(repetitions))
}

fn parse_repetition(text: &str, delimiters: &DelimiterSet, position: Position) -> Result<Repetition, SyntaxError> {
    let pieces = split_level(text, delimiters.component(), delimiters, position, 0)?;
    let mut components = Vec::with_capacity(pieces.len());
    for (i, (start, piece)) in pieces.into_iter().enumerate() {
        let position = Position {
            component: i + 1,
            offset: position.offset + start,
            ..position
        };
        components.push(parse_component(piece, delimiters, position)?);
    }
    Ok(Repetition::new(components))
}

fn parse_component(text: &str, delimiters: &DelimiterSet, position: Position) -> Result<Component, SyntaxError> {
    let pieces = split_level(text, delimiters.subcomponent(), delimiters, position, 0)?;
    if pieces.len() == 1 {
        return Ok(Component::Text(decode_leaf(text, delimiters, position)?));
    }

    let mut subcomponents = Vec::with_capacity(pieces.len());
    for (start, piece) in pieces {
        let position = Position {
            offset: position.offset + start,
            ..position
        };
        subcomponents.push(decode_leaf(piece, delimiters, position)?);
    }
    Ok(Component::Subcomponents(subcomponents))
}

fn decode_leaf(raw: &str, delimiters: &DelimiterSet, position: Position) -> Result<Subcomponent, SyntaxError> {
    if !raw.contains(delimiters.escape()) {
        return Ok(Subcomponent::new(raw));
    }
    let value = escape::decode(raw, delimiters).map_err(|e| SyntaxError::from_encoding(e, position))?;
    if escape::encode(&value, delimiters) == raw {
        Ok(Subcomponent::new(value))
    } else {
        Ok(Subcomponent::with_source(value, raw.to_string()))
    }
}

/// ER7 parser for the registry: reads any number of messages from a reader,
/// skipping batch envelope segments. Error offsets are relative to the start
/// of the failing message.
#[derive(Debug, Clone, Default)]
pub struct Er7Parser {
    options: StreamOptions,
}

impl Er7Parser {
    pub fn with_options(options: StreamOptions) -> Self {
        Self { options }
    }
}

impl Parser for Er7Parser {
    fn name(&self) -> &'static str {
        "er7"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["hl7", "er7", "msg"]
    }

    fn format(&self) -> FormatHint {
        FormatHint::Er7
    }

    fn can_parse(&self, data: &[u8]) -> bool {
        let sample = String::from_utf8_lossy(data);
        sample.trim_start().starts_with("MSH")
    }

    fn parse(&self, mut reader: Box<dyn Read>) -> Result<BatchResult, ParseError> {
        let mut stream = StreamingParser::with_options(self.options.clone());
        let mut chunk = vec![0u8; self.options.chunk_size.max(1)];
        let mut result = BatchResult::default();
        let mut total = 0;

        loop {
            let read = reader.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            total += read;
            for parsed in stream.feed_bytes(&chunk[..read]) {
                record(&mut result, parsed);
            }
        }

        match stream.finish() {
            Ok(Some(last)) => result.messages.push(last),
            Ok(None) => {}
            Err(IncompleteStreamError { source: Some(error), .. }) => record(&mut result, Err(error)),
            Err(IncompleteStreamError { buffered, source: None }) => {
                let error = SyntaxError::new(
                    SyntaxErrorKind::IncompleteInput,
                    Position::at_offset(total.saturating_sub(buffered)),
                    "input ends inside a UTF-8 sequence",
                );
                record(&mut result, Err(error));
            }
        }

        if let Some(first) = result.messages.first() {
            result.envelope.delimiters = *first.delimiters();
        }
        debug!(
            "ER7 reader produced {} messages, {} failed",
            result.messages.len(),
            result.errors.len()
        );
        Ok(result)
    }
}

fn record(result: &mut BatchResult, parsed: Result<Message, SyntaxError>) {
    let index = result.messages.len() + result.errors.len();
    match parsed {
        Ok(message) => result.messages.push(message),
        Err(error) => {
            warn!("ER7 message {} failed to parse: {}", index, error);
            result.errors.push(BatchError { index, error });
        }
    }
}
