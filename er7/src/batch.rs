//! Batch (`BHS`..`BTS`) and file (`FHS`..`FTS`) envelopes.

use crate::base_parser::{FormatHint, Parser};
use crate::config::SerializeOptions;
use crate::delimiters::{DelimiterSet, ENVELOPE_SEGMENTS, SEGMENT_TERMINATOR};
use crate::er7_parser::{parse, parse_segment, segment_lines};
use crate::errors::{ParseError, SyntaxError};
use crate::serializer::{serialize, write_segment};
use crate::types::{Field, Message, Segment};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::{debug, info, warn};

/// Envelope segments around the messages of a batch. Every part is optional:
/// a plain run of messages has an empty envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub delimiters: DelimiterSet,
    pub file_header: Option<Segment>,
    pub header: Option<Segment>,
    pub trailer: Option<Segment>,
    pub file_trailer: Option<Segment>,
}

impl Envelope {
    pub fn is_empty(&self) -> bool {
        self.file_header.is_none()
            && self.header.is_none()
            && self.trailer.is_none()
            && self.file_trailer.is_none()
    }

    /// BHS-11.
    pub fn batch_control_id(&self) -> Option<&str> {
        self.header
            .as_ref()
            .and_then(|bhs| bhs.value(11))
            .filter(|v| !v.is_empty())
    }
}

/// A message of the batch that failed to parse. `index` is its 0-based
/// ordinal among the batch's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    pub index: usize,
    pub error: SyntaxError,
}

/// Everything read from one batch. A member that fails to parse lands in
/// `errors`; an envelope segment that fails lands in `envelope_errors`.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub envelope: Envelope,
    pub messages: Vec<Message>,
    pub errors: Vec<BatchError>,
    pub envelope_errors: Vec<SyntaxError>,
}

impl BatchResult {
    /// Message count declared in BTS-1.
    pub fn trailer_count(&self) -> Option<usize> {
        self.envelope
            .trailer
            .as_ref()
            .and_then(|bts| bts.value(1))
            .and_then(|v| v.trim().parse().ok())
    }

    /// True when BTS-1 is absent or equals the number of messages found,
    /// failed ones included.
    pub fn count_matches(&self) -> bool {
        self.trailer_count()
            .map_or(true, |n| n == self.messages.len() + self.errors.len())
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.envelope_errors.is_empty()
    }
}

/// Split a batch into its envelope and messages.
///
/// Each message is parsed on its own; one that fails is recorded in
/// `errors` and the rest still come through. Text starting directly with
/// `MSH` is taken as an envelope-less batch whose delimiters are those of
/// its first good message. Only a missing or undeclarable envelope header
/// fails the whole call.
pub fn parse_batch(text: &str) -> Result<BatchResult, SyntaxError> {
    let lines = segment_lines(text);
    let Some(&(_, first)) = lines.first() else {
        return Err(SyntaxError::empty_input());
    };

    let declared = if first.starts_with("MSH") {
        None
    } else {
        Some(DelimiterSet::from_header(first)?.0)
    };

    // byte ranges of each message in `text`
    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut open: Option<(usize, usize)> = None;
    // (segment number, offset, line)
    let mut envelope_lines = Vec::new();

    for (index, &(offset, line)) in lines.iter().enumerate() {
        let end = offset + line.len();
        let name = line.get(..3).unwrap_or(line);

        if ENVELOPE_SEGMENTS.contains(&name) {
            groups.extend(open.take());
            envelope_lines.push((index + 1, offset, line));
        } else if name != "MSH" && open.is_some() {
            if let Some(group) = open.as_mut() {
                group.1 = end;
            }
        } else {
            groups.extend(open.take());
            open = Some((offset, end));
        }
    }
    groups.extend(open);

    let mut result = BatchResult::default();
    for (index, (start, end)) in groups.into_iter().enumerate() {
        match parse(&text[start..end]) {
            Ok(message) => result.messages.push(message),
            Err(mut error) => {
                error.position.offset += start;
                warn!("Batch message {} failed to parse: {}", index, error);
                result.errors.push(BatchError { index, error });
            }
        }
    }

    let delimiters = declared
        .or_else(|| result.messages.first().map(|m| *m.delimiters()))
        .unwrap_or_default();
    result.envelope.delimiters = delimiters;
    for (segment, offset, line) in envelope_lines {
        match parse_segment(line, &delimiters, segment, offset) {
            Ok(parsed) => place(&mut result.envelope, parsed, segment),
            Err(error) => {
                warn!("Envelope segment {} failed to parse: {}", segment, error);
                result.envelope_errors.push(error);
            }
        }
    }

    if !result.count_matches() {
        warn!(
            "BTS declares {:?} messages but the batch holds {}",
            result.trailer_count(),
            result.messages.len() + result.errors.len()
        );
    }
    debug!(
        "Parsed batch: {} messages, {} errors",
        result.messages.len(),
        result.errors.len() + result.envelope_errors.len()
    );
    Ok(result)
}

// Nested batches are flattened: the first header and the last trailer win.
fn place(envelope: &mut Envelope, segment: Segment, number: usize) {
    let slot = match segment.name() {
        "FHS" => &mut envelope.file_header,
        "BHS" => &mut envelope.header,
        "BTS" => &mut envelope.trailer,
        _ => &mut envelope.file_trailer,
    };

    if slot.is_none() {
        *slot = Some(segment);
    } else if segment.is_header() {
        warn!("Flattening nested batch: ignoring extra {} at segment {}", segment.name(), number);
    } else {
        warn!("Flattening nested batch: {} at segment {} replaces an earlier one", segment.name(), number);
        *slot = Some(segment);
    }
}

/// Emit `FHS? BHS? <messages> BTS? FTS?` with segments joined by `\r`.
pub fn wrap(envelope: &Envelope, messages: &[Message]) -> String {
    let render = |segment: &Segment| {
        let mut out = String::new();
        write_segment(&mut out, segment, &envelope.delimiters, &SerializeOptions::default());
        out
    };

    let mut parts: Vec<String> = Vec::with_capacity(messages.len() + 4);
    parts.extend(envelope.file_header.iter().map(render));
    parts.extend(envelope.header.iter().map(render));
    parts.extend(messages.iter().map(serialize));
    parts.extend(envelope.trailer.iter().map(render));
    parts.extend(envelope.file_trailer.iter().map(render));

    let mut buf = [0u8; 4];
    parts.join(&*SEGMENT_TERMINATOR.encode_utf8(&mut buf))
}

/// Builds the envelope for an outgoing batch.
#[derive(Debug, Clone, Default)]
pub struct BatchBuilder {
    delimiters: DelimiterSet,
    sending_application: Option<String>,
    sending_facility: Option<String>,
    receiving_application: Option<String>,
    receiving_facility: Option<String>,
    created: Option<NaiveDateTime>,
    comment: Option<String>,
    control_id: Option<String>,
    file_envelope: bool,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delimiters(mut self, delimiters: DelimiterSet) -> Self {
        self.delimiters = delimiters;
        self
    }

    pub fn sending(mut self, application: impl Into<String>, facility: impl Into<String>) -> Self {
        self.sending_application = Some(application.into());
        self.sending_facility = Some(facility.into());
        self
    }

    pub fn receiving(mut self, application: impl Into<String>, facility: impl Into<String>) -> Self {
        self.receiving_application = Some(application.into());
        self.receiving_facility = Some(facility.into());
        self
    }

    /// BHS-7; defaults to the local time when `build` runs.
    pub fn created_at(mut self, created: NaiveDateTime) -> Self {
        self.created = Some(created);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn control_id(mut self, control_id: impl Into<String>) -> Self {
        self.control_id = Some(control_id.into());
        self
    }

    /// Also wrap the batch in FHS/FTS.
    pub fn with_file_envelope(mut self) -> Self {
        self.file_envelope = true;
        self
    }

    pub fn build(&self, message_count: usize) -> Envelope {
        let created = self
            .created
            .unwrap_or_else(|| Local::now().naive_local())
            .format("%Y%m%d%H%M%S")
            .to_string();

        let header = self.header("BHS", &created);
        let mut trailer = Segment::new("BTS");
        trailer.set_field(1, Field::text(message_count.to_string()));

        let (file_header, file_trailer) = if self.file_envelope {
            let mut fts = Segment::new("FTS");
            fts.set_field(1, Field::text("1"));
            (Some(self.header("FHS", &created)), Some(fts))
        } else {
            (None, None)
        };

        Envelope {
            delimiters: self.delimiters,
            file_header,
            header: Some(header),
            trailer: Some(trailer),
            file_trailer,
        }
    }

    fn header(&self, name: &str, created: &str) -> Segment {
        let mut segment = Segment::header(name, &self.delimiters);
        let values = [
            (3, &self.sending_application),
            (4, &self.sending_facility),
            (5, &self.receiving_application),
            (6, &self.receiving_facility),
            (10, &self.comment),
            (11, &self.control_id),
        ];
        segment.set_field(7, Field::text(created));
        for (index, value) in values {
            if let Some(value) = value {
                segment.set_field(index, Field::text(value.as_str()));
            }
        }
        segment
    }
}

/// Registry adapter for batch files.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchParser;

impl Parser for BatchParser {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["bhs", "batch"]
    }

    fn format(&self) -> FormatHint {
        FormatHint::Batch
    }

    fn can_parse(&self, data: &[u8]) -> bool {
        let sample = String::from_utf8_lossy(data);
        let trimmed = sample.trim_start();
        trimmed.starts_with("BHS") || trimmed.starts_with("FHS")
    }

    fn parse(&self, mut reader: Box<dyn Read>) -> Result<BatchResult, ParseError> {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        info!("Read {} bytes of batch data", buffer.len());

        let result = parse_batch(&String::from_utf8_lossy(&buffer))?;
        info!(
            "Batch parsing complete: {} messages parsed, {} failed, batch id {:?}",
            result.messages.len(),
            result.errors.len(),
            result.envelope.batch_control_id()
        );
        Ok(result)
    }
}
