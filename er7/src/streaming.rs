use crate::config::StreamOptions;
use crate::delimiters::ENVELOPE_SEGMENTS;
use crate::er7_parser::parse;
use crate::errors::{IncompleteStreamError, SyntaxError};
use crate::types::Message;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    /// At the first byte of a line (or of a run of terminators).
    Start,
    /// Inside a line that belongs to the current message.
    Segment,
    /// Inside an envelope line that will be dropped.
    Envelope,
}

/// Incremental ER7 parser for text that arrives in pieces.
///
/// A message is known to be complete once the next line starting with `MSH`
/// (or an envelope segment) shows up, so each message is returned one feed
/// after it ends; the last one comes out of [`StreamingParser::finish`].
/// Consumed text is dropped from the internal buffer as messages are emitted.
#[derive(Debug, Clone)]
pub struct StreamingParser {
    options: StreamOptions,
    buffer: String,
    partial_utf8: Vec<u8>,
    cursor: usize,
    state: LineState,
    current: Option<usize>,
    emitted: usize,
}

impl Default for StreamingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingParser {
    pub fn new() -> Self {
        Self::with_options(StreamOptions::default())
    }

    pub fn with_options(options: StreamOptions) -> Self {
        Self {
            options,
            buffer: String::new(),
            partial_utf8: Vec::new(),
            cursor: 0,
            state: LineState::Start,
            current: None,
            emitted: 0,
        }
    }

    /// Bytes held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.partial_utf8.len()
    }

    /// Append text and return every message completed by it, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Result<Message, SyntaxError>> {
        self.buffer.push_str(chunk);
        let mut completed = Vec::new();

        loop {
            let rest = &self.buffer[self.cursor..];
            match self.state {
                LineState::Segment | LineState::Envelope => {
                    let Some(end) = rest.find(['\r', '\n']) else {
                        self.cursor = self.buffer.len();
                        break;
                    };
                    self.cursor += end;
                    if self.state == LineState::Envelope {
                        self.consume();
                    }
                    self.state = LineState::Start;
                }
                LineState::Start => {
                    let Some(first) = rest.chars().next() else {
                        break;
                    };
                    if first == '\r' || first == '\n' {
                        self.cursor += 1;
                        if self.current.is_none() {
                            self.consume();
                        }
                        continue;
                    }
                    if rest.len() < 3 && !rest.contains(['\r', '\n']) {
                        break;
                    }

                    let name = rest.get(..3).unwrap_or(rest);
                    if name == "MSH" {
                        self.complete(&mut completed);
                        self.current = Some(self.cursor);
                        self.state = LineState::Segment;
                    } else if self.options.skip_envelope_segments && ENVELOPE_SEGMENTS.contains(&name) {
                        self.complete(&mut completed);
                        self.state = LineState::Envelope;
                    } else {
                        if self.current.is_none() {
                            self.current = Some(self.cursor);
                        }
                        self.state = LineState::Segment;
                    }
                }
            }
        }

        completed
    }

    /// Like [`StreamingParser::feed`] for raw bytes. A UTF-8 sequence split
    /// across calls is held back until it is whole; invalid bytes become
    /// U+FFFD, so such input does not serialize back to the same bytes.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<Result<Message, SyntaxError>> {
        let mut data = std::mem::take(&mut self.partial_utf8);
        data.extend_from_slice(bytes);
        let whole = incomplete_tail_start(&data);
        self.partial_utf8 = data.split_off(whole);
        let text = String::from_utf8_lossy(&data).into_owned();
        self.feed(&text)
    }

    /// End of input: parse whatever is left as the final message.
    ///
    /// Returns `Ok(None)` when nothing but terminators or envelope lines
    /// remain.
    pub fn finish(self) -> Result<Option<Message>, IncompleteStreamError> {
        let buffered = self.buffered_len();
        if !self.partial_utf8.is_empty() {
            return Err(IncompleteStreamError { buffered, source: None });
        }

        let remainder = match self.current {
            Some(start) => &self.buffer[start..],
            None if self.state == LineState::Envelope => "",
            None => &self.buffer[self.cursor..],
        };
        if remainder.trim().is_empty() {
            return Ok(None);
        }

        match parse(remainder) {
            Ok(message) => {
                debug!("Stream finished after {} messages", self.emitted + 1);
                Ok(Some(message))
            }
            Err(e) => Err(IncompleteStreamError {
                buffered,
                source: Some(e),
            }),
        }
    }

    fn complete(&mut self, completed: &mut Vec<Result<Message, SyntaxError>>) {
        if let Some(start) = self.current.take() {
            let result = parse(&self.buffer[start..self.cursor]);
            self.emitted += 1;
            debug!(
                "Stream emitted message {} ({} bytes, ok: {})",
                self.emitted,
                self.cursor - start,
                result.is_ok()
            );
            completed.push(result);
        }
        self.consume();
    }

    // only valid while no message is open
    fn consume(&mut self) {
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
    }
}

/// Index where a trailing, not yet complete UTF-8 sequence begins, or
/// `data.len()` when there is none.
fn incomplete_tail_start(data: &[u8]) -> usize {
    for i in (data.len().saturating_sub(3)..data.len()).rev() {
        let byte = data[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if data.len() - i < needed { i } else { data.len() };
    }
    data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyntaxErrorKind;

    fn msg(control_id: &str) -> String {
        format!("MSH|^~\\&|A|B|C|D|20240101120000||ADT^A01|{}|P|2.5\rPID|||MRN{}\r", control_id, control_id)
    }

    fn collect(parser: &mut StreamingParser, text: &str, chunk: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        let bytes = text.as_bytes();
        for piece in bytes.chunks(chunk) {
            for result in parser.feed_bytes(piece) {
                messages.push(result.unwrap());
            }
        }
        messages
    }

    #[test]
    fn test_messages_complete_at_next_msh() {
        let mut parser = StreamingParser::new();
        assert!(parser.feed(&msg("1")).is_empty());

        let done = parser.feed(&msg("2"));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].as_ref().unwrap().control_id(), Some("1"));

        let last = parser.finish().unwrap().unwrap();
        assert_eq!(last.control_id(), Some("2"));
    }

    #[test]
    fn test_any_chunking_gives_the_same_messages() {
        let text = format!("{}{}{}", msg("1"), msg("2"), msg("3"));
        for chunk in [1, 2, 5, 17, 64, text.len()] {
            let mut parser = StreamingParser::new();
            let mut messages = collect(&mut parser, &text, chunk);
            messages.extend(parser.finish().unwrap());
            let ids: Vec<_> = messages.iter().map(|m| m.control_id().unwrap_or("").to_string()).collect();
            assert_eq!(ids, vec!["1", "2", "3"], "chunk size {}", chunk);
            assert_eq!(messages[2].segments().len(), 2);
        }
    }

    #[test]
    fn test_buffer_is_drained() {
        let mut parser = StreamingParser::new();
        parser.feed(&msg("1"));
        parser.feed(&msg("2"));
        assert_eq!(parser.buffered_len(), msg("2").len());
    }

    #[test]
    fn test_envelope_segments_are_skipped() {
        let text = format!("FHS|^~\\&\rBHS|^~\\&\r{}{}BTS|2\rFTS|1", msg("1"), msg("2"));
        let mut parser = StreamingParser::new();
        let mut messages = collect(&mut parser, &text, 9);
        messages.extend(parser.finish().unwrap());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].segments().len(), 2);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let text = "MSH|^~\\&|A\rPID|||||MÜLLER^JOSÉ";
        let mut parser = StreamingParser::new();
        let messages = collect(&mut parser, text, 1);
        assert!(messages.is_empty());
        let message = parser.finish().unwrap().unwrap();
        assert_eq!(message.get_str("PID-5-2"), Some("JOSÉ"));
    }

    #[test]
    fn test_invalid_bytes_become_replacement_characters() {
        let mut parser = StreamingParser::new();
        assert!(parser.feed_bytes(b"MSH|^~\\&|A\rPID|||M\xFFR").is_empty());
        let message = parser.finish().unwrap().unwrap();
        assert_eq!(message.get_str("PID-3"), Some("M\u{FFFD}R"));
    }

    #[test]
    fn test_bad_message_does_not_stop_the_stream() {
        let mut parser = StreamingParser::new();
        let text = format!("{}MSH|^~|broken\r{}", msg("1"), msg("3"));
        let results = parser.feed(&text);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind, SyntaxErrorKind::MalformedHeader);
        assert_eq!(parser.finish().unwrap().unwrap().control_id(), Some("3"));
    }

    #[test]
    fn test_finish_edge_cases() {
        assert!(StreamingParser::new().finish().unwrap().is_none());

        let mut parser = StreamingParser::new();
        parser.feed("\r\n\r\n");
        assert!(parser.finish().unwrap().is_none());

        let mut parser = StreamingParser::new();
        parser.feed("PID|||ORPHAN");
        let err = parser.finish().unwrap_err();
        assert_eq!(err.source.unwrap().kind, SyntaxErrorKind::MissingMsh);

        let mut parser = StreamingParser::new();
        parser.feed_bytes(&[b'M', b'S', b'H', 0xC3]);
        let err = parser.finish().unwrap_err();
        assert!(err.source.is_none());
        assert_eq!(err.buffered, 4);
    }

    #[test]
    fn test_envelopes_kept_when_not_skipping() {
        let options = StreamOptions {
            skip_envelope_segments: false,
            ..StreamOptions::default()
        };
        let mut parser = StreamingParser::with_options(options);
        assert!(parser.feed(&format!("{}BTS|1\r", msg("1"))).is_empty());
        let message = parser.finish().unwrap().unwrap();
        assert_eq!(message.segments().len(), 3);
        assert_eq!(message.segment_at(2).unwrap().name(), "BTS");
    }

    #[test]
    fn test_incomplete_tail_start() {
        assert_eq!(incomplete_tail_start(b"abc"), 3);
        assert_eq!(incomplete_tail_start(&[b'a', 0xC3]), 1);
        assert_eq!(incomplete_tail_start(&[b'a', 0xC3, 0xA9]), 3);
        assert_eq!(incomplete_tail_start(&[0xE2, 0x82]), 0);
        assert_eq!(incomplete_tail_start(&[]), 0);
    }
}
