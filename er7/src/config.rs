use crate::ack::{generate_ack_with, AckSpec};
use crate::errors::{ParseError, StructuralError};
use crate::serializer::serialize_with;
use crate::streaming::StreamingParser;
use crate::types::Message;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Options for turning a tree back into ER7 text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializeOptions {
    /// Drop trailing empty fields, repetitions, components and
    /// subcomponents. Off by default so parsed input reproduces exactly.
    pub trim_trailing: bool,
    /// End the output with a segment terminator.
    pub trailing_terminator: bool,
}

/// Values used for ACK headers when the original message lacks them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckDefaults {
    pub version: String,
    pub processing_id: String,
}

impl Default for AckDefaults {
    fn default() -> Self {
        Self {
            version: "2.5".to_string(),
            processing_id: "P".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Bytes read per call when a stream is pulled from a reader.
    pub chunk_size: usize,
    /// Drop BHS/BTS/FHS/FTS lines instead of attaching them to a message.
    pub skip_envelope_segments: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            skip_envelope_segments: true,
        }
    }
}

/// Library-wide settings. Every section is optional in the JSON form.
///
/// ```json
/// { "serialize": { "trailing_terminator": true }, "ack": { "version": "2.3" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Er7Config {
    pub serialize: SerializeOptions,
    pub ack: AckDefaults,
    pub stream: StreamOptions,
}

impl Er7Config {
    pub fn from_json_str(text: &str) -> Result<Self, ParseError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ParseError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// ER7 text of `message` under the `serialize` section.
    pub fn serialize_message(&self, message: &Message) -> String {
        serialize_with(message, &self.serialize)
    }

    /// ACK for `original`, filling MSH-11/12 gaps from the `ack` section.
    pub fn generate_ack(&self, original: &Message, spec: &AckSpec) -> Result<Message, StructuralError> {
        generate_ack_with(original, spec, &self.ack)
    }

    pub fn streaming_parser(&self) -> StreamingParser {
        StreamingParser::with_options(self.stream.clone())
    }
}
