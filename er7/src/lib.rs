// HL7 v2.x ER7 message toolkit
// Message tree, parser/serializer, validation, batches, ACKs, diffs and sequencing

pub mod types;
pub mod path;
pub mod delimiters;
pub mod escape;
pub mod errors;
pub mod config;
pub mod base_parser;
pub mod parsers;
pub mod registry_parser;

// Wire format
pub mod er7_parser;
pub mod serializer;
pub mod streaming;
pub mod batch;
pub mod json_parser;

// Message-level processing
pub mod definitions;
pub mod validation;
pub mod ack;
pub mod diff;
pub mod sequencing;

// Re-export main types
pub use types::*;
pub use path::{FieldPath, InvalidPathError};
pub use delimiters::DelimiterSet;
pub use errors::*;
pub use config::{AckDefaults, Er7Config, SerializeOptions, StreamOptions};
pub use base_parser::{Parser, FormatHint};
pub use registry_parser::ParserRegistry;

pub use er7_parser::parse;
pub use serializer::{serialize, serialize_with};
pub use streaming::StreamingParser;
pub use batch::{parse_batch, wrap, BatchBuilder, BatchError, BatchResult, Envelope};
pub use validation::{validate, Severity, StructuralValidator, ValidationFinding};
pub use ack::{generate_ack, AckCode, AckError, AckSpec, AckSummary};
pub use diff::{compare_messages, compare_messages_ignoring, Difference, MessageDiff};
pub use sequencing::{validate_message_sequence, SequenceError, SequenceGap, SequenceNumberManager};

// Re-export parsers
pub use er7_parser::Er7Parser;
pub use batch::BatchParser;
pub use json_parser::JsonParser;
