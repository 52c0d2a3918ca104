//! Acknowledgment messages: building an `ACK` for a received message and
//! reading one back.

use crate::config::AckDefaults;
use crate::errors::{StructuralError, StructuralErrorKind};
use crate::types::{Component, Field, Message, Repetition, Segment, Subcomponent};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const ERROR_CODE_SYSTEM: &str = "HL70357";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static CONTROL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// MSA-1 acknowledgment codes (HL7 table 0008).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckCode {
    AA,
    AE,
    AR,
    CA,
    CE,
    CR,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AE => "AE",
            AckCode::AR => "AR",
            AckCode::CA => "CA",
            AckCode::CE => "CE",
            AckCode::CR => "CR",
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, AckCode::AA | AckCode::CA)
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, AckCode::AR | AckCode::CR)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid acknowledgment code '{0}': expected AA, AE, AR, CA, CE or CR")]
pub struct InvalidAckCode(pub String);

impl FromStr for AckCode {
    type Err = InvalidAckCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AA" => Ok(AckCode::AA),
            "AE" => Ok(AckCode::AE),
            "AR" => Ok(AckCode::AR),
            "CA" => Ok(AckCode::CA),
            "CE" => Ok(AckCode::CE),
            "CR" => Ok(AckCode::CR),
            other => Err(InvalidAckCode(other.to_string())),
        }
    }
}

/// ERR-4 severity (HL7 table 0516).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    #[default]
    Error,
    Warning,
    Information,
}

impl ErrorSeverity {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "E",
            ErrorSeverity::Warning => "W",
            ErrorSeverity::Information => "I",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "E" => Some(ErrorSeverity::Error),
            "W" => Some(ErrorSeverity::Warning),
            "I" => Some(ErrorSeverity::Information),
            _ => None,
        }
    }
}

/// One problem reported back to the sender as an `ERR` segment.
///
/// `sequence` is the occurrence of the segment in the original message and
/// `field_position` the field; 0 leaves them blank. `code` comes from
/// HL7 table 0357 (e.g. `101` required field missing, `207` application
/// internal error).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub segment_id: String,
    pub sequence: usize,
    pub field_position: usize,
    pub code: String,
    pub severity: ErrorSeverity,
    pub text: String,
}

impl AckError {
    pub fn new(code: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, segment_id: impl Into<String>, sequence: usize, field_position: usize) -> Self {
        self.segment_id = segment_id.into();
        self.sequence = sequence;
        self.field_position = field_position;
        self
    }

    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSpec {
    pub ack_code: AckCode,
    pub text_message: Option<String>,
    pub error_segments: Vec<AckError>,
    /// MSH-10 of the ACK; generated when absent.
    pub control_id: Option<String>,
    /// MSH-7 of the ACK; the current local time when absent.
    pub timestamp: Option<NaiveDateTime>,
}

impl AckSpec {
    pub fn new(ack_code: AckCode) -> Self {
        Self {
            ack_code,
            text_message: None,
            error_segments: Vec::new(),
            control_id: None,
            timestamp: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_message = Some(text.into());
        self
    }

    pub fn with_error(mut self, error: AckError) -> Self {
        self.error_segments.push(error);
        self
    }
}

/// A fresh control ID: `ACK`, the local time to the second and a process-wide
/// counter of at least 3 digits. The counter never wraps, so IDs from one
/// process are unique.
pub fn next_control_id() -> String {
    let sequence = CONTROL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ACK{}{:03}", Local::now().format(TIMESTAMP_FORMAT), sequence)
}

pub fn generate_ack(original: &Message, spec: &AckSpec) -> Result<Message, StructuralError> {
    generate_ack_with(original, spec, &AckDefaults::default())
}

/// Build the `ACK` answering `original`.
///
/// The header swaps sender and receiver, and MSA-2 echoes the original
/// MSH-10. `ERR` segments use the 2.5+ layout (ERR-2..ERR-8) unless the
/// original declares an older version, which gets the single ERR-1 layout.
pub fn generate_ack_with(
    original: &Message,
    spec: &AckSpec,
    defaults: &AckDefaults,
) -> Result<Message, StructuralError> {
    let msh = original.header().ok_or_else(StructuralError::missing_msh)?;
    let delimiters = *original.delimiters();
    let copy = |index: usize| msh.field(index).cloned().unwrap_or_default();
    let copy_or = |index: usize, fallback: &str| match msh.field(index) {
        Some(field) if !field.is_empty() => field.clone(),
        _ => Field::text(fallback),
    };

    let original_control_id = original.control_id().unwrap_or("");
    let control_id = match &spec.control_id {
        Some(id) => id.clone(),
        None => loop {
            let id = next_control_id();
            if id != original_control_id {
                break id;
            }
        },
    };
    let timestamp = spec
        .timestamp
        .unwrap_or_else(|| Local::now().naive_local())
        .format(TIMESTAMP_FORMAT)
        .to_string();

    let mut message_type = vec!["ACK".to_string(), original.trigger_event().unwrap_or("").to_string()];
    if original.message_structure().is_some() {
        message_type.push("ACK".to_string());
    }

    let mut header = Segment::header("MSH", &delimiters);
    header.set_field(3, copy(5));
    header.set_field(4, copy(6));
    header.set_field(5, copy(3));
    header.set_field(6, copy(4));
    header.set_field(7, Field::text(timestamp));
    header.set_field(9, Field::from_components(message_type));
    header.set_field(10, Field::text(control_id.as_str()));
    header.set_field(11, copy_or(11, &defaults.processing_id));
    header.set_field(12, copy_or(12, &defaults.version));

    let version = header.value(12).unwrap_or("").to_string();
    let mut segments = vec![header, msa_segment(spec, original_control_id)];
    let modern = version_at_least(&version, 2, 5);
    segments.extend(spec.error_segments.iter().map(|e| err_segment(e, modern)));

    debug!(
        "Generated {} for control id {:?} as {}",
        spec.ack_code, original_control_id, control_id
    );
    Message::new(delimiters, segments)
}

fn msa_segment(spec: &AckSpec, original_control_id: &str) -> Segment {
    let mut msa = Segment::new("MSA");
    msa.set_field(1, Field::text(spec.ack_code.as_str()));
    msa.set_field(2, Field::text(original_control_id));
    if let Some(text) = &spec.text_message {
        msa.set_field(3, Field::text(text.as_str()));
    }
    msa
}

fn blank_if_zero(n: usize) -> String {
    if n == 0 {
        String::new()
    } else {
        n.to_string()
    }
}

fn err_segment(error: &AckError, modern: bool) -> Segment {
    let mut err = Segment::new("ERR");
    let location = [
        error.segment_id.clone(),
        blank_if_zero(error.sequence),
        blank_if_zero(error.field_position),
    ];

    if modern {
        err.set_field(2, Field::from_components(location));
        err.set_field(
            3,
            Field::from_components([error.code.as_str(), error.text.as_str(), ERROR_CODE_SYSTEM]),
        );
        err.set_field(4, Field::text(error.severity.code()));
        if !error.text.is_empty() {
            err.set_field(8, Field::text(error.text.as_str()));
        }
    } else {
        let mut components: Vec<Component> = location.into_iter().map(Component::text).collect();
        components.push(Component::from_subcomponents(vec![
            Subcomponent::new(error.code.as_str()),
            Subcomponent::new(error.text.as_str()),
            Subcomponent::new(ERROR_CODE_SYSTEM),
        ]));
        err.set_field(1, Field::new(vec![Repetition::new(components)]));
    }
    err
}

/// True when `version` (e.g. `2.5.1`) is at least `major.minor`. Unparsable
/// versions count as current.
fn version_at_least(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version.split('.').map(|p| p.trim().parse::<u32>());
    match (parts.next(), parts.next()) {
        (Some(Ok(v_major)), Some(Ok(v_minor))) => (v_major, v_minor) >= (major, minor),
        (Some(Ok(v_major)), None) => v_major > major,
        _ => true,
    }
}

/// What a received `ACK` says about the message it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSummary {
    pub code: AckCode,
    /// MSA-2: control ID of the acknowledged message.
    pub control_id: String,
    pub text: Option<String>,
    /// MSA-6.
    pub error_condition: Option<String>,
    pub errors: Vec<AckError>,
}

impl AckSummary {
    pub fn from_message(ack: &Message) -> Result<Self, StructuralError> {
        let msa = ack.segment("MSA").ok_or_else(|| {
            StructuralError::new(StructuralErrorKind::CardinalityViolation, "ACK has no MSA segment")
        })?;

        let raw_code = msa.value(1).unwrap_or("");
        let code = raw_code
            .parse::<AckCode>()
            .map_err(|e| StructuralError::new(StructuralErrorKind::TableViolation, e.to_string()))?;

        let non_empty = |index: usize| {
            msa.value(index)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let errors: Vec<AckError> = ack.segments_named("ERR").map(read_err).collect();
        if !code.is_accept() && errors.is_empty() && non_empty(3).is_none() {
            warn!("{} acknowledgment carries no error details", code);
        }

        Ok(Self {
            code,
            control_id: non_empty(2).unwrap_or_default(),
            text: non_empty(3),
            error_condition: non_empty(6),
            errors,
        })
    }

    pub fn is_accepted(&self) -> bool {
        self.code.is_accept()
    }

    /// The original message this ACK answers, looked up by control ID.
    pub fn correlate<'a, M>(&self, originals: &'a HashMap<String, M>) -> Option<&'a M> {
        originals.get(&self.control_id)
    }
}

fn read_err(err: &Segment) -> AckError {
    let component = |field: usize, index: usize| -> String {
        err.field(field)
            .and_then(|f| f.component(index))
            .map(|c| c.value().to_string())
            .unwrap_or_default()
    };
    let number = |field: usize, index: usize| -> usize { component(field, index).parse().unwrap_or(0) };

    let legacy = err.field(1).map_or(false, |f| !f.is_empty());
    if legacy {
        let code = err.field(1).and_then(|f| f.component(4));
        let sub = |n: usize| {
            code.and_then(|c| c.subcomponent(n))
                .map(|s| s.value().to_string())
                .unwrap_or_default()
        };
        return AckError {
            segment_id: component(1, 1),
            sequence: number(1, 2),
            field_position: number(1, 3),
            code: sub(1),
            severity: ErrorSeverity::Error,
            text: sub(2),
        };
    }

    let text = match component(3, 2) {
        t if t.is_empty() => component(8, 1),
        t => t,
    };
    AckError {
        segment_id: component(2, 1),
        sequence: number(2, 2),
        field_position: number(2, 3),
        code: component(3, 1),
        severity: ErrorSeverity::from_code(&component(4, 1)).unwrap_or_default(),
        text,
    }
}
