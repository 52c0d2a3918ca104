//! Field-level comparison of two messages.

use crate::delimiters::DelimiterSet;
use crate::path::FieldPath;
use crate::serializer::field_text;
use crate::types::{Field, Message, Segment};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// One way two messages differ. `left` belongs to the first message passed
/// to [`compare_messages`], `right` to the second; `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Difference {
    Version {
        left: Option<String>,
        right: Option<String>,
    },
    Delimiters {
        left: DelimiterSet,
        right: DelimiterSet,
    },
    SegmentCount {
        left: usize,
        right: usize,
    },
    /// Segment names differ at `position` (1-based), or one side has no
    /// segment there.
    Segment {
        position: usize,
        left: Option<String>,
        right: Option<String>,
    },
    /// Field `field` of the segment at `position` differs. Values are ER7
    /// text in each message's own delimiters.
    Field {
        position: usize,
        segment: String,
        field: usize,
        left: Option<String>,
        right: Option<String>,
    },
}

impl Difference {
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Difference::Version { .. } | Difference::Delimiters { .. } | Difference::SegmentCount { .. }
        )
    }
}

fn or_missing(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("<missing>")
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::Version { left, right } => {
                write!(f, "version {} vs {}", or_missing(left), or_missing(right))
            }
            Difference::Delimiters { left, right } => write!(f, "delimiters {} vs {}", left, right),
            Difference::SegmentCount { left, right } => write!(f, "segment count {} vs {}", left, right),
            Difference::Segment { position, left, right } => {
                write!(f, "segment {}: {} vs {}", position, or_missing(left), or_missing(right))
            }
            Difference::Field { position, segment, field, left, right } => write!(
                f,
                "{}-{} (segment {}): {:?} vs {:?}",
                segment,
                field,
                position,
                or_missing(left),
                or_missing(right)
            ),
        }
    }
}

/// Everything [`compare_messages`] found, in message order with structural
/// differences first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageDiff {
    pub differences: Vec<Difference>,
}

impl MessageDiff {
    pub fn is_identical(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn structural(&self) -> impl Iterator<Item = &Difference> {
        self.differences.iter().filter(|d| d.is_structural())
    }

    pub fn segments(&self) -> impl Iterator<Item = &Difference> {
        self.differences.iter().filter(|d| matches!(d, Difference::Segment { .. }))
    }

    pub fn fields(&self) -> impl Iterator<Item = &Difference> {
        self.differences.iter().filter(|d| matches!(d, Difference::Field { .. }))
    }
}

impl fmt::Display for MessageDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identical() {
            return writeln!(f, "messages are identical");
        }
        writeln!(
            f,
            "{} structural, {} segment, {} field differences",
            self.structural().count(),
            self.segments().count(),
            self.fields().count()
        )?;
        for difference in &self.differences {
            writeln!(f, "  {}", difference)?;
        }
        Ok(())
    }
}

/// Compare two messages segment by segment, and field by field where the
/// segment names agree.
///
/// Fields are compared by decoded value, so `\F\` and a literal `|` under
/// other delimiters are equal. A missing field equals an empty one. Header
/// fields 1-2 are covered by the delimiter comparison.
pub fn compare_messages(left: &Message, right: &Message) -> MessageDiff {
    compare_messages_ignoring(left, right, &[])
}

/// Like [`compare_messages`], skipping the given fields (e.g. `MSH-7` and
/// `MSH-10` when comparing a resent message). Only the segment name and
/// field number of each path are used.
pub fn compare_messages_ignoring(left: &Message, right: &Message, ignored: &[FieldPath]) -> MessageDiff {
    let mut diff = MessageDiff::default();

    if left.version() != right.version() {
        diff.differences.push(Difference::Version {
            left: left.version().map(str::to_string),
            right: right.version().map(str::to_string),
        });
    }
    if left.delimiters() != right.delimiters() {
        diff.differences.push(Difference::Delimiters {
            left: *left.delimiters(),
            right: *right.delimiters(),
        });
    }
    let (left_count, right_count) = (left.segments().len(), right.segments().len());
    if left_count != right_count {
        diff.differences.push(Difference::SegmentCount {
            left: left_count,
            right: right_count,
        });
    }

    for index in 0..left_count.max(right_count) {
        let position = index + 1;
        match (left.segment_at(index), right.segment_at(index)) {
            (Some(l), Some(r)) if l.name() == r.name() => {
                compare_fields(&mut diff, position, (l, left.delimiters()), (r, right.delimiters()), ignored)
            }
            (l, r) => diff.differences.push(Difference::Segment {
                position,
                left: l.map(|s| s.name().to_string()),
                right: r.map(|s| s.name().to_string()),
            }),
        }
    }

    debug!("Compared messages: {} differences", diff.differences.len());
    diff
}

fn compare_fields(
    diff: &mut MessageDiff,
    position: usize,
    (left, left_ds): (&Segment, &DelimiterSet),
    (right, right_ds): (&Segment, &DelimiterSet),
    ignored: &[FieldPath],
) {
    let first = if left.is_header() { 3 } else { 1 };
    let empty = Field::default();

    for field in first..=left.field_count().max(right.field_count()) {
        if ignored.iter().any(|p| p.segment == left.name() && p.field == field) {
            continue;
        }
        let l = left.field(field).unwrap_or(&empty);
        let r = right.field(field).unwrap_or(&empty);
        if l == r {
            continue;
        }
        let present = |f: &Field, ds: &DelimiterSet| Some(field_text(f, ds)).filter(|_| !f.is_empty());
        diff.differences.push(Difference::Field {
            position,
            segment: left.name().to_string(),
            field,
            left: present(l, left_ds),
            right: present(r, right_ds),
        });
    }
}
