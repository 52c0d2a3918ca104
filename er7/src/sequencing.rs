//! MSH-13 sequence numbers: handing them out and checking what arrives.

use crate::types::Message;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("message has no MSH segment")]
    MissingHeader,
    #[error("invalid sequence number format: {0:?}")]
    InvalidFormat(String),
    #[error("sequence number mismatch: expected {expected}, got {received}")]
    Mismatch { expected: u64, received: u64 },
}

/// Messages skipped between two sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub last: u64,
    pub current: u64,
}

impl SequenceGap {
    pub fn missing_count(&self) -> u64 {
        self.current - self.last - 1
    }

    pub fn missing(&self) -> impl Iterator<Item = u64> {
        self.last + 1..self.current
    }
}

#[derive(Debug)]
struct SequenceState {
    next: u64,
    received: BTreeSet<u64>,
}

/// Numbers outgoing messages and remembers the numbers of incoming ones.
/// Safe to share between threads.
#[derive(Debug)]
pub struct SequenceNumberManager {
    state: Mutex<SequenceState>,
}

impl SequenceNumberManager {
    pub fn new(initial: u64) -> Self {
        info!("SequenceNumberManager starting at {}", initial);
        Self {
            state: Mutex::new(SequenceState {
                next: initial,
                received: BTreeSet::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_sequence_number(&self) -> u64 {
        let mut state = self.state();
        let sequence = state.next;
        state.next += 1;
        debug!("Issued sequence number {}", sequence);
        sequence
    }

    /// Check the sequence number of an incoming message and remember it.
    ///
    /// Returns `Ok(None)` when MSH-13 is absent or empty. A number that does
    /// not match `expected` is rejected and not remembered.
    pub fn validate(&self, message: &Message, expected: Option<u64>) -> Result<Option<u64>, SequenceError> {
        let Some(sequence) = sequence_number(message)? else {
            return Ok(None);
        };
        if let Some(expected) = expected.filter(|&e| e != sequence) {
            return Err(SequenceError::Mismatch {
                expected,
                received: sequence,
            });
        }
        self.state().received.insert(sequence);
        debug!("Accepted sequence number {}", sequence);
        Ok(Some(sequence))
    }

    /// Gap between `last` (or, without it, the highest number received below
    /// this message's) and this message's sequence number.
    pub fn check_gap(&self, message: &Message, last: Option<u64>) -> Option<SequenceGap> {
        let current = sequence_number(message).ok().flatten()?;
        let last = match last {
            Some(last) => last,
            None => *self.state().received.range(..current).next_back()?,
        };
        if current <= last.saturating_add(1) {
            return None;
        }
        let gap = SequenceGap { last, current };
        warn!(
            "Sequence gap: last {}, current {}, {} missing",
            last,
            current,
            gap.missing_count()
        );
        Some(gap)
    }

    /// Numbers between the lowest and highest received that never arrived.
    pub fn missing(&self) -> Vec<u64> {
        let state = self.state();
        let (Some(&first), Some(&last)) = (state.received.first(), state.received.last()) else {
            return Vec::new();
        };
        (first..=last).filter(|n| !state.received.contains(n)).collect()
    }
}

impl Default for SequenceNumberManager {
    fn default() -> Self {
        Self::new(1)
    }
}

/// MSH-13 as a number; `None` when absent or empty.
pub fn sequence_number(message: &Message) -> Result<Option<u64>, SequenceError> {
    let header = message.header().ok_or(SequenceError::MissingHeader)?;
    match header.value(13).map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| SequenceError::InvalidFormat(text.to_string())),
    }
}

/// Check one message's sequence number on its own.
pub fn validate_message_sequence(message: &Message, expected: Option<u64>) -> Result<Option<u64>, SequenceError> {
    SequenceNumberManager::default().validate(message, expected)
}

/// Report lines for a set of missing numbers, with consecutive runs
/// collapsed: `Missing sequence numbers: 1-3, 5`.
pub fn describe_gap(missing: &[u64]) -> Vec<String> {
    let numbers: BTreeSet<u64> = missing.iter().copied().collect();
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for n in numbers {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == n => *end = n,
            _ => runs.push((n, n)),
        }
    }
    if runs.is_empty() {
        return Vec::new();
    }

    let ranges: Vec<String> = runs
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect();
    vec![
        format!("Missing sequence numbers: {}", ranges.join(", ")),
        format!("Total missing messages: {}", missing.len()),
    ]
}
