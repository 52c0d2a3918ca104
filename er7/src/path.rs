use crate::types::Message;
use std::fmt;
use std::str::FromStr;

/// Address of a leaf value, written `SEG[(n)]-field[(r)][-component[-subcomponent]]`.
///
/// Examples: `PID-3`, `PID-3(2)-1`, `OBX(2)-5-1-2`. `.` is accepted in
/// place of `-`. Every index is 1-based and defaults to 1 when omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub segment: String,
    pub occurrence: usize,
    pub field: usize,
    pub repetition: usize,
    pub component: usize,
    pub subcomponent: usize,
}

impl FieldPath {
    pub fn new(segment: impl Into<String>, field: usize) -> Self {
        Self {
            segment: segment.into(),
            occurrence: 1,
            field,
            repetition: 1,
            component: 1,
            subcomponent: 1,
        }
    }

    pub fn component(mut self, component: usize) -> Self {
        self.component = component;
        self
    }

    pub fn subcomponent(mut self, subcomponent: usize) -> Self {
        self.subcomponent = subcomponent;
        self
    }

    pub fn repetition(mut self, repetition: usize) -> Self {
        self.repetition = repetition;
        self
    }

    pub fn occurrence(mut self, occurrence: usize) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn resolve<'a>(&self, message: &'a Message) -> Option<&'a str> {
        let segment = message
            .segments()
            .iter()
            .filter(|s| s.name() == self.segment)
            .nth(self.occurrence.checked_sub(1)?)?;
        segment
            .field(self.field)?
            .repetition(self.repetition)?
            .component(self.component)?
            .subcomponent(self.subcomponent)
            .map(|s| s.value())
    }
}

/// Error returned when a path string cannot be parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid field path '{0}': expected SEG[(n)]-field[(r)][-component[-subcomponent]]")]
pub struct InvalidPathError(String);

fn split_index(part: &str) -> Option<(&str, usize)> {
    match part.strip_suffix(')') {
        Some(rest) => {
            let (name, index) = rest.split_once('(')?;
            let index = index.parse().ok().filter(|i| *i > 0)?;
            Some((name, index))
        }
        None => Some((part, 1)),
    }
}

fn parse_index(part: &str) -> Option<usize> {
    part.parse().ok().filter(|i| *i > 0)
}

impl FromStr for FieldPath {
    type Err = InvalidPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPathError(s.to_string());
        let mut parts = s.split(['-', '.']);

        let (segment, occurrence) = parts.next().and_then(split_index).ok_or_else(invalid)?;
        if segment.len() != 3 || !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        let (field, repetition) = parts.next().and_then(split_index).ok_or_else(invalid)?;
        let field = parse_index(field).ok_or_else(invalid)?;

        let component = match parts.next() {
            Some(p) => parse_index(p).ok_or_else(invalid)?,
            None => 1,
        };
        let subcomponent = match parts.next() {
            Some(p) => parse_index(p).ok_or_else(invalid)?,
            None => 1,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            segment: segment.to_string(),
            occurrence,
            field,
            repetition,
            component,
            subcomponent,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segment)?;
        if self.occurrence > 1 {
            write!(f, "({})", self.occurrence)?;
        }
        write!(f, "-{}", self.field)?;
        if self.repetition > 1 {
            write!(f, "({})", self.repetition)?;
        }
        write!(f, "-{}-{}", self.component, self.subcomponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::er7_parser::parse;

    #[test]
    fn test_parse_paths() {
        let p: FieldPath = "PID-3".parse().unwrap();
        assert_eq!(p, FieldPath::new("PID", 3));

        let p: FieldPath = "OBX(2)-5(3)-1-2".parse().unwrap();
        assert_eq!(p.occurrence, 2);
        assert_eq!(p.field, 5);
        assert_eq!(p.repetition, 3);
        assert_eq!(p.component, 1);
        assert_eq!(p.subcomponent, 2);

        let p: FieldPath = "PID.5.2".parse().unwrap();
        assert_eq!(p, FieldPath::new("PID", 5).component(2));
    }

    #[test]
    fn test_reject_bad_paths() {
        for bad in ["", "PID", "PIDX-1", "PID-0", "PID-a", "PID-1-2-3-4", "PID(0)-1"] {
            assert!(bad.parse::<FieldPath>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_resolve_against_message() {
        let msg = parse("MSH|^~\\&|A|B\rPID|||MRN1~MRN2||DOE^JOHN&Q\rOBX|1\rOBX|2|NM").unwrap();
        assert_eq!(msg.get_str("PID-3"), Some("MRN1"));
        assert_eq!(msg.get_str("PID-3(2)"), Some("MRN2"));
        assert_eq!(msg.get_str("PID-5-2"), Some("JOHN"));
        assert_eq!(msg.get_str("PID-5-2-2"), Some("Q"));
        assert_eq!(msg.get_str("OBX(2)-2"), Some("NM"));
        assert_eq!(msg.get_str("OBX(3)-2"), None);
        assert_eq!(msg.get_str("PID-99"), None);
        assert_eq!(msg.get(&FieldPath::new("MSH", 3)), Some("A"));
    }

    #[test]
    fn test_display_round_trips() {
        let p = FieldPath::new("OBX", 5).occurrence(2).repetition(3).component(4);
        let back: FieldPath = p.to_string().parse().unwrap();
        assert_eq!(back, p);
    }
}
