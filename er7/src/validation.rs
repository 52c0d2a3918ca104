use crate::definitions::{DefinitionProvider, FieldDefinition, TableProvider};
use crate::errors::StructuralErrorKind;
use crate::types::{Message, Segment};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// Where a finding applies. `segment` is the 1-based position of the segment
/// in the message; the other indices are 1-based too, with 0 meaning the
/// whole enclosing element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub segment: usize,
    pub field: usize,
    pub repetition: usize,
    pub component: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {}", self.segment)?;
        if self.field > 0 {
            write!(f, ", field {}", self.field)?;
        }
        if self.repetition > 0 {
            write!(f, ", repetition {}", self.repetition)?;
        }
        if self.component > 0 {
            write!(f, ", component {}", self.component)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub location: Location,
    pub kind: StructuralErrorKind,
    pub message: String,
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.severity, self.location, self.message)
    }
}

/// Knowledge the validator checks against. Without tables only cardinality
/// and datatypes are checked.
#[derive(Clone, Copy)]
pub struct Providers<'a> {
    pub definitions: &'a dyn DefinitionProvider,
    pub tables: Option<&'a dyn TableProvider>,
}

impl<'a> Providers<'a> {
    pub fn new(definitions: &'a dyn DefinitionProvider) -> Self {
        Self {
            definitions,
            tables: None,
        }
    }

    pub fn with_tables(mut self, tables: &'a dyn TableProvider) -> Self {
        self.tables = Some(tables);
        self
    }
}

/// Check a parsed message against segment definitions.
///
/// Returns every finding instead of stopping at the first one. Without
/// providers the message is taken as syntactically valid and the list is
/// empty.
pub fn validate(message: &Message, providers: Option<&Providers<'_>>) -> Vec<ValidationFinding> {
    let Some(providers) = providers else {
        return Vec::new();
    };

    let version = message.version().unwrap_or("");
    let mut findings = Vec::new();
    for (index, segment) in message.segments().iter().enumerate() {
        validate_segment(segment, index + 1, version, providers, &mut findings);
    }

    debug!(
        "Validated {} segments: {} findings",
        message.segments().len(),
        findings.len()
    );
    findings
}

pub fn has_errors(findings: &[ValidationFinding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Error)
}

fn validate_segment(
    segment: &Segment,
    index: usize,
    version: &str,
    providers: &Providers<'_>,
    findings: &mut Vec<ValidationFinding>,
) {
    let name = segment.name();
    let Some(definition) = providers.definitions.lookup(name, version) else {
        findings.push(ValidationFinding {
            severity: Severity::Warning,
            location: Location { segment: index, ..Location::default() },
            kind: StructuralErrorKind::UnknownSegment,
            message: format!("no definition for segment {} (version {:?})", name, version),
        });
        return;
    };

    for (i, field) in segment.fields().iter().enumerate().skip(definition.fields.len()) {
        if !field.is_empty() {
            findings.push(ValidationFinding {
                severity: Severity::Warning,
                location: Location { segment: index, field: i + 1, ..Location::default() },
                kind: StructuralErrorKind::CardinalityViolation,
                message: format!("{}-{} is populated but {} defines {} fields", name, i + 1, name, definition.fields.len()),
            });
        }
    }

    // header fields 1 and 2 hold the delimiters
    let first = if segment.is_header() { 3 } else { 1 };
    for (i, field_def) in definition.fields.iter().enumerate().skip(first - 1) {
        validate_field(segment, index, i + 1, field_def, providers, findings);
    }
}

fn validate_field(
    segment: &Segment,
    index: usize,
    position: usize,
    definition: &FieldDefinition,
    providers: &Providers<'_>,
    findings: &mut Vec<ValidationFinding>,
) {
    let name = segment.name();
    let location = Location { segment: index, field: position, ..Location::default() };
    let label = if definition.name.is_empty() {
        format!("{}-{}", name, position)
    } else {
        format!("{}-{} ({})", name, position, definition.name)
    };

    let field = segment.field(position);
    let count = field.map_or(0, |f| f.populated().count());

    if count < definition.min_repetitions {
        findings.push(ValidationFinding {
            severity: Severity::Error,
            location,
            kind: StructuralErrorKind::CardinalityViolation,
            message: format!("{} needs at least {} repetition(s), found {}", label, definition.min_repetitions, count),
        });
    }
    if let Some(max) = definition.max_repetitions {
        if count > max {
            findings.push(ValidationFinding {
                severity: Severity::Error,
                location,
                kind: StructuralErrorKind::CardinalityViolation,
                message: format!("{} allows at most {} repetition(s), found {}", label, max, count),
            });
        }
    }

    let Some(field) = field else {
        return;
    };

    for (r, repetition) in field.repetitions().iter().enumerate() {
        let value = repetition.value();
        if repetition.is_empty() || value.is_empty() || value == "\"\"" {
            continue;
        }
        let location = Location { repetition: r + 1, component: 1, ..location };

        if let Err(reason) = check_datatype(&definition.datatype, value) {
            findings.push(ValidationFinding {
                severity: Severity::Error,
                location,
                kind: StructuralErrorKind::DatatypeViolation,
                message: format!("{} value {:?} is not a valid {}: {}", label, value, definition.datatype, reason),
            });
        }

        if let (Some(table_id), Some(tables)) = (definition.table_id.as_deref(), providers.tables) {
            if tables.knows(table_id) && !tables.contains(table_id, value) {
                findings.push(ValidationFinding {
                    severity: Severity::Error,
                    location,
                    kind: StructuralErrorKind::TableViolation,
                    message: format!("{} value {:?} is not in table {}", label, value, table_id),
                });
            }
        }
    }
}

/// Primitive datatype check on a decoded value. Unknown datatypes pass.
pub fn check_datatype(datatype: &str, value: &str) -> Result<(), String> {
    match datatype {
        "NM" => check_numeric(value),
        "SI" => {
            if is_digits(value) {
                Ok(())
            } else {
                Err("expected a non-negative integer".to_string())
            }
        }
        "DT" => check_date(value),
        "TM" => check_time(value),
        "DTM" | "TS" => check_timestamp(value),
        _ => Ok(()),
    }
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn check_numeric(value: &str) -> Result<(), String> {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits_ok = whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit());
    if digits_ok && (!whole.is_empty() || !fraction.is_empty()) {
        Ok(())
    } else {
        Err("expected a decimal number".to_string())
    }
}

fn check_date(value: &str) -> Result<(), String> {
    if !is_digits(value) {
        return Err("expected YYYY[MM[DD]]".to_string());
    }
    match value.len() {
        4 => Ok(()),
        6 => check_range(&value[4..6], 1, 12, "month"),
        8 => NaiveDate::parse_from_str(value, "%Y%m%d")
            .map(|_| ())
            .map_err(|e| format!("invalid date: {}", e)),
        n => Err(format!("date has {} digits, expected 4, 6 or 8", n)),
    }
}

fn check_range(digits: &str, min: u32, max: u32, what: &str) -> Result<(), String> {
    match digits.parse::<u32>() {
        Ok(n) if (min..=max).contains(&n) => Ok(()),
        _ => Err(format!("{} {} out of range", what, digits)),
    }
}

/// Strip a `+ZZZZ`/`-ZZZZ` offset and a `.S` fraction, checking both.
fn strip_time_suffixes(value: &str) -> Result<&str, String> {
    let main = match value.find(['+', '-']) {
        Some(i) => {
            let offset = &value[i + 1..];
            if offset.len() != 4 || !is_digits(offset) {
                return Err(format!("invalid UTC offset {:?}", &value[i..]));
            }
            &value[..i]
        }
        None => value,
    };
    match main.split_once('.') {
        Some((digits, fraction)) => {
            if fraction.is_empty() || fraction.len() > 4 || !is_digits(fraction) {
                return Err(format!("invalid fractional seconds {:?}", fraction));
            }
            Ok(digits)
        }
        None => Ok(main),
    }
}

fn check_time_digits(digits: &str) -> Result<(), String> {
    if !is_digits(digits) || !matches!(digits.len(), 2 | 4 | 6) {
        return Err("expected HH[MM[SS]]".to_string());
    }
    check_range(&digits[..2], 0, 23, "hour")?;
    if digits.len() >= 4 {
        check_range(&digits[2..4], 0, 59, "minute")?;
    }
    if digits.len() == 6 {
        check_range(&digits[4..6], 0, 59, "second")?;
    }
    Ok(())
}

fn check_time(value: &str) -> Result<(), String> {
    check_time_digits(strip_time_suffixes(value)?)
}

fn check_timestamp(value: &str) -> Result<(), String> {
    let digits = strip_time_suffixes(value)?;
    if !is_digits(digits) || !matches!(digits.len(), 4 | 6 | 8 | 10 | 12 | 14) {
        return Err("expected YYYY[MM[DD[HH[MM[SS]]]]]".to_string());
    }
    let date_len = digits.len().min(8);
    check_date(&digits[..date_len])?;
    if digits.len() > 8 {
        check_time_digits(&digits[8..])?;
    }
    Ok(())
}

/// Validator that owns its providers so it can be cloned into worker
/// threads.
#[derive(Clone)]
pub struct StructuralValidator {
    definitions: Arc<dyn DefinitionProvider>,
    tables: Option<Arc<dyn TableProvider>>,
}

impl StructuralValidator {
    pub fn new(definitions: Arc<dyn DefinitionProvider>) -> Self {
        Self {
            definitions,
            tables: None,
        }
    }

    pub fn with_tables(mut self, tables: Arc<dyn TableProvider>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn validate(&self, message: &Message) -> Vec<ValidationFinding> {
        let providers = Providers {
            definitions: self.definitions.as_ref(),
            tables: self.tables.as_deref(),
        };
        validate(message, Some(&providers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{InMemoryDefinitions, InMemoryTables, SegmentDefinition, ANY_VERSION};
    use crate::er7_parser::parse;

    fn definitions() -> InMemoryDefinitions {
        let mut defs = InMemoryDefinitions::new();
        defs.insert(
            ANY_VERSION,
            SegmentDefinition::new(
                "MSH",
                vec![
                    FieldDefinition::required("Field Separator", "ST"),
                    FieldDefinition::required("Encoding Characters", "ST"),
                    FieldDefinition::optional("Sending Application", "HD"),
                    FieldDefinition::optional("Sending Facility", "HD"),
                    FieldDefinition::optional("Receiving Application", "HD"),
                    FieldDefinition::optional("Receiving Facility", "HD"),
                    FieldDefinition::optional("Date/Time of Message", "DTM"),
                    FieldDefinition::optional("Security", "ST"),
                    FieldDefinition::required("Message Type", "MSG"),
                    FieldDefinition::required("Message Control ID", "ST"),
                    FieldDefinition::required("Processing ID", "PT"),
                    FieldDefinition::required("Version ID", "VID"),
                ],
            ),
        );
        defs.insert(
            ANY_VERSION,
            SegmentDefinition::new(
                "PID",
                vec![
                    FieldDefinition::optional("Set ID", "SI"),
                    FieldDefinition::optional("Patient ID", "CX"),
                    FieldDefinition::required("Patient Identifier List", "CX").unbounded(),
                    FieldDefinition::optional("Alternate Patient ID", "CX"),
                    FieldDefinition::required("Patient Name", "XPN").max(2),
                    FieldDefinition::optional("Mother's Maiden Name", "XPN"),
                    FieldDefinition::optional("Date/Time of Birth", "DTM"),
                    FieldDefinition::optional("Administrative Sex", "IS").table("0001"),
                ],
            ),
        );
        defs
    }

    fn tables() -> InMemoryTables {
        let mut tables = InMemoryTables::new();
        tables.insert("0001", ["F", "M", "O", "U"]);
        tables
    }

    const MSH: &str = "MSH|^~\\&|A|B|C|D|20240101120000||ADT^A01|123|P|2.5";

    fn check(pid: &str) -> Vec<ValidationFinding> {
        let msg = parse(&format!("{}\r{}", MSH, pid)).unwrap();
        let defs = definitions();
        let tables = tables();
        let providers = Providers::new(&defs).with_tables(&tables);
        validate(&msg, Some(&providers))
    }

    #[test]
    fn test_no_providers_means_no_findings() {
        let msg = parse(&format!("{}\rPID|||MRN123||DOE^JOHN\rZZZ|anything", MSH)).unwrap();
        assert!(validate(&msg, None).is_empty());
    }

    #[test]
    fn test_valid_message_has_no_findings() {
        let findings = check("PID|1||MRN1~MRN2||DOE^JOHN||19800102|F");
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_unknown_segment_is_a_warning() {
        let msg = parse(&format!("{}\rPID|||X||DOE\rZPI|custom", MSH)).unwrap();
        let defs = definitions();
        let findings = validate(&msg, Some(&Providers::new(&defs)));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, StructuralErrorKind::UnknownSegment);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].location.segment, 3);
        assert!(!has_errors(&findings));
    }

    #[test]
    fn test_missing_required_field() {
        let findings = check("PID|1||||DOE");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, StructuralErrorKind::CardinalityViolation);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].location.field, 3);
        assert!(findings[0].message.contains("PID-3 (Patient Identifier List)"));
    }

    #[test]
    fn test_too_many_repetitions() {
        let findings = check("PID|||X||A~B~C");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].location.field, 5);
        assert!(findings[0].message.contains("at most 2"));
    }

    #[test]
    fn test_extra_fields_are_warnings() {
        let findings = check("PID|||X||DOE||||||extra|");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].location.field, 11);
    }

    #[test]
    fn test_datatype_violations() {
        let findings = check("PID|one||X||DOE||20240230");
        let kinds: Vec<_> = findings.iter().map(|f| (f.kind, f.location.field)).collect();
        assert_eq!(
            kinds,
            vec![
                (StructuralErrorKind::DatatypeViolation, 1),
                (StructuralErrorKind::DatatypeViolation, 7),
            ]
        );
    }

    #[test]
    fn test_table_violation() {
        let findings = check("PID|||X||DOE|||Q");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, StructuralErrorKind::TableViolation);
        assert_eq!(findings[0].location.repetition, 1);
    }

    #[test]
    fn test_null_values_skip_value_checks() {
        assert!(check("PID|\"\"||X||DOE||\"\"|\"\"").is_empty());
    }

    #[test]
    fn test_check_datatype() {
        assert!(check_datatype("NM", "-12.5").is_ok());
        assert!(check_datatype("NM", ".5").is_ok());
        assert!(check_datatype("NM", "1e5").is_err());
        assert!(check_datatype("NM", "-").is_err());
        assert!(check_datatype("DT", "2024").is_ok());
        assert!(check_datatype("DT", "202413").is_err());
        assert!(check_datatype("TM", "2359").is_ok());
        assert!(check_datatype("TM", "2460").is_err());
        assert!(check_datatype("DTM", "20240101120000.123+0100").is_ok());
        assert!(check_datatype("DTM", "202401011").is_err());
        assert!(check_datatype("TS", "20240101126000").is_err());
        assert!(check_datatype("ST", "anything at all").is_ok());
    }

    #[test]
    fn test_validator_is_shareable() {
        let validator = StructuralValidator::new(Arc::new(definitions())).with_tables(Arc::new(tables()));
        let msg = parse(&format!("{}\rPID|||X||DOE|||Q", MSH)).unwrap();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let validator = validator.clone();
                    let msg = &msg;
                    scope.spawn(move || validator.validate(msg).len())
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), 1);
            }
        });
    }
}
