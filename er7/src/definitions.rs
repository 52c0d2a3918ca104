//! Segment definitions and code tables consumed by the structural validator.
//!
//! The crate ships no HL7 content. Hosts implement [`DefinitionProvider`] and
//! [`TableProvider`] over whatever store they have, or load the in-memory
//! versions below from CSV.

use crate::errors::ParseError;
use csv::Reader;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use tracing::debug;

/// Version key matching every message version.
pub const ANY_VERSION: &str = "*";

pub trait DefinitionProvider: Send + Sync {
    fn lookup(&self, segment: &str, version: &str) -> Option<&SegmentDefinition>;
}

pub trait TableProvider: Send + Sync {
    fn contains(&self, table_id: &str, code: &str) -> bool;

    /// Whether the provider has any content for `table_id`. Fields bound to
    /// unknown tables are not checked.
    fn knows(&self, _table_id: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl SegmentDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// 1-based.
    pub fn field(&self, index: usize) -> Option<&FieldDefinition> {
        index.checked_sub(1).and_then(|i| self.fields.get(i))
    }
}

/// One field position. `max_repetitions` of `None` means unbounded; an empty
/// `datatype` disables the datatype check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub min_repetitions: usize,
    pub max_repetitions: Option<usize>,
    pub datatype: String,
    pub table_id: Option<String>,
}

impl Default for FieldDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            min_repetitions: 0,
            max_repetitions: None,
            datatype: String::new(),
            table_id: None,
        }
    }
}

impl FieldDefinition {
    /// Optional, non-repeating.
    pub fn optional(name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_repetitions: 0,
            max_repetitions: Some(1),
            datatype: datatype.into(),
            table_id: None,
        }
    }

    /// Required, non-repeating.
    pub fn required(name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            min_repetitions: 1,
            ..Self::optional(name, datatype)
        }
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max_repetitions = Some(max);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.max_repetitions = None;
        self
    }

    pub fn table(mut self, table_id: impl Into<String>) -> Self {
        self.table_id = Some(table_id.into());
        self
    }
}

/// Definitions keyed by segment name and version.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDefinitions {
    segments: HashMap<(String, String), SegmentDefinition>,
}

#[derive(Debug, Deserialize)]
struct DefinitionRecord {
    version: String,
    segment: String,
    position: usize,
    #[serde(default)]
    name: String,
    #[serde(default)]
    datatype: String,
    #[serde(default)]
    min: usize,
    #[serde(default)]
    max: String,
    #[serde(default)]
    table: String,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition for `version`, or for every version with
    /// [`ANY_VERSION`]. Replaces an earlier one with the same key.
    pub fn insert(&mut self, version: impl Into<String>, definition: SegmentDefinition) {
        self.segments
            .insert((definition.name.clone(), version.into()), definition);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Load definitions from CSV with the header
    /// `version,segment,position,name,datatype,min,max,table`.
    ///
    /// `max` is a number, `*` for unbounded, or empty for 1. Positions that
    /// no row describes accept anything.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, ParseError> {
        let mut csv_reader = Reader::from_reader(reader);
        let mut rows: HashMap<(String, String), Vec<(usize, FieldDefinition)>> = HashMap::new();

        for record_result in csv_reader.deserialize::<DefinitionRecord>() {
            let record = record_result?;
            if record.position == 0 {
                return Err(format!("{} field position must be 1-based", record.segment).into());
            }

            let max_repetitions = match record.max.trim() {
                "" => Some(1),
                "*" => None,
                n => Some(n.parse::<usize>().map_err(|_| {
                    ParseError::Custom(format!(
                        "invalid max repetitions {:?} for {}-{}",
                        n, record.segment, record.position
                    ))
                })?),
            };

            let field = FieldDefinition {
                name: record.name,
                min_repetitions: record.min,
                max_repetitions,
                datatype: record.datatype,
                table_id: Some(record.table).filter(|t| !t.is_empty()),
            };
            rows.entry((record.segment, record.version))
                .or_default()
                .push((record.position, field));
        }

        let mut definitions = Self::new();
        for ((segment, version), mut fields) in rows {
            fields.sort_by_key(|(position, _)| *position);
            let mut ordered: Vec<FieldDefinition> = Vec::new();
            for (position, field) in fields {
                if ordered.len() < position - 1 {
                    ordered.resize_with(position - 1, FieldDefinition::default);
                }
                if ordered.len() == position - 1 {
                    ordered.push(field);
                } else {
                    ordered[position - 1] = field;
                }
            }
            definitions.insert(version, SegmentDefinition::new(segment, ordered));
        }

        debug!("Loaded {} segment definitions from CSV", definitions.len());
        Ok(definitions)
    }
}

impl DefinitionProvider for InMemoryDefinitions {
    fn lookup(&self, segment: &str, version: &str) -> Option<&SegmentDefinition> {
        self.segments
            .get(&(segment.to_string(), version.to_string()))
            .or_else(|| self.segments.get(&(segment.to_string(), ANY_VERSION.to_string())))
    }
}

/// Code tables keyed by table id (e.g. `0001`).
#[derive(Debug, Clone, Default)]
pub struct InMemoryTables {
    tables: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct TableRecord {
    table: String,
    code: String,
}

impl InMemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, S>(&mut self, table_id: impl Into<String>, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables
            .entry(table_id.into())
            .or_default()
            .extend(codes.into_iter().map(Into::into));
    }

    /// Load tables from CSV with at least the columns `table,code`; other
    /// columns (descriptions and the like) are ignored.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, ParseError> {
        let mut csv_reader = Reader::from_reader(reader);
        let mut tables = Self::new();
        for record_result in csv_reader.deserialize::<TableRecord>() {
            let record = record_result?;
            tables.insert(record.table, [record.code]);
        }
        debug!("Loaded {} code tables from CSV", tables.tables.len());
        Ok(tables)
    }
}

impl TableProvider for InMemoryTables {
    fn contains(&self, table_id: &str, code: &str) -> bool {
        self.tables
            .get(table_id)
            .map_or(false, |codes| codes.contains(code))
    }

    fn knows(&self, table_id: &str) -> bool {
        self.tables.contains_key(table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_lookup_falls_back_to_any_version() {
        let mut defs = InMemoryDefinitions::new();
        defs.insert(ANY_VERSION, SegmentDefinition::new("PID", vec![FieldDefinition::optional("Set ID", "SI")]));
        defs.insert("2.3", SegmentDefinition::new("PID", Vec::new()));

        assert_eq!(defs.lookup("PID", "2.5").unwrap().fields.len(), 1);
        assert!(defs.lookup("PID", "2.3").unwrap().fields.is_empty());
        assert!(defs.lookup("ZZZ", "2.5").is_none());
    }

    #[test]
    fn test_definitions_from_csv() {
        let data = "version,segment,position,name,datatype,min,max,table
2.5,PID,1,Set ID,SI,0,,
2.5,PID,3,Patient Identifier List,CX,1,*,
2.5,PID,8,Administrative Sex,IS,0,1,0001
";
        let defs = InMemoryDefinitions::from_csv_reader(Cursor::new(data)).unwrap();
        let pid = defs.lookup("PID", "2.5").unwrap();

        assert_eq!(pid.fields.len(), 8);
        assert_eq!(pid.field(1).unwrap().max_repetitions, Some(1));
        assert_eq!(pid.field(2).unwrap(), &FieldDefinition::default());
        assert_eq!(pid.field(3).unwrap().min_repetitions, 1);
        assert_eq!(pid.field(3).unwrap().max_repetitions, None);
        assert_eq!(pid.field(8).unwrap().table_id.as_deref(), Some("0001"));
    }

    #[test]
    fn test_definitions_from_csv_rejects_bad_rows() {
        let bad_max = "version,segment,position,name,datatype,min,max,table\n2.5,PID,1,Set ID,SI,0,many,\n";
        assert!(InMemoryDefinitions::from_csv_reader(Cursor::new(bad_max)).is_err());

        let zero = "version,segment,position,name,datatype,min,max,table\n2.5,PID,0,Set ID,SI,0,1,\n";
        assert!(InMemoryDefinitions::from_csv_reader(Cursor::new(zero)).is_err());
    }

    #[test]
    fn test_tables_from_csv() {
        let data = "table,code,description
0001,F,Female
0001,M,Male
0203,MR,Medical record number
";
        let tables = InMemoryTables::from_csv_reader(Cursor::new(data)).unwrap();
        assert!(tables.contains("0001", "F"));
        assert!(!tables.contains("0001", "X"));
        assert!(tables.knows("0203"));
        assert!(!tables.knows("9999"));
        assert!(!tables.contains("9999", "F"));
    }
}
