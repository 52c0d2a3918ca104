use crate::delimiters::{is_header_segment, DelimiterSet};
use crate::errors::StructuralError;
use crate::path::FieldPath;
use crate::errors::StructuralErrorKind;
use serde::{de, Deserialize, Deserializer, Serialize};

/// Terminal value of the tree, always stored decoded.
///
/// When the text it was parsed from is not the canonical encoding of the
/// decoded value (hex runs, vendor escapes, formatting commands) the original
/// text is remembered so the serializer can reproduce it. Replacing the value
/// drops it. Equality only looks at the decoded value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Subcomponent {
    value: String,
    source: Option<String>,
}

impl Subcomponent {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: None,
        }
    }

    pub(crate) fn with_source(value: String, source: String) -> Self {
        Self {
            value,
            source: Some(source),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.source = None;
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_value(self) -> String {
        self.value
    }

    /// Escaped text this value was parsed from, when it differs from what
    /// the encoder would produce.
    pub(crate) fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl PartialEq for Subcomponent {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Subcomponent {}

impl From<String> for Subcomponent {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Subcomponent {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Subcomponent> for String {
    fn from(value: Subcomponent) -> Self {
        value.value
    }
}

/// One component of a repetition: either a bare value or, when the
/// subcomponent separator was present, a list of subcomponents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Component {
    Text(Subcomponent),
    Subcomponents(Vec<Subcomponent>),
}

impl Default for Component {
    fn default() -> Self {
        Component::Text(Subcomponent::default())
    }
}

// A one-element list reads back as `Text`, matching what the parser builds.
impl<'de> Deserialize<'de> for Component {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ComponentData {
            Text(Subcomponent),
            Subcomponents(Vec<Subcomponent>),
        }

        match ComponentData::deserialize(deserializer)? {
            ComponentData::Text(value) => Ok(Component::Text(value)),
            ComponentData::Subcomponents(values) if values.is_empty() => {
                Err(de::Error::custom("component has no subcomponents"))
            }
            ComponentData::Subcomponents(values) => Ok(Component::from_subcomponents(values)),
        }
    }
}

impl Component {
    pub fn text(value: impl Into<String>) -> Self {
        Component::Text(Subcomponent::new(value))
    }

    /// A single subcomponent collapses to `Text`.
    pub fn from_subcomponents(mut subcomponents: Vec<Subcomponent>) -> Self {
        match subcomponents.len() {
            0 => Component::default(),
            1 => Component::Text(subcomponents.remove(0)),
            _ => Component::Subcomponents(subcomponents),
        }
    }

    pub fn subcomponents(&self) -> &[Subcomponent] {
        match self {
            Component::Text(value) => std::slice::from_ref(value),
            Component::Subcomponents(values) => values,
        }
    }

    /// 1-based.
    pub fn subcomponent(&self, index: usize) -> Option<&Subcomponent> {
        index.checked_sub(1).and_then(|i| self.subcomponents().get(i))
    }

    pub fn subcomponent_mut(&mut self, index: usize) -> Option<&mut Subcomponent> {
        let i = index.checked_sub(1)?;
        match self {
            Component::Text(value) if i == 0 => Some(value),
            Component::Text(_) => None,
            Component::Subcomponents(values) => values.get_mut(i),
        }
    }

    /// Value of the first subcomponent.
    pub fn value(&self) -> &str {
        self.subcomponents().first().map(Subcomponent::value).unwrap_or("")
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Component::Subcomponents(_))
    }

    pub fn is_empty(&self) -> bool {
        self.subcomponents().iter().all(Subcomponent::is_empty)
    }
}

impl From<&str> for Component {
    fn from(value: &str) -> Self {
        Component::text(value)
    }
}

/// One occurrence of a field. Holds at least one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Component>", into = "Vec<Component>")]
pub struct Repetition {
    components: Vec<Component>,
}

impl Default for Repetition {
    fn default() -> Self {
        Self {
            components: vec![Component::default()],
        }
    }
}

impl Repetition {
    /// An empty list yields a repetition with one empty component.
    pub fn new(components: Vec<Component>) -> Self {
        if components.is_empty() {
            return Self::default();
        }
        Self { components }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new(vec![Component::text(value)])
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// 1-based.
    pub fn component(&self, index: usize) -> Option<&Component> {
        index.checked_sub(1).and_then(|i| self.components.get(i))
    }

    pub fn component_mut(&mut self, index: usize) -> Option<&mut Component> {
        let i = index.checked_sub(1)?;
        self.components.get_mut(i)
    }

    /// Replace component `index`, padding with empty components as needed.
    /// Index 0 is ignored.
    pub fn set_component(&mut self, index: usize, component: Component) {
        let Some(i) = index.checked_sub(1) else {
            return;
        };
        if self.components.len() <= i {
            self.components.resize_with(i + 1, Component::default);
        }
        self.components[i] = component;
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn value(&self) -> &str {
        self.components[0].value()
    }

    pub fn is_empty(&self) -> bool {
        self.components.iter().all(Component::is_empty)
    }
}

impl From<Vec<Component>> for Repetition {
    fn from(components: Vec<Component>) -> Self {
        Self::new(components)
    }
}

impl From<Repetition> for Vec<Component> {
    fn from(value: Repetition) -> Self {
        value.components
    }
}

/// A field position in a segment. Holds at least one repetition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Repetition>", into = "Vec<Repetition>")]
pub struct Field {
    repetitions: Vec<Repetition>,
}

impl Default for Field {
    fn default() -> Self {
        Self {
            repetitions: vec![Repetition::default()],
        }
    }
}

impl Field {
    /// An empty list yields an empty field.
    pub fn new(repetitions: Vec<Repetition>) -> Self {
        if repetitions.is_empty() {
            return Self::default();
        }
        Self { repetitions }
    }

    /// Single value, no repetitions or components.
    pub fn text(value: impl Into<String>) -> Self {
        Self::new(vec![Repetition::text(value)])
    }

    /// One repetition made of plain components, e.g. `["DOE", "JOHN"]`.
    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components = components.into_iter().map(|c| Component::text(c)).collect();
        Self::new(vec![Repetition::new(components)])
    }

    pub fn repetitions(&self) -> &[Repetition] {
        &self.repetitions
    }

    /// 1-based.
    pub fn repetition(&self, index: usize) -> Option<&Repetition> {
        index.checked_sub(1).and_then(|i| self.repetitions.get(i))
    }

    pub fn repetition_mut(&mut self, index: usize) -> Option<&mut Repetition> {
        let i = index.checked_sub(1)?;
        self.repetitions.get_mut(i)
    }

    pub fn push_repetition(&mut self, repetition: Repetition) {
        if self.is_empty() {
            self.repetitions.clear();
        }
        self.repetitions.push(repetition);
    }

    pub fn first(&self) -> &Repetition {
        &self.repetitions[0]
    }

    /// Component of the first repetition, 1-based.
    pub fn component(&self, index: usize) -> Option<&Component> {
        self.first().component(index)
    }

    /// First leaf of the first repetition.
    pub fn value(&self) -> &str {
        self.first().value()
    }

    pub fn len(&self) -> usize {
        self.repetitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repetitions.iter().all(Repetition::is_empty)
    }

    /// The explicit HL7 null (`""`), as opposed to an absent value.
    pub fn is_null(&self) -> bool {
        self.repetitions.len() == 1
            && self.repetitions[0].len() == 1
            && self.value() == "\"\""
    }

    /// Repetitions that carry data.
    pub fn populated(&self) -> impl Iterator<Item = &Repetition> {
        self.repetitions.iter().filter(|r| !r.is_empty())
    }
}

impl From<Vec<Repetition>> for Field {
    fn from(repetitions: Vec<Repetition>) -> Self {
        Self::new(repetitions)
    }
}

impl From<Field> for Vec<Repetition> {
    fn from(value: Field) -> Self {
        value.repetitions
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::text(value)
    }
}

/// A named record. Fields are 1-indexed; for `MSH`, `BHS` and `FHS` field 1
/// is the field separator and field 2 the encoding characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    name: String,
    fields: Vec<Field>,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_fields(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Header segment (`MSH`, `BHS`, `FHS`) with fields 1 and 2 filled in
    /// from `delimiters`.
    pub fn header(name: impl Into<String>, delimiters: &DelimiterSet) -> Self {
        Self::with_fields(
            name,
            vec![
                Field::text(delimiters.field().to_string()),
                Field::text(delimiters.encoding_characters()),
            ],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_header(&self) -> bool {
        is_header_segment(&self.name)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// 1-based; out of range gives `None`.
    pub fn field(&self, index: usize) -> Option<&Field> {
        index.checked_sub(1).and_then(|i| self.fields.get(i))
    }

    pub fn field_mut(&mut self, index: usize) -> Option<&mut Field> {
        let i = index.checked_sub(1)?;
        self.fields.get_mut(i)
    }

    /// First leaf of field `index`.
    pub fn value(&self, index: usize) -> Option<&str> {
        self.field(index).map(Field::value)
    }

    /// Replace field `index`, padding with empty fields. Returns the field
    /// that was replaced, if there was one.
    pub fn set_field(&mut self, index: usize, field: Field) -> Option<Field> {
        let i = index.checked_sub(1)?;
        if self.fields.len() <= i {
            self.fields.resize_with(i + 1, Field::default);
            self.fields[i] = field;
            return None;
        }
        Some(std::mem::replace(&mut self.fields[i], field))
    }

    pub fn push_field(&mut self, field: Field) {
        self.fields.push(field);
    }
}

/// A parsed or built ER7 message: non-empty, starts with `MSH`, owns its
/// segments and its delimiter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageData", into = "MessageData")]
pub struct Message {
    delimiters: DelimiterSet,
    segments: Vec<Segment>,
}

#[derive(Serialize, Deserialize)]
struct MessageData {
    delimiters: DelimiterSet,
    segments: Vec<Segment>,
}

impl TryFrom<MessageData> for Message {
    type Error = StructuralError;

    fn try_from(data: MessageData) -> Result<Self, Self::Error> {
        for segment in data.segments.iter().filter(|s| s.is_header()) {
            check_declared_delimiters(segment, &data.delimiters)?;
        }
        Message::new(data.delimiters, data.segments)
    }
}

/// Header fields 1 and 2 must spell out `delimiters`. Characters past the
/// four encoding characters (the 2.7 truncation character) may not repeat a
/// delimiter.
fn check_declared_delimiters(segment: &Segment, delimiters: &DelimiterSet) -> Result<(), StructuralError> {
    let separator = segment.field(1).map(Field::value).unwrap_or("");
    let encoding = segment.field(2).map(Field::value).unwrap_or("");
    let expected = delimiters.encoding_characters();

    let declared_ok = separator.chars().eq(std::iter::once(delimiters.field()))
        && encoding.starts_with(&expected)
        && !encoding[expected.len()..]
            .chars()
            .any(|c| delimiters.is_delimiter(c) || c == '\r' || c == '\n');
    if declared_ok {
        return Ok(());
    }
    Err(StructuralError::new(
        StructuralErrorKind::HeaderMismatch,
        format!(
            "{} declares {:?} {:?} but the message uses {}",
            segment.name(),
            separator,
            encoding,
            delimiters
        ),
    ))
}

impl From<Message> for MessageData {
    fn from(message: Message) -> Self {
        MessageData {
            delimiters: message.delimiters,
            segments: message.segments,
        }
    }
}

impl Message {
    pub fn new(delimiters: DelimiterSet, segments: Vec<Segment>) -> Result<Self, StructuralError> {
        match segments.first() {
            Some(first) if first.name() == "MSH" => Ok(Self {
                delimiters,
                segments,
            }),
            _ => Err(StructuralError::missing_msh()),
        }
    }

    pub fn delimiters(&self) -> &DelimiterSet {
        &self.delimiters
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// 0-based position in the message.
    pub fn segment_at(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn segment_at_mut(&mut self, index: usize) -> Option<&mut Segment> {
        self.segments.get_mut(index)
    }

    /// First segment with this name.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn segment_mut(&mut self, name: &str) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name() == name)
    }

    pub fn push_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Insert before position `index` (0-based). Nothing may be placed ahead
    /// of the `MSH`.
    pub fn insert_segment(&mut self, index: usize, segment: Segment) -> Result<(), StructuralError> {
        if index == 0 {
            return Err(StructuralError::missing_msh());
        }
        let index = index.min(self.segments.len());
        self.segments.insert(index, segment);
        Ok(())
    }

    /// Remove the segment at `index` (0-based). The `MSH` cannot be removed.
    pub fn remove_segment(&mut self, index: usize) -> Option<Segment> {
        if index == 0 || index >= self.segments.len() {
            return None;
        }
        Some(self.segments.remove(index))
    }

    pub fn header(&self) -> Option<&Segment> {
        self.segments.first().filter(|s| s.name() == "MSH")
    }

    fn header_component(&self, field: usize, component: usize) -> Option<&str> {
        self.header()
            .and_then(|msh| msh.field(field))
            .and_then(|f| f.component(component))
            .map(Component::value)
            .filter(|v| !v.is_empty())
    }

    /// MSH-10.
    pub fn control_id(&self) -> Option<&str> {
        self.header_component(10, 1)
    }

    /// MSH-12, first component.
    pub fn version(&self) -> Option<&str> {
        self.header_component(12, 1)
    }

    /// MSH-9.1, e.g. `ADT`.
    pub fn message_type(&self) -> Option<&str> {
        self.header_component(9, 1)
    }

    /// MSH-9.2, e.g. `A01`.
    pub fn trigger_event(&self) -> Option<&str> {
        self.header_component(9, 2)
    }

    /// MSH-9.3, e.g. `ADT_A01`.
    pub fn message_structure(&self) -> Option<&str> {
        self.header_component(9, 3)
    }

    pub fn get(&self, path: &FieldPath) -> Option<&str> {
        path.resolve(self)
    }

    /// Parse `path` (e.g. `PID-5-2`) and look it up.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        path.parse::<FieldPath>().ok().and_then(|p| p.resolve(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let ds = DelimiterSet::default();
        let mut msh = Segment::header("MSH", &ds);
        msh.set_field(3, Field::text("APP"));
        msh.set_field(9, Field::from_components(["ADT", "A01", "ADT_A01"]));
        msh.set_field(10, Field::text("CTRL1"));
        msh.set_field(12, Field::text("2.5"));

        let mut pid = Segment::new("PID");
        pid.set_field(3, Field::text("MRN123"));
        pid.set_field(5, Field::from_components(["DOE", "JOHN"]));

        Message::new(ds, vec![msh, pid]).unwrap()
    }

    #[test]
    fn test_header_accessors() {
        let msg = sample();
        assert_eq!(msg.control_id(), Some("CTRL1"));
        assert_eq!(msg.version(), Some("2.5"));
        assert_eq!(msg.message_type(), Some("ADT"));
        assert_eq!(msg.trigger_event(), Some("A01"));
        assert_eq!(msg.message_structure(), Some("ADT_A01"));
        assert_eq!(msg.header().unwrap().value(1), Some("|"));
        assert_eq!(msg.header().unwrap().value(2), Some("^~\\&"));
    }

    #[test]
    fn test_out_of_range_access_is_none() {
        let msg = sample();
        let pid = msg.segment("PID").unwrap();
        assert_eq!(pid.field_count(), 5);
        assert!(pid.field(99).is_none());
        assert!(pid.field(0).is_none());
        assert!(pid.field(5).unwrap().repetition(2).is_none());
        assert!(pid.field(5).unwrap().component(7).is_none());
        assert!(pid.field(5).unwrap().component(1).unwrap().subcomponent(3).is_none());
        assert!(msg.segment("ZZZ").is_none());
    }

    #[test]
    fn test_set_field_pads_and_replaces() {
        let mut seg = Segment::new("NTE");
        assert!(seg.set_field(3, Field::text("note")).is_none());
        assert_eq!(seg.field_count(), 3);
        assert!(seg.field(1).unwrap().is_empty());
        let old = seg.set_field(3, Field::text("changed")).unwrap();
        assert_eq!(old.value(), "note");
        assert_eq!(seg.value(3), Some("changed"));
        assert!(seg.set_field(0, Field::text("x")).is_none());
        assert_eq!(seg.field_count(), 3);
    }

    #[test]
    fn test_message_requires_msh_first() {
        let err = Message::new(DelimiterSet::default(), vec![Segment::new("PID")]).unwrap_err();
        assert_eq!(err.kind, crate::errors::StructuralErrorKind::MissingMsh);
        assert!(Message::new(DelimiterSet::default(), Vec::new()).is_err());
    }

    #[test]
    fn test_msh_cannot_be_displaced() {
        let mut msg = sample();
        assert!(msg.insert_segment(0, Segment::new("EVN")).is_err());
        assert!(msg.remove_segment(0).is_none());
        msg.insert_segment(1, Segment::new("EVN")).unwrap();
        assert_eq!(msg.segment_at(1).unwrap().name(), "EVN");
        assert_eq!(msg.remove_segment(1).unwrap().name(), "EVN");
    }

    #[test]
    fn test_component_collapse_and_subcomponents() {
        let single = Component::from_subcomponents(vec![Subcomponent::new("a")]);
        assert!(!single.is_composite());
        let multi = Component::from_subcomponents(vec!["a".into(), "b".into()]);
        assert!(multi.is_composite());
        assert_eq!(multi.subcomponent(2).unwrap().value(), "b");
        assert_eq!(multi.value(), "a");
    }

    #[test]
    fn test_component_json_keeps_parser_shape() {
        let single: Component = serde_json::from_str(r#"["x"]"#).unwrap();
        assert_eq!(single, Component::text("x"));

        let pair: Component = serde_json::from_str(r#"["x", "y"]"#).unwrap();
        assert!(pair.is_composite());

        assert!(serde_json::from_str::<Component>("[]").is_err());
    }

    #[test]
    fn test_message_json_checks_declared_delimiters() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert_eq!(serde_json::from_str::<Message>(&json).unwrap(), sample());

        let tampered = json.replacen(r#"[["^~\\&"]]"#, r#"[["^~\\&&"]]"#, 1);
        assert_ne!(tampered, json);
        assert!(serde_json::from_str::<Message>(&tampered).is_err());

        let wrong_separator = json.replacen(r#"[["|"]]"#, r##"[["#"]]"##, 1);
        assert!(serde_json::from_str::<Message>(&wrong_separator).is_err());

        let bare = r#"{"delimiters": "|^~\\&", "segments": [{"name": "MSH", "fields": []}]}"#;
        assert!(serde_json::from_str::<Message>(bare).is_err());
    }

    #[test]
    fn test_encoding_tail_is_accepted() {
        let ds = DelimiterSet::default();
        let mut msh = Segment::header("MSH", &ds);
        msh.set_field(2, Field::text("^~\\&#"));
        let json = serde_json::to_string(&Message::new(ds, vec![msh]).unwrap()).unwrap();
        assert!(serde_json::from_str::<Message>(&json).is_ok());

        assert!(check_declared_delimiters(&Segment::header("BHS", &ds), &ds).is_ok());
    }

    #[test]
    fn test_set_value_forgets_source() {
        let mut leaf = Subcomponent::with_source("A".to_string(), "\\X41\\".to_string());
        assert_eq!(leaf.source(), Some("\\X41\\"));
        leaf.set_value("B");
        assert!(leaf.source().is_none());
        assert_eq!(leaf, Subcomponent::new("B"));
    }

    #[test]
    fn test_push_repetition_replaces_empty_placeholder() {
        let mut field = Field::default();
        field.push_repetition(Repetition::text("one"));
        field.push_repetition(Repetition::text("two"));
        assert_eq!(field.len(), 2);
        assert_eq!(field.repetition(2).unwrap().value(), "two");
    }

    #[test]
    fn test_null_field() {
        assert!(Field::text("\"\"").is_null());
        assert!(!Field::text("").is_null());
    }
}
