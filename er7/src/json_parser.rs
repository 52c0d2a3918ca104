use crate::base_parser::{FormatHint, Parser};
use crate::batch::BatchResult;
use crate::{Message, ParseError};
use std::io::Read;
use tracing::{error, info};

/// Message tree as compact JSON:
/// `{"delimiters": "|^~\\&", "segments": [{"name": "PID", "fields": [[["MRN123"]]]}]}`.
///
/// A field is a list of repetitions, a repetition a list of components and a
/// component either a string or a list of subcomponent strings. Values are
/// the decoded ones.
pub fn to_json(message: &Message) -> Result<String, ParseError> {
    Ok(serde_json::to_string(message)?)
}

pub fn to_json_pretty(message: &Message) -> Result<String, ParseError> {
    Ok(serde_json::to_string_pretty(message)?)
}

/// Rebuild a message; fails unless the first segment is `MSH` and the
/// delimiters are valid.
pub fn from_json(text: &str) -> Result<Message, ParseError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum JsonDocument {
    Many(Vec<Message>),
    One(Message),
}

/// JSON parser - handles one message object or an array of them
pub struct JsonParser;

impl Parser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn format(&self) -> FormatHint {
        FormatHint::Json
    }

    fn can_parse(&self, data: &[u8]) -> bool {
        let sample = String::from_utf8_lossy(data);
        let trimmed = sample.trim_start();

        trimmed.starts_with('[') || (trimmed.starts_with('{') && trimmed.contains("\"segments\""))
    }

    /// The document is decoded as a whole, so any invalid message fails the
    /// call.
    fn parse(&self, mut reader: Box<dyn Read>) -> Result<BatchResult, ParseError> {
        info!("Starting JSON message parsing");
        let mut buffer = Vec::new();

        if let Err(e) = reader.read_to_end(&mut buffer) {
            error!("Failed to read JSON data: {}", e);
            return Err(e.into());
        }

        let messages = match serde_json::from_slice::<JsonDocument>(&buffer) {
            Ok(JsonDocument::Many(messages)) => messages,
            Ok(JsonDocument::One(message)) => vec![message],
            Err(e) => {
                error!("Failed to parse JSON messages: {}", e);
                return Err(e.into());
            }
        };
        info!("JSON parsing complete: {} messages from {} bytes", messages.len(), buffer.len());

        let mut result = BatchResult::default();
        if let Some(first) = messages.first() {
            result.envelope.delimiters = *first.delimiters();
        }
        result.messages = messages;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::er7_parser::parse;
    use crate::serializer::serialize;
    use std::io::Cursor;

    const SCENARIO_A: &str = "MSH|^~\\&|A|B|C|D|20240101120000||ADT^A01|123|P|2.5\rPID|||MRN123~MRN9||DOE^JOHN&Q";

    #[test]
    fn test_json_shape() {
        let msg = parse("MSH|^~\\&|A\rPID|||MRN123||DOE^JOHN&Q").unwrap();
        let value: serde_json::Value = serde_json::from_str(&to_json(&msg).unwrap()).unwrap();

        assert_eq!(value["delimiters"], "|^~\\&");
        assert_eq!(value["segments"][0]["fields"][0], serde_json::json!([["|"]]));
        assert_eq!(value["segments"][1]["name"], "PID");
        assert_eq!(value["segments"][1]["fields"][2], serde_json::json!([["MRN123"]]));
        assert_eq!(value["segments"][1]["fields"][4], serde_json::json!([["DOE", ["JOHN", "Q"]]]));
    }

    #[test]
    fn test_json_back_to_er7() {
        let msg = parse(SCENARIO_A).unwrap();
        let back = from_json(&to_json_pretty(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(serialize(&back), SCENARIO_A);
    }

    #[test]
    fn test_from_json_enforces_msh_first() {
        let json = r#"{"delimiters": "|^~\\&", "segments": [{"name": "PID", "fields": []}]}"#;
        assert!(from_json(json).is_err());

        let json = r#"{"delimiters": "||~\\&", "segments": [{"name": "MSH", "fields": []}]}"#;
        assert!(from_json(json).is_err());
    }

    #[test]
    fn test_json_import_matches_reparsed_text() {
        let json = r#"{"delimiters": "|^~\\&", "segments": [
            {"name": "MSH", "fields": [[["|"]], [["^~\\&"]]]},
            {"name": "PID", "fields": [[[["x"]]], [[["a", "b"]]]]}
        ]}"#;
        let imported = from_json(json).unwrap();
        assert_eq!(parse(&serialize(&imported)).unwrap(), imported);
        assert_eq!(serialize(&imported), "MSH|^~\\&\rPID|x|a&b");
    }

    #[test]
    fn test_json_import_rejects_mismatched_header() {
        let json = r#"{"delimiters": "|^~\\&", "segments": [
            {"name": "MSH", "fields": [[["|"]], [["^~\\&&"]]]}
        ]}"#;
        assert!(matches!(from_json(json), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_json_can_parse() {
        let parser = JsonParser;

        let valid = r#"[{"delimiters":"|^~\\&","segments":[]}]"#;
        assert!(parser.can_parse(valid.as_bytes()));

        let invalid = "MSH|^~\\&|A";
        assert!(!parser.can_parse(invalid.as_bytes()));
    }

    #[test]
    fn test_json_parse() {
        let parser = JsonParser;
        let msg = parse(SCENARIO_A).unwrap();
        let one = to_json(&msg).unwrap();
        let many = format!("[{},{}]", one, one);

        let result = parser.parse(Box::new(Cursor::new(many))).unwrap();
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].control_id(), Some("123"));

        let result = parser.parse(Box::new(Cursor::new(one))).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert!(result.errors.is_empty());
    }
}
