use crate::base_parser::{detect_format, sniff_delimiters, FormatHint, Parser};
use crate::batch::BatchResult;
use crate::config::Er7Config;
use crate::parsers::{all_parsers, all_parsers_with};
use crate::ParseError;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Bytes inspected before choosing a parser.
const SAMPLE_LEN: u64 = 512;

/// Picks a parser for an input, by file extension or by its first line.
///
/// New formats are added in `parsers.rs`; a parser is found through its
/// `format()` hint first and its `can_parse` check second.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::from_parsers(all_parsers())
    }

    /// Registry whose ER7 reader uses the stream settings of `config`.
    pub fn with_config(config: &Er7Config) -> Self {
        debug!("ER7 reader chunk size {}", config.stream.chunk_size);
        Self::from_parsers(all_parsers_with(&config.stream))
    }

    fn from_parsers(parsers: Vec<Box<dyn Parser>>) -> Self {
        let names: Vec<_> = parsers.iter().map(|p| p.name()).collect();
        info!("ParserRegistry ready with {} parsers: {}", names.len(), names.join(", "));
        Self { parsers }
    }

    /// Add a parser; it is consulted after the built-in ones.
    pub fn register(&mut self, parser: Box<dyn Parser>) {
        info!("Registering parser '{}' for {:?}", parser.name(), parser.extensions());
        self.parsers.push(parser);
    }

    pub fn get_parser(&self, name: &str) -> Option<&dyn Parser> {
        self.find(|p| p.name() == name)
    }

    /// Case-insensitive, with or without the leading dot.
    pub fn get_parser_by_extension(&self, extension: &str) -> Option<&dyn Parser> {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        self.find(|p| p.extensions().contains(&extension.as_str()))
    }

    /// Parser for an input starting with `sample`.
    pub fn detect(&self, sample: &[u8]) -> Option<&dyn Parser> {
        let hint = detect_format(sample);
        let parser = match hint {
            FormatHint::Unknown => None,
            hint => self.find(|p| p.format() == hint),
        };
        let parser = parser.or_else(|| self.find(|p| p.can_parse(sample)));

        match (hint, sniff_delimiters(sample)) {
            (FormatHint::Er7 | FormatHint::Batch, Some(delimiters)) => {
                debug!("Input declares delimiters {}", delimiters)
            }
            (FormatHint::Er7 | FormatHint::Batch, None) => {
                warn!("Input starts with a malformed {:?} header", hint)
            }
            _ => {}
        }
        parser
    }

    /// Pick a parser from the content and read every message.
    pub fn parse_auto(&self, mut reader: Box<dyn Read>) -> Result<BatchResult, ParseError> {
        let mut sample = Vec::new();
        reader.by_ref().take(SAMPLE_LEN).read_to_end(&mut sample)?;

        let Some(parser) = self.detect(&sample) else {
            error!("No parser recognises input starting with {:?}", String::from_utf8_lossy(&sample[..sample.len().min(16)]));
            return Err(ParseError::Custom("unrecognised input format".to_string()));
        };

        info!("Reading input as {}", parser.name());
        let result = parser.parse(Box::new(Cursor::new(sample).chain(reader)))?;
        log_outcome(parser.name(), &result);
        Ok(result)
    }

    /// Use the parser registered for the file's extension, falling back to
    /// content detection.
    pub fn parse_with_hint(&self, reader: Box<dyn Read>, filename: &str) -> Result<BatchResult, ParseError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match self.get_parser_by_extension(extension) {
            Some(parser) => {
                info!("Reading {} as {}", filename, parser.name());
                let result = parser.parse(reader)?;
                log_outcome(parser.name(), &result);
                Ok(result)
            }
            None => {
                debug!("No parser for extension {:?} of {}, detecting from content", extension, filename);
                self.parse_auto(reader)
            }
        }
    }

    pub fn parse_path(&self, path: impl AsRef<Path>) -> Result<BatchResult, ParseError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        self.parse_with_hint(Box::new(BufReader::new(file)), &path.to_string_lossy())
    }

    fn find(&self, predicate: impl Fn(&dyn Parser) -> bool) -> Option<&dyn Parser> {
        self.parsers.iter().map(|p| p.as_ref()).find(|p| predicate(*p))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn log_outcome(parser: &str, result: &BatchResult) {
    if result.is_clean() {
        info!("{} read {} messages", parser, result.messages.len());
    } else {
        warn!(
            "{} read {} messages; {} failed, {} envelope segments rejected",
            parser,
            result.messages.len(),
            result.errors.len(),
            result.envelope_errors.len()
        );
    }
}
