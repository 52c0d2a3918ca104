/// Central parser registration module
///
/// Every input format the registry understands is listed here. When adding
/// a new one:
/// 1. Create the parser file (e.g., xml_parser.rs) implementing `Parser`
/// 2. Export it in lib.rs
/// 3. Add it to `all_parsers()` below

use crate::base_parser::Parser;
use crate::config::StreamOptions;
use crate::{BatchParser, Er7Parser, JsonParser};
use tracing::info;

/// Macro to build a parser list from parser values
///
/// Usage:
/// ```rust,ignore
/// register_parsers![
///     Er7Parser::default(),
///     BatchParser,
///     XmlParser,     // <-- Just add parser here
/// ]
/// ```
#[macro_export]
macro_rules! register_parsers {
    ($($parser:expr),* $(,)?) => {
        vec![
            $(Box::new($parser) as Box<dyn $crate::base_parser::Parser>),*
        ]
    };
}

/// Returns a vector of all available parsers with default options.
pub fn all_parsers() -> Vec<Box<dyn Parser>> {
    all_parsers_with(&StreamOptions::default())
}

/// Same as [`all_parsers`] with the ER7 stream settings supplied.
pub fn all_parsers_with(options: &StreamOptions) -> Vec<Box<dyn Parser>> {
    info!("Initializing parser collection");

    register_parsers![
        Er7Parser::with_options(options.clone()),
        BatchParser,
        JsonParser,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_parsers_names() {
        let names: Vec<_> = all_parsers().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["er7", "batch", "json"]);
    }
}
