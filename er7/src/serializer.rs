use crate::config::SerializeOptions;
use crate::delimiters::{DelimiterSet, SEGMENT_TERMINATOR};
use crate::escape;
use crate::types::{Component, Field, Message, Repetition, Segment, Subcomponent};

/// Render a message as ER7 text with the default options: segments joined by
/// `\r`, no trailing terminator, every empty position kept.
pub fn serialize(message: &Message) -> String {
    serialize_with(message, &SerializeOptions::default())
}

pub fn serialize_with(message: &Message, options: &SerializeOptions) -> String {
    let delimiters = message.delimiters();
    let mut out = String::new();
    for (i, segment) in message.segments().iter().enumerate() {
        if i > 0 {
            out.push(SEGMENT_TERMINATOR);
        }
        write_segment(&mut out, segment, delimiters, options);
    }
    if options.trailing_terminator {
        out.push(SEGMENT_TERMINATOR);
    }
    out
}

/// Render one segment without a terminator.
pub fn serialize_segment(segment: &Segment, delimiters: &DelimiterSet) -> String {
    let mut out = String::new();
    write_segment(&mut out, segment, delimiters, &SerializeOptions::default());
    out
}

pub(crate) fn write_segment(
    out: &mut String,
    segment: &Segment,
    delimiters: &DelimiterSet,
    options: &SerializeOptions,
) {
    out.push_str(segment.name());

    let mut fields = segment.fields();
    if segment.is_header() {
        // MSH-1 and MSH-2 always come from the message's delimiters; anything
        // declared past the four encoding characters is kept
        out.push(delimiters.field());
        out.push_str(&delimiters.encoding_characters());
        if let Some(declared) = segment.field(2) {
            out.extend(declared.value().chars().skip(4));
        }
        fields = &fields[fields.len().min(2)..];
    }

    let rendered = fields.iter().map(|f| render_field(f, delimiters, options)).collect();
    for field in trimmed(rendered, options) {
        out.push(delimiters.field());
        out.push_str(&field);
    }
}

/// ER7 text of one field, without the surrounding separators.
pub(crate) fn field_text(field: &Field, delimiters: &DelimiterSet) -> String {
    render_field(field, delimiters, &SerializeOptions::default())
}

fn render_field(field: &Field, delimiters: &DelimiterSet, options: &SerializeOptions) -> String {
    let parts = field
        .repetitions()
        .iter()
        .map(|r| render_repetition(r, delimiters, options))
        .collect();
    join(parts, delimiters.repetition(), options)
}

fn render_repetition(repetition: &Repetition, delimiters: &DelimiterSet, options: &SerializeOptions) -> String {
    let parts = repetition
        .components()
        .iter()
        .map(|c| render_component(c, delimiters, options))
        .collect();
    join(parts, delimiters.component(), options)
}

fn render_component(component: &Component, delimiters: &DelimiterSet, options: &SerializeOptions) -> String {
    match component {
        Component::Text(leaf) => render_leaf(leaf, delimiters),
        Component::Subcomponents(leaves) => {
            let parts = leaves.iter().map(|l| render_leaf(l, delimiters)).collect();
            join(parts, delimiters.subcomponent(), options)
        }
    }
}

fn render_leaf(leaf: &Subcomponent, delimiters: &DelimiterSet) -> String {
    match leaf.source() {
        Some(source) => source.to_string(),
        None => escape::encode(leaf.value(), delimiters),
    }
}

fn trimmed(mut parts: Vec<String>, options: &SerializeOptions) -> Vec<String> {
    if options.trim_trailing {
        while parts.last().map_or(false, |p| p.is_empty()) {
            parts.pop();
        }
    }
    parts
}

fn join(parts: Vec<String>, separator: char, options: &SerializeOptions) -> String {
    let mut buf = [0u8; 4];
    let separator: &str = separator.encode_utf8(&mut buf);
    trimmed(parts, options).join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::er7_parser::parse;

    const SCENARIO_A: &str = "MSH|^~\\&|A|B|C|D|20240101120000||ADT^A01|123|P|2.5\rPID|||MRN123||DOE^JOHN";

    fn round_trip(text: &str) {
        let msg = parse(text).unwrap();
        assert_eq!(serialize(&msg), text);
    }

    #[test]
    fn test_round_trip_scenario_a() {
        round_trip(SCENARIO_A);
    }

    #[test]
    fn test_round_trip_keeps_empty_positions() {
        round_trip("MSH|^~\\&|A||||||ADT^A01^|1|P|2.5|||\rPID|1||^^~&||x^&^|");
    }

    #[test]
    fn test_round_trip_escapes() {
        round_trip("MSH|^~\\&|A\\F\\B\rNTE|1||DOE\\F\\JOHN\\S\\\\E\\\\.br\\end");
        round_trip("MSH|^~\\&|A\rNTE|1||\\X41\\BC \\Zvendor\\ \\H\\bold\\N\\ \\.sp2\\");
    }

    #[test]
    fn test_round_trip_custom_delimiters() {
        round_trip("MSH#$*!@#APP#FAC\rPID###ID1*ID2###DOE$JANE!F!X@Q");
    }

    #[test]
    fn test_round_trip_keeps_encoding_tail() {
        round_trip("MSH|^~\\&#|A|B");
    }

    #[test]
    fn test_line_endings_normalized_to_cr() {
        let crlf = SCENARIO_A.replace('\r', "\r\n");
        assert_eq!(serialize(&parse(&crlf).unwrap()), SCENARIO_A);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let inputs = [
            SCENARIO_A.to_string(),
            SCENARIO_A.replace('\r', "\n"),
            "MSH|^~\\&|A\rNTE|1||\\X41\\BC".to_string(),
        ];
        for input in inputs {
            let once = parse(&input).unwrap();
            let twice = parse(&serialize(&once)).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_trailing_terminator_option() {
        let msg = parse(SCENARIO_A).unwrap();
        let options = SerializeOptions {
            trailing_terminator: true,
            ..SerializeOptions::default()
        };
        assert_eq!(serialize_with(&msg, &options), format!("{}\r", SCENARIO_A));
    }

    #[test]
    fn test_trim_trailing_option() {
        let msg = parse("MSH|^~\\&|A|||\rPID|1|a^^~||x&&|||").unwrap();
        let options = SerializeOptions {
            trim_trailing: true,
            ..SerializeOptions::default()
        };
        assert_eq!(serialize_with(&msg, &options), "MSH|^~\\&|A\rPID|1|a||x");
    }

    #[test]
    fn test_trim_never_drops_header_delimiters() {
        let msg = parse("MSH|^~\\&\rZZZ|||").unwrap();
        let options = SerializeOptions {
            trim_trailing: true,
            ..SerializeOptions::default()
        };
        assert_eq!(serialize_with(&msg, &options), "MSH|^~\\&\rZZZ");
    }

    #[test]
    fn test_edited_values_are_encoded() {
        let mut msg = parse("MSH|^~\\&|A\rNTE|1||\\X41\\").unwrap();
        let leaf = msg
            .segment_mut("NTE")
            .and_then(|s| s.field_mut(3))
            .and_then(|f| f.repetition_mut(1))
            .and_then(|r| r.component_mut(1))
            .and_then(|c| c.subcomponent_mut(1))
            .unwrap();
        leaf.set_value("A|B");
        assert_eq!(serialize(&msg), "MSH|^~\\&|A\rNTE|1||A\\F\\B");
    }

    #[test]
    fn test_build_from_scratch() {
        let ds = DelimiterSet::default();
        let mut msh = Segment::header("MSH", &ds);
        msh.set_field(3, Field::text("APP"));
        msh.set_field(9, Field::from_components(["ADT", "A01"]));
        let mut pid = Segment::new("PID");
        pid.set_field(5, Field::from_components(["O'NEIL", "ANN^MARIE"]));
        let msg = Message::new(ds, vec![msh, pid]).unwrap();

        assert_eq!(
            serialize(&msg),
            "MSH|^~\\&|APP||||||ADT^A01\rPID|||||O'NEIL^ANN\\S\\MARIE"
        );
        assert_eq!(serialize_segment(msg.segment_at(1).unwrap(), &ds), "PID|||||O'NEIL^ANN\\S\\MARIE");
    }
}
