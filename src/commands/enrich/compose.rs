use serde_json::{Map, Value};

use crate::util::truncate_chars;

pub const DEFAULT_MAX_DESCRIPTION_CHARS: usize = 2000;

const PART_SEPARATOR: &str = ". ";

/// Projects the requested fields into string fragments, in field order then value order.
///
/// Non-string top-level scalars are skipped; nested values are stringified.
pub fn flatten_fields(metadata: &Map<String, Value>, fields: &[String]) -> Vec<String> {
    let mut fragments = Vec::<String>::new();

    for field in fields {
        match metadata.get(field) {
            Some(Value::String(text)) => fragments.push(text.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    match item {
                        Value::Object(entries) => {
                            fragments.extend(entries.values().map(stringify_value));
                        }
                        other => fragments.push(stringify_value(other)),
                    }
                }
            }
            Some(Value::Object(entries)) => {
                fragments.extend(entries.values().map(stringify_value));
            }
            _ => {}
        }
    }

    fragments
}

/// Joins name, caption and flattened fragments, then hard-truncates.
pub fn compose_description(
    name: Option<&str>,
    caption: Option<&str>,
    fragments: &[String],
    max_chars: usize,
) -> String {
    let body = fragments.join(PART_SEPARATOR);
    let combined = [name.unwrap_or_default(), caption.unwrap_or_default(), body.as_str()]
        .join(PART_SEPARATOR);
    truncate_chars(&combined, max_chars)
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
