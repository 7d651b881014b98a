use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

use crate::error::BridgeError;
use crate::value::{Document, HostList, HostMap, HostValue, Number};

/// Builds fresh host storage from a JSON tree. Objects keep their key order.
pub fn from_json(value: &JsonValue) -> HostValue {
    match value {
        JsonValue::Null => HostValue::Null,
        JsonValue::Bool(flag) => HostValue::Bool(*flag),
        JsonValue::Number(number) => HostValue::Number(number_from_json(number)),
        JsonValue::String(text) => HostValue::Text(text.clone()),
        JsonValue::Array(items) => {
            HostValue::Sequence(items.iter().map(from_json).collect::<HostList>())
        }
        JsonValue::Object(entries) => HostValue::Mapping(HostMap::from_entries(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), from_json(item)))
                .collect::<IndexMap<_, _>>(),
        )),
    }
}

pub fn parse_json(text: &str) -> Result<HostValue, BridgeError> {
    let value: JsonValue = serde_json::from_str(text)?;
    Ok(from_json(&value))
}

fn number_from_json(number: &JsonNumber) -> Number {
    if let Some(value) = number.as_i64() {
        Number::Int(value)
    } else {
        Number::Float(number.as_f64().unwrap_or(f64::NAN))
    }
}

fn number_to_json(number: Number) -> JsonValue {
    match number {
        Number::Int(value) => JsonValue::from(value),
        Number::Float(value) => JsonNumber::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
    }
}

impl HostValue {
    /// JSON view of the value. Functions are dropped from objects and become
    /// `null` inside arrays; bytes become a number array.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(flag) => JsonValue::Bool(*flag),
            Self::Number(number) => number_to_json(*number),
            Self::Text(text) => JsonValue::String(text.clone()),
            Self::Sequence(list) => {
                JsonValue::Array(list.snapshot().iter().map(Self::to_json).collect())
            }
            Self::Mapping(map) => {
                let mut object = JsonMap::new();
                for (key, item) in map.snapshot() {
                    if matches!(item, Self::Function(_)) {
                        continue;
                    }
                    object.insert(key, item.to_json());
                }
                JsonValue::Object(object)
            }
            Self::Document(Document::Json(value)) => value.clone(),
            Self::Document(Document::Xml(xml)) => xml.to_json_value(),
            Self::Binary(bytes) => {
                JsonValue::Array(bytes.iter().map(|byte| JsonValue::from(*byte)).collect())
            }
            Self::Function(_) => JsonValue::Null,
            Self::Opaque(opaque) => JsonValue::String(format!("[{}]", opaque.type_name())),
        }
    }
}

/// Drops every `null` member from objects, recursively. Array slots are kept.
pub fn strip_nulls(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(entries) => JsonValue::Object(
            entries
                .iter()
                .filter(|(_, item)| !item.is_null())
                .map(|(key, item)| (key.clone(), strip_nulls(item)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}

/// `$`, `$.a.b`, `$.list[0].name`, `$['key']` and `$.list[*].name` lookups.
/// Missing members resolve to `None`.
pub fn json_path(root: &JsonValue, path: &str) -> Result<Option<JsonValue>, BridgeError> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix('$') else {
        return Err(BridgeError::invalid_path(path, "json path must start with '$'"));
    };
    let steps = parse_json_path_steps(path, rest)?;
    let mut current = vec![root.clone()];
    let mut fanned_out = false;
    for step in steps {
        let mut next = Vec::new();
        for value in &current {
            match &step {
                JsonStep::Key(key) => {
                    if let Some(item) = value.as_object().and_then(|object| object.get(key)) {
                        next.push(item.clone());
                    }
                }
                JsonStep::Index(index) => {
                    if let Some(item) = value.as_array().and_then(|items| items.get(*index)) {
                        next.push(item.clone());
                    }
                }
                JsonStep::Wildcard => {
                    fanned_out = true;
                    match value {
                        JsonValue::Array(items) => next.extend(items.iter().cloned()),
                        JsonValue::Object(entries) => next.extend(entries.values().cloned()),
                        _ => {}
                    }
                }
            }
        }
        current = next;
    }
    if fanned_out {
        return Ok(Some(JsonValue::Array(current)));
    }
    Ok(current.into_iter().next())
}

#[derive(Debug, PartialEq)]
enum JsonStep {
    Key(String),
    Index(usize),
    Wildcard,
}

fn parse_json_path_steps(path: &str, rest: &str) -> Result<Vec<JsonStep>, BridgeError> {
    let chars = rest.chars().collect::<Vec<_>>();
    let mut steps = Vec::new();
    let mut index = 0usize;
    while index < chars.len() {
        match chars[index] {
            '.' => {
                index += 1;
                let start = index;
                while index < chars.len() && chars[index] != '.' && chars[index] != '[' {
                    index += 1;
                }
                let key = chars[start..index].iter().collect::<String>();
                if key.is_empty() {
                    return Err(BridgeError::invalid_path(path, "empty member name"));
                }
                steps.push(if key == "*" {
                    JsonStep::Wildcard
                } else {
                    JsonStep::Key(key)
                });
            }
            '[' => {
                let Some(close) = chars[index..].iter().position(|ch| *ch == ']') else {
                    return Err(BridgeError::invalid_path(path, "missing ']'"));
                };
                let inner = chars[index + 1..index + close]
                    .iter()
                    .collect::<String>();
                let inner = inner.trim();
                if inner == "*" {
                    steps.push(JsonStep::Wildcard);
                } else if let Some(quoted) = strip_quotes(inner) {
                    steps.push(JsonStep::Key(quoted.to_string()));
                } else {
                    let position = inner.parse::<usize>().map_err(|_| {
                        BridgeError::invalid_path(path, format!("bad index '{}'", inner))
                    })?;
                    steps.push(JsonStep::Index(position));
                }
                index += close + 1;
            }
            other => {
                return Err(BridgeError::invalid_path(
                    path,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }
    Ok(steps)
}

fn strip_quotes(text: &str) -> Option<&str> {
    text.strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| text.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')))
}
