//! YAML documents as JSON values
//!
//! Config files and manifest documents are written in YAML but handled as
//! JSON everywhere downstream. Conversion refuses what JSON cannot carry,
//! such as `.inf`/`.nan` or a mapping used as a key, and names the path of
//! the offending node.

use std::fmt::Display;

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// YAML that failed to parse or has no JSON form
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// Parse the first YAML document in `input`.
///
/// Empty or comment-only input is `Value::Null`.
pub fn parse_document(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => to_json(doc, &mut Vec::new()),
        None => Ok(Value::Null),
    }
}

fn error_at(path: &[String], message: impl Display) -> YamlError {
    let at = path.concat();
    match at.trim_start_matches('.') {
        "" => YamlError(message.to_string()),
        at => YamlError(format!("{}: {}", at, message)),
    }
}

fn to_json(node: Yaml, path: &mut Vec<String>) -> Result<Value, YamlError> {
    let value = match node {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::from(i),
        Yaml::Real(repr) => repr
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| error_at(path, format!("'{}' has no JSON representation", repr)))?,
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                path.push(format!("[{}]", i));
                out.push(to_json(item, path)?);
                path.pop();
            }
            Value::Array(out)
        }
        Yaml::Hash(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                let key = key_string(k, path)?;
                path.push(format!(".{}", key));
                let v = to_json(v, path)?;
                path.pop();
                out.insert(key, v);
            }
            Value::Object(out)
        }
        Yaml::Alias(_) => return Err(error_at(path, "unresolved alias")),
        Yaml::BadValue => return Err(error_at(path, "bad value")),
    };
    Ok(value)
}

fn key_string(key: Yaml, path: &[String]) -> Result<String, YamlError> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(error_at(path, "mapping keys must be scalars")),
    }
}
