//! `--override key.path=value` support for the configuration file.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::{
    config::ExtractionConfig,
    error::{ExtractionError, Result},
};

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideArg {
    pub path: String,
    pub value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Applies overrides through the config's JSON form and re-deserialises it.
pub fn apply_overrides(
    config: ExtractionConfig,
    overrides: &[OverrideArg],
) -> Result<ExtractionConfig> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        ExtractionError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;
    for override_arg in overrides {
        let segments: Vec<&str> = override_arg.path.split('.').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(ExtractionError::ConfigFormat(format!(
                "invalid override path '{}'",
                override_arg.path
            )));
        }
        assign(&mut value, &segments, &override_arg.value)?;
    }
    serde_json::from_value(value).map_err(|err| {
        ExtractionError::ConfigFormat(format!("config is invalid after overrides: {err}"))
    })
}

/// Booleans, null, numbers and JSON arrays/objects are typed; anything else is a string.
pub fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn assign(target: &mut Value, segments: &[&str], raw: &str) -> Result<()> {
    let Some((key, rest)) = segments.split_first() else {
        // String fields such as `job_id` take the override text verbatim.
        *target = match (&*target, parse_value(raw)) {
            (Value::String(_), Value::Number(_) | Value::Bool(_)) => {
                Value::String(raw.trim().to_string())
            }
            (_, value) => value,
        };
        return Ok(());
    };
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return Err(ExtractionError::ConfigFormat(format!(
            "override segment '{key}' points into a non-table value"
        )));
    };
    let entry = map.entry(key.to_string()).or_insert(Value::Null);
    assign(entry, rest, raw)
}
