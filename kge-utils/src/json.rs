use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{to_string, to_string_pretty, to_value, Map, Value};
use std::{fs, path::Path};

pub fn dejsonify<'a, T>(json_str: &'a str) -> serde_json::Result<T>
where
    T: Deserialize<'a>,
{
    serde_json::from_str::<T>(json_str)
}

pub fn jsonify<T>(obj: &T) -> String
where
    T: Serialize,
{
    to_string(&jsonify_internal(
        &to_value(obj).expect("to_value failed on serializable object"),
    ))
    .expect("to_string failed on serializable object")
}

pub fn jsonify_pretty<T>(obj: &T) -> String
where
    T: Serialize,
{
    to_string_pretty(&jsonify_internal(
        &to_value(obj).expect("to_value failed on serializable object"),
    ))
    .expect("to_string failed on serializable object")
}

pub fn jsonify_internal(json_value: &Value) -> Value {
    match json_value {
        Value::Object(obj) => {
            let mut sorted_map = Map::new();
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            for key in keys {
                if let Some(value) = obj.get(key) {
                    sorted_map.insert(key.clone(), jsonify_internal(value));
                }
            }
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(jsonify_internal).collect()),
        _ => json_value.clone(),
    }
}

/// Accepts either an inline json string or a path to a json file.
pub fn load_json_arg<T>(json_or_path: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let trimmed = json_or_path.trim_start();
    let content = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        json_or_path.to_string()
    } else {
        fs::read_to_string(json_or_path)
            .map_err(|e| anyhow!("Failed to read json file '{}': {}", json_or_path, e))?
    };
    dejsonify::<T>(&content).map_err(|e| anyhow!("Failed to parse json: {}", e))
}

pub fn read_json_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
    dejsonify::<T>(&content).map_err(|e| anyhow!("Failed to parse '{}': {}", path.display(), e))
}

pub fn write_json_file<T>(path: &Path, obj: &T) -> Result<()>
where
    T: Serialize,
{
    fs::write(path, jsonify_pretty(obj))
        .map_err(|e| anyhow!("Failed to write '{}': {}", path.display(), e))
}
