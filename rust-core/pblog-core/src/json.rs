//! # JSON Serialization Module
//!
//! Request bodies are parsed with simd-json; replies and rows are serialized
//! with serde_json.

use crate::database::Row;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Parse JSON bytes to a typed value using simd-json
///
/// simd-json parses in place, so the buffer is clobbered.
///
/// # Errors
///
/// Returns `Error::InvalidJson` if parsing fails
pub fn parse_json<T: DeserializeOwned>(bytes: &mut [u8]) -> Result<T> {
    simd_json::from_slice(bytes).map_err(|e| Error::InvalidJson {
        reason: e.to_string(),
    })
}

/// Parse a JSON string to a typed value
///
/// # Errors
///
/// Returns `Error::InvalidJson` if parsing fails
pub fn parse_json_str<T: DeserializeOwned>(json_str: &str) -> Result<T> {
    let mut bytes = json_str.as_bytes().to_vec();
    parse_json(&mut bytes)
}

/// Serialize a value to JSON string
///
/// # Errors
///
/// Returns `Error::Json` if `value` cannot be represented as JSON
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Convert fetched rows into a JSON array of objects
///
/// # Errors
///
/// Returns `Error::Json` if a cell cannot be represented as JSON
pub fn rows_to_json(rows: &[Row]) -> Result<Value> {
    Ok(serde_json::to_value(rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbValue;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Blog {
        name: String,
        views: i32,
    }

    #[test]
    fn test_parse_json_object() {
        let blog: Blog = parse_json_str(r#"{"name": "hello", "views": 30}"#).unwrap();
        assert_eq!(blog.name, "hello");
        assert_eq!(blog.views, 30);
    }

    #[test]
    fn test_parse_json_map() {
        let map: HashMap<String, String> =
            parse_json_str(r#"{"key": "value", "count": "42"}"#).unwrap();
        assert_eq!(map.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_invalid_json() {
        let result: Result<Blog> = parse_json_str("not valid json");
        assert!(matches!(result, Err(Error::InvalidJson { .. })));
    }

    #[test]
    fn test_rows_to_json() {
        let mut row = Row::new();
        row.insert("id".to_string(), DbValue::Int(1));
        row.insert("name".to_string(), DbValue::from("Lily"));
        row.insert("email".to_string(), DbValue::Null);

        let value = rows_to_json(&[row]).unwrap();
        assert_eq!(value[0]["id"], 1);
        assert_eq!(value[0]["name"], "Lily");
        assert!(value[0]["email"].is_null());
        assert_eq!(to_json(&value[0]["id"]).unwrap(), "1");
    }
}
