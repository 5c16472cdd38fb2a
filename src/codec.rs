//! Conversions between wire values and `serde_json` values.
//!
//! Query parameters arrive from callers as JSON, the most convenient
//! literal syntax in Rust, and leave the driver as typed wire values.
//! Result rows travel the other way.

use std::collections::HashMap;

use crate::error::{ClientError, ClientResult};
use crate::protocol::Value;

/// Convert a JSON object into named query parameters.
///
/// Accepts only an object (or `null` for no parameters); every other JSON
/// shape is a caller bug.
pub fn encode_params(params: serde_json::Value) -> ClientResult<HashMap<String, Value>> {
    match params {
        serde_json::Value::Null => Ok(HashMap::new()),
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(name, v)| Ok((name, json_to_value(v)?)))
            .collect(),
        other => Err(ClientError::Codec(format!(
            "Query parameters must be a JSON object, got {}",
            other
        ))),
    }
}

pub fn json_to_value(v: serde_json::Value) -> ClientResult<Value> {
    Ok(match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(ClientError::Codec(format!(
                    "Number out of range for a parameter: {}",
                    n
                )));
            }
        }
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::List(
            items
                .into_iter()
                .map(json_to_value)
                .collect::<ClientResult<Vec<_>>>()?,
        ),
        serde_json::Value::Object(_) => {
            // Structs are positional on the wire; a JSON object loses the
            // field order the server expects.
            return Err(ClientError::Codec(
                "Object parameters are not supported; pass an array".to_string(),
            ));
        }
    })
}

pub fn value_to_json(v: Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Int(i) => serde_json::json!(i),
        Value::Float(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s),
        Value::Bytes(b) => {
            // No binary type in JSON; surface bytes as a number array.
            serde_json::Value::Array(b.into_iter().map(|x| serde_json::json!(x)).collect())
        }
        Value::List(items) | Value::Struct(items) => {
            serde_json::Value::Array(items.into_iter().map(value_to_json).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_params_object() {
        let params = encode_params(serde_json::json!({
            "id": 7,
            "name": "ada",
            "ratio": 0.5,
            "tags": ["a", "b"],
            "missing": null,
        }))
        .unwrap();

        assert_eq!(params["id"], Value::Int(7));
        assert_eq!(params["name"], Value::Str("ada".into()));
        assert_eq!(params["ratio"], Value::Float(0.5));
        assert_eq!(
            params["tags"],
            Value::List(vec![Value::Str("a".into()), Value::Str("b".into())])
        );
        assert_eq!(params["missing"], Value::Null);
    }

    #[test]
    fn test_encode_params_null_is_empty() {
        assert!(encode_params(serde_json::Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_encode_params_rejects_non_object() {
        let err = encode_params(serde_json::json!([1, 2])).unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));

        let err = encode_params(serde_json::json!({ "bad": { "nested": 1 } })).unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));
    }

    #[test]
    fn test_value_to_json_round_trips_scalars() {
        assert_eq!(value_to_json(Value::Int(-3)), serde_json::json!(-3));
        assert_eq!(value_to_json(Value::Bool(true)), serde_json::json!(true));
        assert_eq!(
            value_to_json(Value::Str("x".into())),
            serde_json::json!("x")
        );
        assert_eq!(value_to_json(Value::Null), serde_json::Value::Null);
        assert_eq!(
            value_to_json(Value::Bytes(vec![1, 255])),
            serde_json::json!([1, 255])
        );
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(
            value_to_json(Value::Float(f64::NAN)),
            serde_json::Value::Null
        );
    }
}
