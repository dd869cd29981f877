//! Envelope codec for values crossing a runtime boundary.
//!
//! Packed values are self-describing JSON envelopes:
//!
//! ```text
//! {"type": "integer", "value": 6}
//! {"type": "array",   "value": [{"type": "string", "value": "a"}]}
//! {"type": "table",   "rows": 2, "value": {"columns": {"x": [<packed>, <packed>]}}}
//! {"type": "image",   "mime": "image/png", "value": "<base64>"}
//! ```
//!
//! Nested values are packed recursively, so `unpack(pack(v)) == v` for every
//! variant.

use indexmap::IndexMap;
use serde_json::{Map, Value as Json, json};
use thiserror::Error;

use super::{Image, Table, Value};

/// Errors raised while unpacking an envelope.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// Input was not an object with a string `type` field.
    #[error("not a value envelope: {0}")]
    NotAnEnvelope(String),

    /// The `type` tag is not one this codec knows.
    #[error("unrecognized value type '{0}'")]
    UnknownType(String),

    /// The tag was recognized but the payload does not fit it.
    #[error("malformed '{type_name}' envelope: {reason}")]
    Malformed { type_name: String, reason: String },

    /// A payload arrived in the wrong regime.
    #[error("expected a {expected} payload")]
    RegimeMismatch { expected: &'static str },
}

/// Value encoding convention for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Values pass through untouched.
    Native,
    /// Values travel as JSON envelopes.
    Packed,
}

impl Regime {
    /// Select the regime for a context: native only for the designated runtime.
    pub fn for_context(context_name: &str, native_language: &str) -> Self {
        if context_name == native_language {
            Regime::Native
        } else {
            Regime::Packed
        }
    }

    pub fn is_packed(self) -> bool {
        self == Regime::Packed
    }

    pub fn encode(self, value: Value) -> Payload {
        match self {
            Regime::Native => Payload::Native(value),
            Regime::Packed => Payload::Packed(pack(&value)),
        }
    }

    pub fn decode(self, payload: Payload) -> Result<Value, CodecError> {
        match (self, payload) {
            (Regime::Native, Payload::Native(value)) => Ok(value),
            (Regime::Packed, Payload::Packed(envelope)) => unpack(&envelope),
            (Regime::Native, Payload::Packed(_)) => {
                Err(CodecError::RegimeMismatch { expected: "native" })
            }
            (Regime::Packed, Payload::Native(_)) => {
                Err(CodecError::RegimeMismatch { expected: "packed" })
            }
        }
    }
}

/// A value as it travels to or from a context.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Native(Value),
    Packed(Json),
}

impl Payload {
    /// Decode whichever regime the payload arrived in.
    pub fn into_value(self) -> Result<Value, CodecError> {
        match self {
            Payload::Native(value) => Ok(value),
            Payload::Packed(envelope) => unpack(&envelope),
        }
    }

    /// Encode a value in the regime implied by a call's `pack` option.
    pub fn for_options(value: Value, pack: bool) -> Self {
        if pack {
            Regime::Packed.encode(value)
        } else {
            Regime::Native.encode(value)
        }
    }
}

/// Wrap a value in its typed envelope.
pub fn pack(value: &Value) -> Json {
    match value {
        Value::Null => json!({"type": "null", "value": null}),
        Value::Boolean(b) => json!({"type": "boolean", "value": b}),
        Value::Integer(i) => json!({"type": "integer", "value": i}),
        Value::Number(n) => {
            let encoded = match serde_json::Number::from_f64(*n) {
                Some(number) => Json::Number(number),
                None => Json::String(non_finite_name(*n).to_string()),
            };
            json!({"type": "number", "value": encoded})
        }
        Value::String(s) => json!({"type": "string", "value": s}),
        Value::Array(items) => {
            json!({"type": "array", "value": items.iter().map(pack).collect::<Vec<_>>()})
        }
        Value::Object(map) => {
            let packed: Map<String, Json> =
                map.iter().map(|(key, value)| (key.clone(), pack(value))).collect();
            json!({"type": "object", "value": packed})
        }
        Value::Table(table) => {
            let columns: Map<String, Json> = table
                .columns()
                .map(|(name, column)| {
                    (
                        name.to_string(),
                        Json::Array(column.iter().map(pack).collect()),
                    )
                })
                .collect();
            json!({
                "type": "table",
                "rows": table.row_count(),
                "value": {"columns": columns},
            })
        }
        Value::Image(image) => json!({
            "type": "image",
            "mime": image.mime,
            "value": image.to_base64(),
        }),
    }
}

/// Unwrap a typed envelope back into a value.
pub fn unpack(envelope: &Json) -> Result<Value, CodecError> {
    let object = envelope
        .as_object()
        .ok_or_else(|| CodecError::NotAnEnvelope(truncate(envelope)))?;
    let type_name = object
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::NotAnEnvelope(truncate(envelope)))?;
    let payload = object.get("value").unwrap_or(&Json::Null);

    let malformed = |reason: &str| CodecError::Malformed {
        type_name: type_name.to_string(),
        reason: reason.to_string(),
    };

    match type_name {
        "null" => Ok(Value::Null),
        "boolean" => payload
            .as_bool()
            .map(Value::Boolean)
            .ok_or_else(|| malformed("expected a boolean")),
        "integer" => payload
            .as_i64()
            .map(Value::Integer)
            .ok_or_else(|| malformed("expected an integer")),
        "number" => match payload {
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| malformed("number out of range")),
            Json::String(s) => parse_non_finite(s)
                .map(Value::Number)
                .ok_or_else(|| malformed("expected a number")),
            _ => Err(malformed("expected a number")),
        },
        "string" => payload
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| malformed("expected a string")),
        "array" => payload
            .as_array()
            .ok_or_else(|| malformed("expected an array"))?
            .iter()
            .map(unpack)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        "object" => payload
            .as_object()
            .ok_or_else(|| malformed("expected an object"))?
            .iter()
            .map(|(key, value)| unpack(value).map(|value| (key.clone(), value)))
            .collect::<Result<IndexMap<_, _>, _>>()
            .map(Value::Object),
        "table" => {
            let columns = payload
                .get("columns")
                .and_then(Json::as_object)
                .ok_or_else(|| malformed("expected a 'columns' object"))?;
            let mut unpacked = IndexMap::with_capacity(columns.len());
            for (name, column) in columns {
                let cells = column
                    .as_array()
                    .ok_or_else(|| malformed("expected column arrays"))?
                    .iter()
                    .map(unpack)
                    .collect::<Result<Vec<_>, _>>()?;
                unpacked.insert(name.clone(), cells);
            }
            Table::new(unpacked)
                .map(Value::Table)
                .map_err(|e| malformed(&e.to_string()))
        }
        "image" => {
            let mime = object
                .get("mime")
                .and_then(Json::as_str)
                .ok_or_else(|| malformed("missing 'mime'"))?;
            let encoded = payload
                .as_str()
                .ok_or_else(|| malformed("expected base64 data"))?;
            Image::from_base64(mime, encoded)
                .map(Value::Image)
                .map_err(|e| malformed(&e.to_string()))
        }
        other => Err(CodecError::UnknownType(other.to_string())),
    }
}

fn non_finite_name(n: f64) -> &'static str {
    if n.is_nan() {
        "NaN"
    } else if n > 0.0 {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn parse_non_finite(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn truncate(json: &Json) -> String {
    let mut text = json.to_string();
    if text.len() > 64 {
        let mut end = 64;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        let mut columns = IndexMap::new();
        columns.insert(
            "name".to_string(),
            vec![Value::from("a"), Value::from("b")],
        );
        columns.insert(
            "height".to_string(),
            vec![Value::Integer(28), Value::Number(55.5)],
        );
        Table::new(columns).unwrap()
    }

    #[test]
    fn test_round_trip_supported_kinds() {
        let mut object = IndexMap::new();
        object.insert("k".to_string(), Value::Array(vec![Value::Null, Value::Boolean(true)]));

        let values = vec![
            Value::Integer(6),
            Value::Number(-2.25),
            Value::Number(f64::INFINITY),
            Value::from("x + 1"),
            Value::Object(object),
            Value::Table(sample_table()),
            Value::Image(Image::new("image/png", vec![0x89, b'P', b'N', b'G'])),
        ];

        for value in values {
            assert_eq!(unpack(&pack(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_round_trip_keeps_key_and_column_order() {
        let mut columns = IndexMap::new();
        columns.insert("z".to_string(), vec![Value::Integer(1)]);
        columns.insert("a".to_string(), vec![Value::Integer(2)]);
        let table = Value::Table(Table::new(columns).unwrap());

        let Value::Table(unpacked) = unpack(&pack(&table)).unwrap() else {
            panic!("expected a table");
        };
        let names: Vec<&str> = unpacked.columns().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["z", "a"]);

        let mut object = IndexMap::new();
        object.insert("zeta".to_string(), Value::Integer(1));
        object.insert("alpha".to_string(), Value::Integer(2));
        object.insert("mid".to_string(), Value::Integer(3));

        // Through wire text as well as in memory.
        let text = pack(&Value::Object(object)).to_string();
        let Value::Object(unpacked) = unpack(&serde_json::from_str(&text).unwrap()).unwrap() else {
            panic!("expected an object");
        };
        let keys: Vec<&str> = unpacked.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_nan_survives_packing() {
        let unpacked = unpack(&pack(&Value::Number(f64::NAN))).unwrap();
        assert!(unpacked.as_f64().unwrap().is_nan());
    }

    #[test]
    fn test_pack_integer_envelope_shape() {
        assert_eq!(
            pack(&Value::Integer(6)),
            json!({"type": "integer", "value": 6})
        );
    }

    #[test]
    fn test_table_envelope_carries_row_count() {
        let packed = pack(&Value::Table(sample_table()));
        assert_eq!(packed["type"], "table");
        assert_eq!(packed["rows"], 2);
        assert!(packed["value"]["columns"]["height"].is_array());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let err = unpack(&json!({"type": "matrix", "value": []})).unwrap_err();
        assert_eq!(err, CodecError::UnknownType("matrix".to_string()));
    }

    #[test]
    fn test_untagged_json_is_rejected() {
        assert!(matches!(
            unpack(&json!(6)),
            Err(CodecError::NotAnEnvelope(_))
        ));
        assert!(matches!(
            unpack(&json!({"value": 6})),
            Err(CodecError::NotAnEnvelope(_))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let err = unpack(&json!({"type": "integer", "value": "six"})).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_regime_selection() {
        assert_eq!(Regime::for_context("rust", "rust"), Regime::Native);
        assert_eq!(Regime::for_context("r", "rust"), Regime::Packed);
    }

    #[test]
    fn test_regime_decode_rejects_mismatch() {
        let payload = Regime::Native.encode(Value::Integer(1));
        assert_eq!(
            Regime::Packed.decode(payload),
            Err(CodecError::RegimeMismatch { expected: "packed" })
        );
    }

    #[test]
    fn test_native_regime_passes_through() {
        let value = Value::Table(sample_table());
        let payload = Regime::Native.encode(value.clone());
        assert_eq!(payload, Payload::Native(value.clone()));
        assert_eq!(Regime::Native.decode(payload).unwrap(), value);
    }
}
