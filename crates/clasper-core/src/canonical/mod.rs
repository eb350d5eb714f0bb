//! Canonical JSON and stable hash primitives.
//!
//! Every integrity chain and signature in Clasper hashes the same bytes on
//! both sides of a trust boundary: the audit chain, trace step chains, tool
//! token scope hashes, and telemetry envelope signing inputs all agree on a
//! single canonical serialization.
//!
//! # Canonical profile
//!
//! The profile is RFC 8785 (JCS) restricted for cross-party determinism:
//!
//! - **Integer-only numbers**: floats are rejected; integers must fit in the
//!   signed 64-bit range.
//! - **No duplicate keys**: objects parsed from the wire must not contain
//!   duplicate keys after escape decoding.
//! - **Deterministic key ordering**: object keys sort lexicographically by
//!   byte order at every depth; arrays preserve order.
//! - **Minimal escaping**: only `"`, `\`, and U+0000..U+001F are escaped.
//! - **Maximum depth**: structures nested deeper than 128 levels are
//!   rejected.
//!
//! # Example
//!
//! ```
//! use clasper_core::canonical::{canonical_json, sha256_json, format_hash};
//! use serde_json::json;
//!
//! let bytes = canonical_json(&json!({"z": 1, "a": 2})).unwrap();
//! assert_eq!(bytes, br#"{"a":2,"z":1}"#);
//!
//! let digest = sha256_json(&json!({"hello": "world"})).unwrap();
//! assert_eq!(format_hash(&digest).len(), "sha256:".len() + 64);
//! ```

mod hash;

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use thiserror::Error;

pub use hash::{format_hash, sha256_hex, sha256_json};

/// Maximum nesting depth accepted by the canonicalizer.
pub const MAX_DEPTH: usize = 128;

/// Errors produced while canonicalizing a JSON value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A floating-point number was encountered.
    ///
    /// Hashable payloads are restricted to integers so that two
    /// independently written serializers cannot disagree on formatting.
    #[error("float not allowed in hashable payload")]
    FloatNotAllowed,

    /// A number is outside the signed 64-bit integer range.
    #[error("number out of range: {value} does not fit in i64")]
    NumberOutOfRange {
        /// String form of the offending number.
        value: String,
    },

    /// An object contained the same key twice after escape decoding.
    #[error("duplicate key: '{key}' appears multiple times in object")]
    DuplicateKey {
        /// The duplicated key.
        key: String,
    },

    /// The value nests deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The depth limit that was exceeded.
        max_depth: usize,
    },

    /// The input was not valid JSON.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

/// Serializes a JSON value to canonical bytes.
///
/// Object keys are sorted lexicographically at every depth, arrays preserve
/// order, and no insignificant whitespace is emitted. The function is total
/// over finite JSON values within the canonical profile.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value contains a float, an integer
/// outside i64 range, or nests deeper than [`MAX_DEPTH`] levels.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    Ok(canonical_json_string(value)?.into_bytes())
}

/// [`canonical_json`] returning the canonical form as a `String`.
///
/// # Errors
///
/// Same as [`canonical_json`].
pub fn canonical_json_string(value: &Value) -> Result<String, CanonicalError> {
    validate_value(value, 0)?;
    let mut out = String::new();
    emit_value(value, &mut out);
    Ok(out)
}

/// Canonical form of any `Serialize` type as a `String`, for JSON columns.
///
/// # Errors
///
/// Same as [`canonical_bytes`].
pub fn canonical_string<T: serde::Serialize>(value: &T) -> Result<String, CanonicalError> {
    let json = serde_json::to_value(value).map_err(|e| CanonicalError::Parse {
        message: e.to_string(),
    })?;
    canonical_json_string(&json)
}

/// Serializes any `Serialize` type to canonical bytes.
///
/// Convenience wrapper over [`canonical_json`] for structs that already
/// model their wire form.
///
/// # Errors
///
/// Returns [`CanonicalError::Parse`] if the value does not serialize to
/// JSON, or any validation error from [`canonical_json`].
pub fn canonical_bytes<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let json = serde_json::to_value(value).map_err(|e| CanonicalError::Parse {
        message: e.to_string(),
    })?;
    canonical_json(&json)
}

/// Parses untrusted wire JSON, rejecting duplicate object keys.
///
/// Standard parsers silently let the last duplicate win; anything feeding an
/// integrity check must reject instead, because two verifiers could
/// otherwise observe different values for the same bytes.
///
/// # Errors
///
/// Returns [`CanonicalError::DuplicateKey`] on duplicates (compared after
/// escape decoding) and [`CanonicalError::Parse`] on malformed input.
pub fn parse_strict(input: &str) -> Result<Value, CanonicalError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let value = CheckedValue::deserialize(&mut deserializer).map_err(|e| {
        let msg = e.to_string();
        msg.strip_prefix("duplicate key: ").map_or_else(
            || CanonicalError::Parse { message: msg.clone() },
            |rest| CanonicalError::DuplicateKey {
                key: rest.split(" at line ").next().unwrap_or(rest).to_string(),
            },
        )
    })?;
    Ok(value.0)
}

/// Wrapper that detects duplicate keys during deserialization.
struct CheckedValue(Value);

impl<'de> Deserialize<'de> for CheckedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("any valid JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| de::Error::custom("invalid float value"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(Value::String(v))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element::<CheckedValue>()? {
                    vec.push(elem.0);
                }
                Ok(Value::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = BTreeSet::new();
                let mut obj = Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate key: {key}")));
                    }
                    let value = map.next_value::<CheckedValue>()?;
                    obj.insert(key, value.0);
                }
                Ok(Value::Object(obj))
            }
        }

        deserializer.deserialize_any(ValueVisitor).map(CheckedValue)
    }
}

/// Recursively validates a value against the canonical profile.
fn validate_value(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => validate_number(n),
        Value::Array(arr) => {
            for item in arr {
                validate_value(item, depth + 1)?;
            }
            Ok(())
        },
        Value::Object(obj) => {
            for val in obj.values() {
                validate_value(val, depth + 1)?;
            }
            Ok(())
        },
    }
}

/// Numbers must be integers within i64 range.
fn validate_number(n: &Number) -> Result<(), CanonicalError> {
    if n.is_i64() {
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        if u > i64::MAX as u64 {
            return Err(CanonicalError::NumberOutOfRange {
                value: u.to_string(),
            });
        }
        return Ok(());
    }
    Err(CanonicalError::FloatNotAllowed)
}

fn emit_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, out),
        Value::String(s) => emit_string(s, out),
        Value::Array(arr) => emit_array(arr, out),
        Value::Object(obj) => emit_object(obj, out),
    }
}

fn emit_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else {
        // Unreachable after validation; emit the serde form rather than panic.
        out.push_str(&n.to_string());
    }
}

/// Minimal escaping per RFC 8785 §3.2.2.2.
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            },
            c => out.push(c),
        }
    }
    out.push('"');
}

fn emit_array(arr: &[Value], out: &mut String) {
    out.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_value(item, out);
    }
    out.push(']');
}

fn emit_object(obj: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit_value(&obj[*key], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // =========================================================================
    // Canonical form
    // =========================================================================

    #[test]
    fn sorts_keys_at_every_depth() {
        let bytes = canonical_json(&json!({"z": {"b": 1, "a": 2}, "a": 3})).unwrap();
        assert_eq!(bytes, br#"{"a":3,"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn arrays_preserve_order() {
        let bytes = canonical_json(&json!([3, 1, 2])).unwrap();
        assert_eq!(bytes, b"[3,1,2]");
    }

    #[test]
    fn primitives_roundtrip() {
        assert_eq!(canonical_json(&json!(null)).unwrap(), b"null");
        assert_eq!(canonical_json(&json!(true)).unwrap(), b"true");
        assert_eq!(canonical_json(&json!(-42)).unwrap(), b"-42");
        assert_eq!(canonical_json(&json!("hi")).unwrap(), br#""hi""#);
    }

    #[test]
    fn determinism_across_key_orders() {
        let a = canonical_json(&json!({"c": 3, "a": 1, "b": 2})).unwrap();
        let b = canonical_json(&json!({"b": 2, "c": 3, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn determinism_survives_reparse() {
        let v = json!({"nested": {"y": [1, 2], "x": "s"}, "top": 9});
        let first = canonical_json(&v).unwrap();
        let reparsed: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(first, canonical_json(&reparsed).unwrap());
    }

    // =========================================================================
    // Profile rejections
    // =========================================================================

    #[test]
    fn rejects_float() {
        let err = canonical_json(&json!({"x": 1.5})).unwrap_err();
        assert_eq!(err, CanonicalError::FloatNotAllowed);
    }

    #[test]
    fn rejects_u64_above_i64_max() {
        let err = canonical_json(&json!({"x": u64::MAX})).unwrap_err();
        assert!(matches!(err, CanonicalError::NumberOutOfRange { .. }));
    }

    #[test]
    fn accepts_i64_bounds() {
        assert!(canonical_json(&json!({"lo": i64::MIN, "hi": i64::MAX})).is_ok());
    }

    #[test]
    fn rejects_excessive_depth() {
        let mut v = json!(0);
        for _ in 0..(MAX_DEPTH + 2) {
            v = json!([v]);
        }
        let err = canonical_json(&v).unwrap_err();
        assert!(matches!(err, CanonicalError::MaxDepthExceeded { .. }));
    }

    // =========================================================================
    // Strict parsing
    // =========================================================================

    #[test]
    fn parse_strict_rejects_duplicate_key() {
        let err = parse_strict(r#"{"a": 1, "a": 2}"#).unwrap_err();
        assert!(matches!(err, CanonicalError::DuplicateKey { key } if key == "a"));
    }

    #[test]
    fn parse_strict_rejects_escaped_duplicate() {
        // "a" decodes to "a", so the keys collide after decoding.
        let err = parse_strict(r#"{"a": 1, "a": 2}"#).unwrap_err();
        assert!(matches!(err, CanonicalError::DuplicateKey { key } if key == "a"));
    }

    #[test]
    fn parse_strict_accepts_same_key_in_sibling_objects() {
        assert!(parse_strict(r#"{"a": {"x": 1}, "b": {"x": 2}}"#).is_ok());
    }

    #[test]
    fn parse_strict_rejects_malformed_input() {
        assert!(matches!(
            parse_strict(r#"{"k":"#),
            Err(CanonicalError::Parse { .. })
        ));
    }

    // =========================================================================
    // Escaping
    // =========================================================================

    #[test]
    fn escapes_control_chars_minimally() {
        let bytes = canonical_json(&json!({"t": "a\nb\tc\u{0001}"})).unwrap();
        assert_eq!(bytes, br#"{"t":"a\nb\tc\u0001"}"#);
    }

    #[test]
    fn does_not_escape_del_or_unicode() {
        let bytes = canonical_json(&json!("\u{007F}\u{2764}")).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert!(!s.contains("\\u"));
    }
}
