//! Canonical byte encoding for metadata that feeds a digest.
//!
//! Output rules:
//!
//! - object keys sorted by their UTF-8 bytes
//! - no insignificant whitespace
//! - integers only; any non-integral number is rejected
//! - strings escaped minimally (`"`, `\`, and control characters)
//!
//! The encoder walks a `serde_json::Value` itself instead of relying on map
//! ordering, so the result does not depend on whether `serde_json` was built
//! with `preserve_order` somewhere else in the dependency graph.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

/// Errors raised while producing canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    /// Non-integral numbers have no single canonical spelling.
    #[error("floating point value not allowed: {value}")]
    FloatRejected { value: String },

    /// The value could not be converted into JSON.
    #[error("serialization failed: {message}")]
    Serialize { message: String },
}

/// Bytes produced by the canonical encoder.
///
/// The inner buffer is private; the only constructor is [`CanonicalBytes::new`],
/// so anything holding a `CanonicalBytes` went through the canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Canonicalize any serializable value.
    pub fn new(value: &impl Serialize) -> Result<Self, CanonicalError> {
        let value = serde_json::to_value(value).map_err(|e| CanonicalError::Serialize {
            message: e.to_string(),
        })?;
        Self::from_value(&value)
    }

    /// Canonicalize an already-built JSON value.
    pub fn from_value(value: &Value) -> Result<Self, CanonicalError> {
        let mut out = String::new();
        emit(value, &mut out)?;
        Ok(Self(out.into_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn emit(value: &Value, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{}", i);
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{}", u);
            } else {
                return Err(CanonicalError::FloatRejected {
                    value: n.to_string(),
                });
            }
        }
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(v: Value) -> String {
        String::from_utf8(CanonicalBytes::from_value(&v).unwrap().into_vec()).unwrap()
    }

    #[test]
    fn test_keys_sorted_and_compact() {
        let out = canon(json!({"b": 1, "a": [true, null], "c": {"z": "x", "y": -2}}));
        assert_eq!(out, r#"{"a":[true,null],"b":1,"c":{"y":-2,"z":"x"}}"#);
    }

    #[test]
    fn test_keys_sorted_by_utf8_bytes_not_utf16() {
        // U+1F600 sorts before U+FF61 in UTF-16 code units but after it in UTF-8 bytes.
        let out = canon(json!({"\u{1F600}": 1, "\u{FF61}": 2}));
        assert_eq!(out, "{\"\u{FF61}\":2,\"\u{1F600}\":1}");
    }

    #[test]
    fn test_rejects_floats() {
        let err = CanonicalBytes::from_value(&json!({"size": 1.5})).unwrap_err();
        assert!(matches!(err, CanonicalError::FloatRejected { .. }));
    }

    #[test]
    fn test_large_unsigned_integers() {
        assert_eq!(canon(json!(u64::MAX)), "18446744073709551615");
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(
            canon(json!("a\"b\\c\n\u{01}é")),
            "\"a\\\"b\\\\c\\n\\u0001é\""
        );
    }

    #[test]
    fn test_struct_field_order_irrelevant() {
        #[derive(Serialize)]
        struct A {
            zeta: u32,
            alpha: u32,
        }
        #[derive(Serialize)]
        struct B {
            alpha: u32,
            zeta: u32,
        }
        let a = CanonicalBytes::new(&A { zeta: 1, alpha: 2 }).unwrap();
        let b = CanonicalBytes::new(&B { alpha: 2, zeta: 1 }).unwrap();
        assert_eq!(a, b);
    }
}
