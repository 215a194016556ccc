//! Canonical JSON serialization for deterministic hashing.
//!
//! Canonical JSON has:
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - UTF-8 output
//! - Integers only (floats rejected)
//!
//! Request fingerprints are digests of canonical bytes, so any two
//! structurally equal values hash identically regardless of field order.
//! Callers encode fractional values as scaled integers (milli-units).

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Float values are not allowed in canonical JSON.
    #[error("float values are not allowed in canonical JSON (use integers)")]
    FloatNotAllowed,
}

/// Serialize `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails, or
/// `CanonicalJsonError::FloatNotAllowed` if the value contains floats.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::<u8>::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Same as [`to_canonical_bytes`], but returns a `String`.
///
/// # Errors
///
/// See [`to_canonical_bytes`].
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    // write_value only emits serde_json-escaped strings and ASCII punctuation.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => {
            if n.is_f64() {
                return Err(CanonicalJsonError::FloatNotAllowed);
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => {
            out.extend_from_slice(serde_json::to_string(s)?.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(serde_json::to_string(key)?.as_bytes());
                out.push(b':');
                write_value(item, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let v = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let s = to_canonical_string(&v).expect("canonical");
        assert_eq!(s, r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn floats_are_rejected() {
        let err = to_canonical_bytes(&json!({"t": 0.7})).expect_err("float");
        assert!(matches!(err, CanonicalJsonError::FloatNotAllowed));
    }

    #[test]
    fn strings_are_escaped() {
        let s = to_canonical_string(&json!({"p": "say \"hi\"\n"})).expect("canonical");
        assert_eq!(s, r#"{"p":"say \"hi\"\n"}"#);
    }

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(keys in proptest::collection::btree_set("[a-z]{1,6}", 1..8)) {
            let forward: serde_json::Map<String, Value> =
                keys.iter().enumerate().map(|(i, k)| (k.clone(), json!(i))).collect();
            let backward: serde_json::Map<String, Value> =
                keys.iter().enumerate().rev().map(|(i, k)| (k.clone(), json!(i))).collect();
            prop_assert_eq!(
                to_canonical_bytes(&Value::Object(forward)).expect("canonical"),
                to_canonical_bytes(&Value::Object(backward)).expect("canonical")
            );
        }
    }
}
