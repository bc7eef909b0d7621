//! Canonical JSON serialization and SHA-384 hashing.
//!
//! This module is the single hashing reference for the flora. State hashes,
//! adapter fingerprints and threshold fingerprints all go through
//! [`canonicalize`] + [`sha384_hex`]; every petal MUST produce identical
//! bytes for semantically equal values or quorum can never form.
//!
//! ## Rules
//!
//! | Input | Output |
//! |-------|--------|
//! | Object | keys sorted lexicographically, absent fields omitted |
//! | Array | element order preserved |
//! | String / bool / null | standard JSON scalar |
//! | Number | standard JSON scalar; non-finite values coerce to 0 |
//!
//! No whitespace is emitted. The functions here are pure: no I/O, no clock.

use serde_json::Value;
use sha2::{Digest, Sha384};

/// Serialize a JSON value into its unique canonical form.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalar Display goes through serde_json's serializer, which is
            // deterministic for finite numbers and escapes strings uniformly.
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                // Key came from the map, the lookup cannot miss.
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}

/// SHA-384 digest of arbitrary bytes, hex-lowercase.
pub fn sha384_hex(data: &[u8]) -> String {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonicalize then hash in one step.
pub fn hash_canonical(value: &Value) -> String {
    sha384_hex(canonicalize(value).as_bytes())
}

/// Map a price to a JSON number, coercing non-finite values to 0.
///
/// `serde_json` cannot represent NaN or infinities, so the coercion happens
/// here, before the value enters a payload.
pub fn number_value(f: f64) -> Value {
    let finite = if f.is_finite() { f } else { 0.0 };
    serde_json::Number::from_f64(finite)
        .map(Value::Number)
        .unwrap_or(Value::from(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_pass_through() {
        assert_eq!(canonicalize(&json!(null)), "null");
        assert_eq!(canonicalize(&json!(true)), "true");
        assert_eq!(canonicalize(&json!(false)), "false");
        assert_eq!(canonicalize(&json!("hbar")), "\"hbar\"");
        assert_eq!(canonicalize(&json!(0.07)), "0.07");
        assert_eq!(canonicalize(&json!(42)), "42");
    }

    #[test]
    fn object_keys_sorted_no_whitespace() {
        let v = json!({"zeta": 1, "alpha": {"c": 3, "b": [2, 1]}});
        assert_eq!(canonicalize(&v), r#"{"alpha":{"b":[2,1],"c":3},"zeta":1}"#);
    }

    #[test]
    fn equal_values_yield_identical_bytes() {
        // Build the same object with two different insertion orders.
        let mut a = serde_json::Map::new();
        a.insert("price".into(), json!(0.071));
        a.insert("source".into(), json!("binance"));
        let mut b = serde_json::Map::new();
        b.insert("source".into(), json!("binance"));
        b.insert("price".into(), json!(0.071));

        let ca = canonicalize(&Value::Object(a));
        let cb = canonicalize(&Value::Object(b));
        assert_eq!(ca, cb);
        assert_eq!(sha384_hex(ca.as_bytes()), sha384_hex(cb.as_bytes()));
    }

    #[test]
    fn null_values_are_kept() {
        let v = json!({"a": null, "b": 1});
        assert_eq!(canonicalize(&v), r#"{"a":null,"b":1}"#);
    }

    #[test]
    fn array_order_preserved() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonicalize(&v), "[3,1,2]");
    }

    #[test]
    fn non_finite_numbers_coerce_to_zero() {
        assert_eq!(number_value(f64::NAN), json!(0.0));
        assert_eq!(number_value(f64::INFINITY), json!(0.0));
        assert_eq!(number_value(f64::NEG_INFINITY), json!(0.0));
        assert_eq!(number_value(0.07), json!(0.07));
    }

    #[test]
    fn sha384_known_vectors() {
        assert_eq!(
            sha384_hex(b""),
            "38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da274edebfe76f65fbd51ad2f14898b95b"
        );
        assert_eq!(
            sha384_hex(b"abc"),
            "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed8086072ba1e7cc2358baeca134c825a7"
        );
    }

    #[test]
    fn hash_canonical_matches_manual_pipeline() {
        let v = json!({"b": 2, "a": 1});
        assert_eq!(hash_canonical(&v), sha384_hex(canonicalize(&v).as_bytes()));
    }
}
