//! Deterministic serialization for hashing (§9 "Deterministic serialization
//! for hashing").
//!
//! The stable serializer is the contract between producer and verifier: it
//! must be identical on both ends or hash chains and portable tokens silently
//! diverge. Rules: object keys are sorted lexicographically, arrays preserve
//! order, numbers are serialized without `-0` or `NaN`, and strings are
//! UTF-8. We implement this by re-serializing any `serde_json::Value` into a
//! canonical form before hashing, rather than hand-rolling a second
//! serializer — mirrors the teacher's `ImmutableLedger` hashing individual
//! fields directly, generalised here into a single reusable canonicalizer so
//! every hash-chain and token implementation in this crate shares one
//! definition of "stable".

use serde::Serialize;
use serde_json::Value;

/// Serialize `value` into the canonical stable form and return the UTF-8
/// bytes to be hashed.
pub fn stable_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let json = serde_json::to_value(value).expect("value must serialize to JSON");
    let canonical = canonicalize(&json);
    canonical.into_bytes()
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonicalize_number(n),
        Value::String(s) => serde_json::to_string(s).expect("string serializes"),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let key = serde_json::to_string(k).expect("key serializes");
                    let val = canonicalize(map.get(k).expect("key present"));
                    format!("{}:{}", key, val)
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn canonicalize_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    // Fall back to f64: normalize -0.0 to 0.0, NaN/Infinity are rejected by
    // serde_json at construction time so they cannot reach this branch.
    let f = n.as_f64().unwrap_or(0.0);
    let normalized = if f == 0.0 { 0.0 } else { f };
    format!("{}", normalized)
}
