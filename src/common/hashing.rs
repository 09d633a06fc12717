//! Stable digests of specs and config data.

use std::collections::BTreeMap;
use std::hash::Hasher;

use serde::Serialize;
use serde_json::Value;
use twox_hash::XxHash64;

use super::identity::safe_encode;
use crate::errors::*;

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv32a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |h, b| {
        (h ^ u32::from(*b)).wrapping_mul(FNV32_PRIME)
    })
}

/// Drops absent fields: nulls, empty objects and empty arrays.
///
/// Explicit scalars such as `0`, `false` or `""` are kept, and array
/// elements are never removed, so a spec that sets them hashes apart from
/// one that leaves them out.
pub fn strip_empty(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(Value::Array(
            items
                .into_iter()
                .map(|v| strip_empty(v).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Object(map) => {
            let map: serde_json::Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| strip_empty(v).map(|v| (k, v)))
                .collect();
            (!map.is_empty()).then_some(Value::Object(map))
        }
        v => Some(v),
    }
}

/// Canonical JSON encoding: keys sorted, absent fields omitted.
pub fn canonical_json<T: Serialize>(obj: &T) -> Result<String> {
    let value = strip_empty(serde_json::to_value(obj)?).unwrap_or(Value::Null);
    // serde_json::Map is ordered by key unless preserve_order is enabled
    Ok(serde_json::to_string(&value)?)
}

/// Name-safe hash of a serializable object.
pub fn compute_hash<T: Serialize>(obj: &T) -> Result<String> {
    let h = fnv32a(canonical_json(obj)?.as_bytes());
    Ok(safe_encode(&h.to_string()))
}

/// Hex xxhash64 of config-map data, keys visited in order.
///
/// Every key and value is length-prefixed so field boundaries are part of
/// the digest.
pub fn data_digest(data: &BTreeMap<String, String>) -> String {
    let mut h = XxHash64::with_seed(0);
    for (k, v) in data {
        for field in [k, v] {
            h.write_u64(field.len() as u64);
            h.write(field.as_bytes());
        }
    }
    format!("{:016x}", h.finish())
}

/// The seven-character prefix used in object and key names.
pub fn short_digest(data: &BTreeMap<String, String>) -> String {
    data_digest(data)[..7].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fnv32a_known_vectors() {
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_strip_empty_keeps_explicit_values() {
        let v = json!({"a": 0, "b": "", "c": [], "d": {"e": null}, "f": false, "g": [0, "", {}]});
        assert_eq!(strip_empty(v), Some(json!({"a": 0, "b": "", "f": false, "g": [0, "", null]})));
        assert_eq!(strip_empty(json!({"d": {}})), None);
    }

    #[test]
    fn test_hash_ignores_empty_fields() {
        let a = json!({"image": "mo:1.2.0", "replicas": 3});
        let b = json!({"image": "mo:1.2.0", "replicas": 3, "labels": {}, "args": []});
        let c = json!({"image": "mo:1.2.1", "replicas": 3});
        assert_eq!(compute_hash(&a).unwrap(), compute_hash(&b).unwrap());
        assert_ne!(compute_hash(&a).unwrap(), compute_hash(&c).unwrap());

        let zero = json!({"image": "mo:1.2.0", "replicas": 3, "grace": 0});
        assert_ne!(compute_hash(&a).unwrap(), compute_hash(&zero).unwrap());
        let args = json!({"args": ["--x", ""]});
        assert_ne!(compute_hash(&args).unwrap(), compute_hash(&json!({"args": ["--x"]})).unwrap());
    }

    #[test]
    fn test_short_digest_changes_with_data() {
        let mut data = BTreeMap::from([("config.toml".to_string(), "a = 1".to_string())]);
        let d1 = short_digest(&data);
        assert_eq!(d1.len(), 7);
        assert_eq!(d1, short_digest(&data));
        data.insert("config.toml".to_string(), "a = 2".to_string());
        assert_ne!(d1, short_digest(&data));
    }

    #[test]
    fn test_digest_separates_key_and_value() {
        let a = BTreeMap::from([("ab".to_string(), "c".to_string())]);
        let b = BTreeMap::from([("a".to_string(), "bc".to_string())]);
        assert_ne!(data_digest(&a), data_digest(&b));
    }
}
