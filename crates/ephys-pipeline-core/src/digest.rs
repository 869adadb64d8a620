use serde_json::{Map, Value};

/// 128-bit xxh3 of `data`, as 32 lowercase hex digits.
pub fn xxh3_hex(data: &[u8]) -> String {
    format!("{:032x}", twox_hash::xxh3::hash128(data))
}

/// Rebuild `value` with every object's keys in ascending order, so the serialized form
/// does not depend on insertion order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Digest of the canonical JSON form of `value`.
pub fn json_digest(value: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&canonicalize(value))?;
    Ok(xxh3_hex(&bytes))
}
