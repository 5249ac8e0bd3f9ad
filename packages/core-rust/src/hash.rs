//! Structural fingerprints for staged payloads.
//!
//! Two payloads share a shape hash when they have the same set of leaf paths
//! with the same JSON types, regardless of key order or values. Type mappings
//! are keyed on this hash so that every record of one shape resolves to the
//! same metatype.

use std::collections::BTreeSet;

use serde_json::Value;

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes a 64-bit FNV-1a hash over the UTF-8 bytes of `s`.
///
/// # Examples
///
/// ```
/// use deep_lynx_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(""), 0xcbf2_9ce4_8422_2325); // offset basis
/// assert_eq!(fnv1a_hash("a"), 0xaf63_dc4c_8601_ec8c);
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Sorted `path:type` entries describing the structure of `value`.
///
/// Object members extend the path with `.key`, array elements with `[]`.
/// Arrays contribute the union of their elements' shapes. Empty containers
/// appear as leaves typed `object` or `array`.
#[must_use]
pub fn shape_entries(value: &Value) -> BTreeSet<String> {
    let mut entries = BTreeSet::new();
    collect(value, "", &mut entries);
    entries
}

/// Lowercase hex fingerprint of the structure of `value`.
#[must_use]
pub fn shape_hash(value: &Value) -> String {
    let entries = shape_entries(value);
    let joined = entries.into_iter().collect::<Vec<_>>().join("\n");
    format!("{:016x}", fnv1a_hash(&joined))
}

fn collect(value: &Value, path: &str, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                collect(child, &child_path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            let child_path = format!("{path}[]");
            for item in items {
                collect(item, &child_path, out);
            }
        }
        leaf => {
            out.insert(format!("{path}:{}", type_name(leaf)));
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn fnv1a_hash_empty_is_offset_basis() {
        assert_eq!(fnv1a_hash(""), FNV_OFFSET_BASIS);
    }

    #[test]
    fn fnv1a_hash_known_vectors() {
        assert_eq!(fnv1a_hash("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_hash("foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn fnv1a_hash_case_sensitive() {
        assert_ne!(fnv1a_hash("Hello"), fnv1a_hash("hello"));
    }

    #[test]
    fn entries_describe_nested_paths() {
        let entries = shape_entries(&json!({
            "name": "pump",
            "specs": {"rpm": 1200, "sealed": true},
            "tags": ["a", "b"],
            "notes": null,
        }));
        let expected: BTreeSet<String> = [
            "name:string",
            "notes:null",
            "specs.rpm:number",
            "specs.sealed:boolean",
            "tags[]:string",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn empty_containers_are_leaves() {
        let entries = shape_entries(&json!({"a": {}, "b": []}));
        assert!(entries.contains("a:object"));
        assert!(entries.contains("b:array"));
    }

    #[test]
    fn values_do_not_affect_shape() {
        assert_eq!(
            shape_hash(&json!({"id": "1", "count": 3})),
            shape_hash(&json!({"id": "two", "count": 99.5}))
        );
    }

    #[test]
    fn key_order_does_not_affect_shape() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": "a"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": "b", "x": 2}"#).unwrap();
        assert_eq!(shape_hash(&a), shape_hash(&b));
    }

    #[test]
    fn types_and_keys_affect_shape() {
        let base = shape_hash(&json!({"id": "1"}));
        assert_ne!(base, shape_hash(&json!({"id": 1})));
        assert_ne!(base, shape_hash(&json!({"ident": "1"})));
        assert_ne!(base, shape_hash(&json!({"id": "1", "extra": true})));
    }

    #[test]
    fn hash_is_sixteen_hex_digits() {
        let hash = shape_hash(&json!({"a": 1}));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    proptest! {
        #[test]
        fn shape_ignores_scalar_values(a in any::<i64>(), b in any::<i64>(), s in ".*", t in ".*") {
            prop_assert_eq!(
                shape_hash(&json!({"n": a, "s": s})),
                shape_hash(&json!({"n": b, "s": t}))
            );
        }
    }
}
