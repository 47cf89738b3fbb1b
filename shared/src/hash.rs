//! Structural hash over JSON-shaped values.
//!
//! Both ends of the wire compute this over the past-horizon state to detect
//! divergence, so the recurrence is frozen: prefixes per shape, lexicographic
//! key order for objects, and
//! `combine(a, b) = (a * 65537 + b * 8191 + 127) mod 2147483647`.

use serde_json::{Number, Value};

const MODULUS: i64 = 2_147_483_647;

const NULL_HASH: i64 = 100;
const TRUE_HASH: i64 = 102;
const FALSE_HASH: i64 = 103;
const ARRAY_PREFIX: i64 = 105;
const NUMBER_PREFIX: i64 = 106;
const STRING_PREFIX: i64 = 107;
const OBJECT_PREFIX: i64 = 108;
const CONTAINER_SUFFIX: i64 = 200;
const STRING_SUFFIX: i64 = 300;

fn combine(a: i64, b: i64) -> i64 {
    // Operands stay below 2^31, so the products fit an i64 with room to spare.
    (a * 65_537 + b * 8_191 + 127) % MODULUS
}

fn hash_str(s: &str) -> i64 {
    let mut h = STRING_PREFIX;
    for c in s.chars() {
        h = combine(h, c as i64);
    }
    combine(h, STRING_SUFFIX)
}

// Negative zero must hash like zero; everything else hashes its shortest
// decimal text.
fn number_text(n: &Number) -> String {
    if n.as_f64() == Some(0.0) {
        return "0".to_string();
    }
    n.to_string()
}

/// Hashes a JSON value into the shared 31-bit space.
pub fn structural_hash(value: &Value) -> i64 {
    match value {
        Value::Null => NULL_HASH,
        Value::Bool(true) => TRUE_HASH,
        Value::Bool(false) => FALSE_HASH,
        Value::Number(n) => combine(NUMBER_PREFIX, hash_str(&number_text(n))),
        Value::String(s) => hash_str(s),
        Value::Array(items) => {
            let mut h = ARRAY_PREFIX;
            for item in items {
                h = combine(h, structural_hash(item));
            }
            combine(h, CONTAINER_SUFFIX)
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut h = OBJECT_PREFIX;
            for key in keys {
                h = combine(h, hash_str(key));
                h = combine(h, structural_hash(&map[key]));
            }
            combine(h, CONTAINER_SUFFIX)
        }
    }
}
