// src/document.rs
// Document helpers: dotted-path access, _id handling, value ordering.
//
// Documents are plain `serde_json::Value` objects throughout the execution
// core; this module holds the shared helpers the write path, the index key
// generator and the query matcher all rely on.

use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

/// Look up a (possibly dotted) path in a document.
///
/// `"address.city"` descends into nested objects; numeric path components
/// index into arrays (`"tags.0"`).
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = doc;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Extract the `_id` value of a document, if present.
pub fn extract_id(doc: &Value) -> Option<&Value> {
    doc.get("_id")
}

/// Generate a fresh ObjectId-style `_id` value.
pub fn generate_object_id() -> Value {
    Value::String(Uuid::new_v4().simple().to_string())
}

/// Total order over JSON values, by canonical type bracket first
/// (null < bool < number < string < array < object), then by value.
///
/// Numbers compare numerically across the int/float boundary so that
/// `5` and `5.0` are equal for matching and sorting purposes.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn type_bracket(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    let (ta, tb) = (type_bracket(a), type_bracket(b));
    if ta != tb {
        return ta.cmp(&tb);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // Field-by-field in key order; shorter object sorts first on a tie.
            let mut ka: Vec<&String> = x.keys().collect();
            let mut kb: Vec<&String> = y.keys().collect();
            ka.sort();
            kb.sort();
            for (fa, fb) in ka.iter().zip(kb.iter()) {
                let ord = fa.cmp(fb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(&x[*fa], &y[*fb]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            ka.len().cmp(&kb.len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Structural equality with numeric cross-type comparison.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Serialized byte length of a document, used by the record store to decide
/// whether an update fits in the existing slot.
pub fn serialized_len(doc: &Value) -> usize {
    serde_json::to_vec(doc).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_top_level() {
        let doc = json!({"name": "Alice", "age": 30});
        assert_eq!(get_path(&doc, "name"), Some(&json!("Alice")));
        assert_eq!(get_path(&doc, "missing"), None);
        assert_eq!(get_path(&doc, ""), None);
    }

    #[test]
    fn test_get_path_nested() {
        let doc = json!({"address": {"city": "NYC", "geo": [1.0, 2.0]}});
        assert_eq!(get_path(&doc, "address.city"), Some(&json!("NYC")));
        assert_eq!(get_path(&doc, "address.geo.1"), Some(&json!(2.0)));
        assert_eq!(get_path(&doc, "address.zip"), None);
    }

    #[test]
    fn test_compare_values_cross_numeric() {
        assert_eq!(compare_values(&json!(5), &json!(5.0)), Ordering::Equal);
        assert_eq!(compare_values(&json!(5), &json!(5.5)), Ordering::Less);
        assert_eq!(compare_values(&json!(10), &json!(2)), Ordering::Greater);
    }

    #[test]
    fn test_compare_values_type_brackets() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(true), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(99), &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!("z"), &json!([1])), Ordering::Less);
    }

    #[test]
    fn test_generate_object_id_unique() {
        let a = generate_object_id();
        let b = generate_object_id();
        assert_ne!(a, b);
    }
}
