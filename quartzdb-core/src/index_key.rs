// src/index_key.rs
// Index key model: totally ordered keys plus key generation from documents.

use crate::document::get_path;
use crate::error::{QuartzError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Index key - the sorted domain every access method iterates over.
///
/// `MinKey`/`MaxKey` exist only as scan bounds; key generation never
/// produces them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKey {
    MinKey,
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    /// Compound key for multi-field indexes, one element per pattern field.
    Compound(Vec<IndexKey>),
    MaxKey,
}

/// OrderedFloat wrapper for f64 to enable Ord (NaN sorts last among floats).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        use IndexKey::*;

        fn rank(k: &IndexKey) -> u8 {
            match k {
                MinKey => 0,
                Null => 1,
                Bool(_) => 2,
                Int(_) | Float(_) => 3, // numbers share one bracket
                String(_) => 4,
                Compound(_) => 5,
                MaxKey => 6,
            }
        }

        let (ra, rb) = (rank(self), rank(other));
        if ra != rb {
            return ra.cmp(&rb);
        }

        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            // Cross-numeric: 5 and 5.0 are the same key.
            (Int(a), Float(b)) => OrderedFloat(*a as f64).cmp(b),
            (Float(a), Int(b)) => a.cmp(&OrderedFloat(*b as f64)),
            (Float(a), Float(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Compound(a), Compound(b)) => a.cmp(b),
            _ => Equal,
        }
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else if let Some(f) = n.as_f64() {
                    IndexKey::Float(OrderedFloat(f))
                } else {
                    IndexKey::Null
                }
            }
            Value::String(s) => IndexKey::String(s.clone()),
            // Objects (and arrays reaching this point) key as Null; arrays
            // are normally unrolled by the multikey generator first.
            _ => IndexKey::Null,
        }
    }
}

impl IndexKey {
    /// Render the key back to a JSON value (bounds variants map to null).
    pub fn to_value(&self) -> Value {
        match self {
            IndexKey::MinKey | IndexKey::MaxKey | IndexKey::Null => Value::Null,
            IndexKey::Bool(b) => Value::Bool(*b),
            IndexKey::Int(i) => Value::from(*i),
            IndexKey::Float(f) => {
                serde_json::Number::from_f64(f.0).map(Value::Number).unwrap_or(Value::Null)
            }
            IndexKey::String(s) => Value::String(s.clone()),
            IndexKey::Compound(parts) => {
                Value::Array(parts.iter().map(|p| p.to_value()).collect())
            }
        }
    }
}

/// Immutable key pattern of an index: ordered `(path, direction)` pairs,
/// direction 1 or -1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    pub fields: Vec<(String, i32)>,
}

impl KeyPattern {
    pub fn new(fields: Vec<(String, i32)>) -> Self {
        KeyPattern { fields }
    }

    pub fn single(path: &str) -> Self {
        KeyPattern {
            fields: vec![(path.to_string(), 1)],
        }
    }

    pub fn id() -> Self {
        Self::single("_id")
    }

    pub fn is_id(&self) -> bool {
        self.fields.len() == 1 && self.fields[0] == ("_id".to_string(), 1)
    }

    pub fn first_field(&self) -> &str {
        &self.fields[0].0
    }

    /// Canonical text form, used for conflict detection and the plan cache.
    pub fn canonical(&self) -> String {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(f, d)| format!("{}:{}", f, d))
            .collect();
        parts.join(",")
    }
}

/// Generate the key set of one document under a key pattern.
///
/// Array values fan out to one key per element (multikey). Compound patterns
/// allow at most one array-valued field per document; two or more is the
/// classic parallel-array error. Sparse indexes yield no keys for documents
/// missing every pattern field.
pub fn generate_keys(doc: &Value, pattern: &KeyPattern, sparse: bool) -> Result<BTreeSet<IndexKey>> {
    // Per-field key alternatives. Missing fields key as Null (unless sparse).
    let mut per_field: Vec<Vec<IndexKey>> = Vec::with_capacity(pattern.fields.len());
    let mut array_field: Option<&str> = None;
    let mut all_missing = true;

    for (path, _dir) in &pattern.fields {
        match get_path(doc, path) {
            Some(Value::Array(elems)) => {
                if let Some(prev) = array_field {
                    return Err(QuartzError::CannotIndexParallelArrays(format!(
                        "{} and {}",
                        prev, path
                    )));
                }
                array_field = Some(path);
                all_missing = false;
                if elems.is_empty() {
                    per_field.push(vec![IndexKey::Null]);
                } else {
                    per_field.push(elems.iter().map(IndexKey::from).collect());
                }
            }
            Some(v) => {
                all_missing = false;
                per_field.push(vec![IndexKey::from(v)]);
            }
            None => {
                per_field.push(vec![IndexKey::Null]);
            }
        }
    }

    if sparse && all_missing {
        return Ok(BTreeSet::new());
    }

    let mut keys = BTreeSet::new();
    if pattern.fields.len() == 1 {
        for k in per_field.remove(0) {
            keys.insert(k);
        }
        return Ok(keys);
    }

    // Compound: expand along the single array dimension (if any).
    let fan_out = per_field.iter().map(|ks| ks.len()).max().unwrap_or(1);
    for i in 0..fan_out {
        let parts: Vec<IndexKey> = per_field
            .iter()
            .map(|ks| {
                if ks.len() == 1 {
                    ks[0].clone()
                } else {
                    ks[i].clone()
                }
            })
            .collect();
        keys.insert(IndexKey::Compound(parts));
    }
    Ok(keys)
}

/// Generate text-index keys for one document: `(term, score)` compound keys
/// from whitespace tokenization of the indexed string field. The score is the
/// term frequency within the field.
pub fn generate_text_keys(doc: &Value, path: &str) -> BTreeSet<IndexKey> {
    let mut frequencies: std::collections::BTreeMap<String, i64> = std::collections::BTreeMap::new();

    let mut tally = |s: &str| {
        for raw in s.split_whitespace() {
            let term: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if !term.is_empty() {
                *frequencies.entry(term).or_insert(0) += 1;
            }
        }
    };

    match get_path(doc, path) {
        Some(Value::String(s)) => tally(s),
        Some(Value::Array(elems)) => {
            for e in elems {
                if let Value::String(s) = e {
                    tally(s);
                }
            }
        }
        _ => {}
    }

    frequencies
        .into_iter()
        .map(|(term, freq)| {
            IndexKey::Compound(vec![
                IndexKey::String(term),
                IndexKey::Float(OrderedFloat(freq as f64)),
            ])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering_brackets() {
        assert!(IndexKey::MinKey < IndexKey::Null);
        assert!(IndexKey::Null < IndexKey::Bool(false));
        assert!(IndexKey::Bool(true) < IndexKey::Int(0));
        assert!(IndexKey::Int(5) < IndexKey::String("a".into()));
        assert!(IndexKey::String("z".into()) < IndexKey::Compound(vec![]));
        assert!(IndexKey::Compound(vec![IndexKey::Int(1)]) < IndexKey::MaxKey);
    }

    #[test]
    fn test_cross_numeric_keys_equal() {
        assert_eq!(
            IndexKey::Int(5).cmp(&IndexKey::Float(OrderedFloat(5.0))),
            std::cmp::Ordering::Equal
        );
        assert!(IndexKey::Int(5) < IndexKey::Float(OrderedFloat(5.5)));
        assert!(IndexKey::Float(OrderedFloat(4.5)) < IndexKey::Int(5));
    }

    #[test]
    fn test_generate_keys_single_field() {
        let doc = json!({"a": 7, "b": "x"});
        let keys = generate_keys(&doc, &KeyPattern::single("a"), false).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&IndexKey::Int(7)));
    }

    #[test]
    fn test_generate_keys_missing_field_keys_null() {
        let doc = json!({"b": 1});
        let keys = generate_keys(&doc, &KeyPattern::single("a"), false).unwrap();
        assert!(keys.contains(&IndexKey::Null));

        // Sparse: document missing the field yields no keys at all.
        let keys = generate_keys(&doc, &KeyPattern::single("a"), true).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_generate_keys_multikey() {
        let doc = json!({"tags": ["x", "y", "x"]});
        let keys = generate_keys(&doc, &KeyPattern::single("tags"), false).unwrap();
        // Duplicates collapse in the key set.
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&IndexKey::String("x".into())));
        assert!(keys.contains(&IndexKey::String("y".into())));
    }

    #[test]
    fn test_generate_keys_compound_with_array() {
        let doc = json!({"a": [1, 2], "b": "k"});
        let pattern = KeyPattern::new(vec![("a".into(), 1), ("b".into(), 1)]);
        let keys = generate_keys(&doc, &pattern, false).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&IndexKey::Compound(vec![
            IndexKey::Int(1),
            IndexKey::String("k".into())
        ])));
    }

    #[test]
    fn test_generate_keys_parallel_arrays_rejected() {
        let doc = json!({"a": [1], "b": [2]});
        let pattern = KeyPattern::new(vec![("a".into(), 1), ("b".into(), 1)]);
        let err = generate_keys(&doc, &pattern, false).unwrap_err();
        assert!(matches!(err, QuartzError::CannotIndexParallelArrays(_)));
    }

    #[test]
    fn test_generate_text_keys_scores_term_frequency() {
        let doc = json!({"body": "the quick fox and the lazy dog"});
        let keys = generate_text_keys(&doc, "body");
        assert!(keys.contains(&IndexKey::Compound(vec![
            IndexKey::String("the".into()),
            IndexKey::Float(OrderedFloat(2.0)),
        ])));
        assert!(keys.contains(&IndexKey::Compound(vec![
            IndexKey::String("fox".into()),
            IndexKey::Float(OrderedFloat(1.0)),
        ])));
    }

    #[test]
    fn test_key_pattern_canonical() {
        let p = KeyPattern::new(vec![("a".into(), 1), ("b".into(), -1)]);
        assert_eq!(p.canonical(), "a:1,b:-1");
        assert!(KeyPattern::id().is_id());
    }
}
