// src/query.rs
// Filter matching and the canonical query form handed to the planner.
//
// Filters are JSON documents in the usual shape: field paths map to either
// a literal (implicit equality) or an operator object, and $and/$or take
// arrays of sub-filters. A field whose stored value is an array matches if
// any element matches, mirroring the multikey behavior of the indexes.

use crate::document::{compare_values, get_path, values_equal};
use crate::error::{QuartzError, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;

/// Parsed query plus the execution options the planner cares about.
#[derive(Debug, Clone)]
pub struct CanonicalQuery {
    pub filter: Value,
    pub skip: usize,
    pub limit: Option<usize>,
    pub tailable: bool,
    pub await_data: bool,
    pub await_data_timeout: Duration,
}

impl CanonicalQuery {
    pub fn new(filter: Value) -> Result<Self> {
        validate_filter(&filter)?;
        Ok(CanonicalQuery {
            filter,
            skip: 0,
            limit: None,
            tailable: false,
            await_data: false,
            await_data_timeout: Duration::from_secs(1),
        })
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tailable_await(mut self, timeout: Duration) -> Self {
        self.tailable = true;
        self.await_data = true;
        self.await_data_timeout = timeout;
        self
    }

    pub fn is_empty_filter(&self) -> bool {
        self.filter.as_object().map(|o| o.is_empty()).unwrap_or(false)
    }

    /// The branches of a top-level `$or`, if the filter is exactly one.
    pub fn top_level_or_branches(&self) -> Option<&Vec<Value>> {
        let obj = self.filter.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        obj.get("$or")?.as_array()
    }

    /// Point value for `{_id: <literal>}` filters, the idhack shape.
    pub fn id_equality_value(&self) -> Option<&Value> {
        let obj = self.filter.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let v = obj.get("_id")?;
        match v {
            Value::Object(inner) => {
                if inner.len() == 1 {
                    inner.get("$eq")
                } else {
                    None
                }
            }
            _ => Some(v),
        }
    }
}

fn validate_filter(filter: &Value) -> Result<()> {
    let obj = filter
        .as_object()
        .ok_or_else(|| QuartzError::InvalidQuery("filter must be an object".into()))?;
    for (field, condition) in obj {
        match field.as_str() {
            "$and" | "$or" => {
                let branches = condition.as_array().ok_or_else(|| {
                    QuartzError::InvalidQuery(format!("{} expects an array", field))
                })?;
                if branches.is_empty() {
                    return Err(QuartzError::InvalidQuery(format!(
                        "{} expects a non-empty array",
                        field
                    )));
                }
                for branch in branches {
                    validate_filter(branch)?;
                }
            }
            f if f.starts_with('$') => {
                return Err(QuartzError::InvalidQuery(format!(
                    "unknown top-level operator {}",
                    f
                )));
            }
            _ => {
                if let Value::Object(ops) = condition {
                    if ops.keys().any(|k| k.starts_with('$')) {
                        for op in ops.keys() {
                            match op.as_str() {
                                "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$in"
                                | "$nin" | "$exists" => {}
                                other => {
                                    return Err(QuartzError::InvalidQuery(format!(
                                        "unknown operator {}",
                                        other
                                    )))
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Does `doc` satisfy `filter`? Assumes the filter already passed
/// `CanonicalQuery::new` validation; malformed operators found here still
/// surface as `InvalidQuery` rather than silently not matching.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool> {
    let obj = filter
        .as_object()
        .ok_or_else(|| QuartzError::InvalidQuery("filter must be an object".into()))?;
    for (field, condition) in obj {
        let ok = match field.as_str() {
            "$and" => {
                let branches = condition
                    .as_array()
                    .ok_or_else(|| QuartzError::InvalidQuery("$and expects an array".into()))?;
                let mut all = true;
                for branch in branches {
                    if !matches(doc, branch)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let branches = condition
                    .as_array()
                    .ok_or_else(|| QuartzError::InvalidQuery("$or expects an array".into()))?;
                let mut any = false;
                for branch in branches {
                    if matches(doc, branch)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            _ => match_field(doc, field, condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_field(doc: &Value, path: &str, condition: &Value) -> Result<bool> {
    let stored = get_path(doc, path);
    match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            for (op, operand) in ops {
                if !apply_operator(stored, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(value_matches(stored, literal)),
    }
}

/// Equality with array-element fan-out: a stored array equals the operand
/// if the whole array does or any element does.
fn value_matches(stored: Option<&Value>, operand: &Value) -> bool {
    match stored {
        None => operand.is_null(),
        Some(v) => {
            if values_equal(v, operand) {
                return true;
            }
            if let Value::Array(elems) = v {
                elems.iter().any(|e| values_equal(e, operand))
            } else {
                false
            }
        }
    }
}

fn compare_matches(stored: Option<&Value>, operand: &Value, wanted: &[Ordering]) -> bool {
    let check = |v: &Value| -> bool {
        // Order comparisons only apply within the same type bracket.
        if !same_bracket(v, operand) {
            return false;
        }
        wanted.contains(&compare_values(v, operand))
    };
    match stored {
        None => false,
        Some(Value::Array(elems)) => elems.iter().any(check),
        Some(v) => check(v),
    }
}

fn same_bracket(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

fn apply_operator(stored: Option<&Value>, op: &str, operand: &Value) -> Result<bool> {
    match op {
        "$eq" => Ok(value_matches(stored, operand)),
        "$ne" => Ok(!value_matches(stored, operand)),
        "$gt" => Ok(compare_matches(stored, operand, &[Ordering::Greater])),
        "$gte" => Ok(compare_matches(
            stored,
            operand,
            &[Ordering::Greater, Ordering::Equal],
        )),
        "$lt" => Ok(compare_matches(stored, operand, &[Ordering::Less])),
        "$lte" => Ok(compare_matches(
            stored,
            operand,
            &[Ordering::Less, Ordering::Equal],
        )),
        "$in" => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| QuartzError::InvalidQuery("$in expects an array".into()))?;
            Ok(candidates.iter().any(|c| value_matches(stored, c)))
        }
        "$nin" => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| QuartzError::InvalidQuery("$nin expects an array".into()))?;
            Ok(!candidates.iter().any(|c| value_matches(stored, c)))
        }
        "$exists" => {
            let wanted = operand.as_bool().unwrap_or(true);
            Ok(stored.is_some() == wanted)
        }
        other => Err(QuartzError::InvalidQuery(format!(
            "unknown operator {}",
            other
        ))),
    }
}
