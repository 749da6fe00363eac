// src/exec/update.rs
// Applies an update to each document the child produces. The update is
// either a replacement document or an operator document ($set, $unset,
// $inc); upserts synthesize a document from the filter's equality fields
// when nothing matched.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::query::matches;
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet, WorkingSetId};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub struct UpdateStage {
    collection: Arc<Collection>,
    child: Box<dyn PlanStage>,
    filter: Value,
    update: Value,
    is_multi: bool,
    upsert: bool,
    retry_member: Option<WorkingSetId>,
    docs_matched: u64,
    docs_modified: u64,
    done: bool,
    stats: CommonStats,
}

impl UpdateStage {
    pub fn new(
        collection: Arc<Collection>,
        child: Box<dyn PlanStage>,
        filter: Value,
        update: Value,
        is_multi: bool,
        upsert: bool,
    ) -> Self {
        UpdateStage {
            collection,
            child,
            filter,
            update,
            is_multi,
            upsert,
            retry_member: None,
            docs_matched: 0,
            docs_modified: 0,
            done: false,
            stats: CommonStats::default(),
        }
    }

    pub fn docs_matched(&self) -> u64 {
        self.docs_matched
    }

    pub fn docs_modified(&self) -> u64 {
        self.docs_modified
    }

    fn attempt_update(&mut self, ws: &mut WorkingSet, id: WorkingSetId) -> WorkStatus {
        let record_id = match ws.get(id).record_id {
            Some(rid) => rid,
            None => {
                ws.free(id);
                return self.stats.tally(WorkStatus::NeedTime);
            }
        };

        // Re-validate stale members against the current snapshot.
        let current_snapshot = self.collection.record_store().read().snapshot_id();
        let old_doc = if ws.get(id).snapshot_id != current_snapshot || !ws.get(id).has_obj() {
            match self.collection.record_store().read().data_for(record_id) {
                Some(doc) => {
                    match matches(&doc, &self.filter) {
                        Ok(true) => {}
                        Ok(false) => {
                            ws.free(id);
                            return self.stats.tally(WorkStatus::NeedTime);
                        }
                        Err(e) => {
                            ws.free(id);
                            let err_id = ws.make_error(e);
                            return self.stats.tally(WorkStatus::Failure(err_id));
                        }
                    }
                    doc
                }
                None => {
                    ws.free(id);
                    return self.stats.tally(WorkStatus::NeedTime);
                }
            }
        } else {
            ws.get(id).obj.clone().expect("checked above")
        };

        let new_doc = match apply_update(&old_doc, &self.update) {
            Ok(doc) => doc,
            Err(e) => {
                ws.free(id);
                let err_id = ws.make_error(e);
                return self.stats.tally(WorkStatus::Failure(err_id));
            }
        };

        self.docs_matched += 1;
        if new_doc == old_doc {
            // A no-op update still counts as matched.
            ws.free(id);
            if !self.is_multi {
                self.done = true;
            }
            return self.stats.tally(WorkStatus::NeedTime);
        }

        match self.collection.update_document(record_id, &new_doc) {
            Ok(_) => {
                self.docs_modified += 1;
                if !self.is_multi {
                    self.done = true;
                }
                let member = ws.get_mut(id);
                member.state = MemberState::OwnedObj;
                member.record_id = None;
                member.key_data.clear();
                member.obj = Some(new_doc);
                self.stats.tally(WorkStatus::Advanced(id))
            }
            Err(e) if e.is_transient() => {
                self.docs_matched -= 1;
                self.retry_member = Some(id);
                self.stats.tally(WorkStatus::NeedYield(Some(id)))
            }
            Err(e) => {
                ws.free(id);
                let err_id = ws.make_error(e);
                self.stats.tally(WorkStatus::Failure(err_id))
            }
        }
    }

    fn perform_upsert(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        let base = base_from_filter(&self.filter);
        let new_doc = match apply_update(&base, &self.update) {
            Ok(doc) => doc,
            Err(e) => {
                let err_id = ws.make_error(e);
                return self.stats.tally(WorkStatus::Failure(err_id));
            }
        };
        match self.collection.insert_document_auto_id(&new_doc) {
            Ok((_, stored)) => {
                self.docs_modified += 1;
                let id = ws.allocate();
                let member = ws.get_mut(id);
                member.state = MemberState::OwnedObj;
                member.obj = Some(stored);
                self.stats.tally(WorkStatus::Advanced(id))
            }
            Err(e) => {
                let err_id = ws.make_error(e);
                self.stats.tally(WorkStatus::Failure(err_id))
            }
        }
    }
}

impl PlanStage for UpdateStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.done {
            return self.stats.tally(WorkStatus::Eof);
        }
        if let Some(id) = self.retry_member.take() {
            return self.attempt_update(ws, id);
        }
        match self.child.work(ws) {
            WorkStatus::Advanced(id) => self.attempt_update(ws, id),
            WorkStatus::Eof => {
                self.done = true;
                if self.upsert && self.docs_matched == 0 {
                    return self.perform_upsert(ws);
                }
                self.stats.tally(WorkStatus::Eof)
            }
            other => self.stats.tally(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self) -> Result<()> {
        self.child.restore_state()
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        if let Some(id) = self.retry_member {
            if ws.get(id).record_id == Some(record_id) && kind == InvalidationType::Deletion {
                ws.free(id);
                self.retry_member = None;
            }
        }
        self.child.invalidate(ws, record_id, kind);
    }

    fn is_eof(&self) -> bool {
        self.done
    }

    fn stage_type(&self) -> StageType {
        StageType::Update
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Update, self.stats.clone());
        stats.specific = Some(format!(
            "multi={} upsert={} matched={} modified={}",
            self.is_multi, self.upsert, self.docs_matched, self.docs_modified
        ));
        stats.children.push(self.child.stats());
        stats
    }
}

/// Apply an update spec to a document. Operator documents modify a clone of
/// the original; replacement documents supplant it, inheriting its _id.
pub fn apply_update(old_doc: &Value, update: &Value) -> Result<Value> {
    let spec = update
        .as_object()
        .ok_or_else(|| QuartzError::InvalidQuery("update must be an object".into()))?;

    let has_operators = spec.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        let mut replacement = update.clone();
        if let (Some(old_id), Some(obj)) = (old_doc.get("_id"), replacement.as_object_mut()) {
            obj.entry("_id".to_string()).or_insert_with(|| old_id.clone());
        }
        return Ok(replacement);
    }

    let mut doc = old_doc.clone();
    for (op, args) in spec {
        let args = args.as_object().ok_or_else(|| {
            QuartzError::InvalidQuery(format!("{} expects an object", op))
        })?;
        match op.as_str() {
            "$set" => {
                for (path, value) in args {
                    set_path(&mut doc, path, value.clone())?;
                }
            }
            "$unset" => {
                for path in args.keys() {
                    unset_path(&mut doc, path);
                }
            }
            "$inc" => {
                for (path, amount) in args {
                    let amount = amount.as_f64().ok_or_else(|| {
                        QuartzError::InvalidQuery("$inc expects a numeric amount".into())
                    })?;
                    let current = crate::document::get_path(&doc, path)
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    let sum = current + amount;
                    let value = if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
                        json!(sum as i64)
                    } else {
                        json!(sum)
                    };
                    set_path(&mut doc, path, value)?;
                }
            }
            other => {
                return Err(QuartzError::InvalidQuery(format!(
                    "unsupported update operator {}",
                    other
                )))
            }
        }
    }
    Ok(doc)
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let obj = current.as_object_mut().ok_or_else(|| {
            QuartzError::InvalidQuery(format!("cannot set path '{}' through a non-object", path))
        })?;
        if i == segments.len() - 1 {
            obj.insert(segment.to_string(), value);
            return Ok(());
        }
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

fn unset_path(doc: &mut Value, path: &str) {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let obj = match current.as_object_mut() {
            Some(obj) => obj,
            None => return,
        };
        if i == segments.len() - 1 {
            obj.remove(*segment);
            return;
        }
        current = match obj.get_mut(*segment) {
            Some(next) => next,
            None => return,
        };
    }
}

/// Seed document for an upsert: the filter's top-level equality fields.
fn base_from_filter(filter: &Value) -> Value {
    let mut base = Map::new();
    if let Some(obj) = filter.as_object() {
        for (field, condition) in obj {
            if field.starts_with('$') {
                continue;
            }
            match condition {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    if let Some(eq) = ops.get("$eq") {
                        base.insert(field.clone(), eq.clone());
                    }
                }
                literal => {
                    base.insert(field.clone(), literal.clone());
                }
            }
        }
    }
    Value::Object(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::exec::collection_scan::CollectionScanStage;
    use crate::op_observer::NoopObserver;
    use crate::record_store::ScanDirection;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_apply_set_unset_inc() {
        let old = json!({"_id": 1, "a": 1, "b": {"c": 2}, "d": "x"});
        let new = apply_update(
            &old,
            &json!({"$set": {"b.c": 5, "e": true}, "$unset": {"d": ""}, "$inc": {"a": 2}}),
        )
        .unwrap();
        assert_eq!(new, json!({"_id": 1, "a": 3, "b": {"c": 5}, "e": true}));
    }

    #[test]
    fn test_replacement_inherits_id() {
        let old = json!({"_id": 7, "a": 1});
        let new = apply_update(&old, &json!({"b": 2})).unwrap();
        assert_eq!(new["_id"], json!(7));
        assert_eq!(new["b"], json!(2));
        assert!(new.get("a").is_none());
    }

    #[test]
    fn test_inc_creates_missing_field() {
        let new = apply_update(&json!({"_id": 1}), &json!({"$inc": {"n": 3}})).unwrap();
        assert_eq!(new["n"], json!(3));
    }

    fn collection(docs: &[Value]) -> Arc<Collection> {
        let c = Collection::new(
            "test.update",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        for doc in docs {
            c.insert_document(doc).unwrap();
        }
        Arc::new(c)
    }

    fn run_update(c: &Arc<Collection>, filter: Value, update: Value, multi: bool, upsert: bool) -> (u64, u64) {
        let scan = CollectionScanStage::new(
            Arc::clone(c),
            ScanDirection::Forward,
            Some(filter.clone()),
        );
        let mut stage = UpdateStage::new(Arc::clone(c), Box::new(scan), filter, update, multi, upsert);
        let mut ws = WorkingSet::new();
        loop {
            match stage.work(&mut ws) {
                WorkStatus::Advanced(id) => ws.free(id),
                WorkStatus::NeedTime => {}
                WorkStatus::Eof => break,
                other => panic!("unexpected status {:?}", other),
            }
        }
        (stage.docs_matched(), stage.docs_modified())
    }

    #[test]
    fn test_multi_update_modifies_all_matches() {
        let c = collection(&[
            json!({"_id": 1, "x": 1}),
            json!({"_id": 2, "x": 1}),
            json!({"_id": 3, "x": 2}),
        ]);
        let (matched, modified) =
            run_update(&c, json!({"x": 1}), json!({"$set": {"y": true}}), true, false);
        assert_eq!((matched, modified), (2, 2));
    }

    #[test]
    fn test_single_update_stops_after_first() {
        let c = collection(&[json!({"_id": 1, "x": 1}), json!({"_id": 2, "x": 1})]);
        let (matched, modified) =
            run_update(&c, json!({"x": 1}), json!({"$inc": {"x": 1}}), false, false);
        assert_eq!((matched, modified), (1, 1));
    }

    #[test]
    fn test_upsert_inserts_when_nothing_matches() {
        let c = collection(&[]);
        let (_, modified) = run_update(
            &c,
            json!({"x": 9}),
            json!({"$set": {"y": 1}}),
            false,
            true,
        );
        assert_eq!(modified, 1);
        assert_eq!(c.num_records(), 1);
        let rid = c.record_store().read().record_ids(ScanDirection::Forward)[0];
        let doc = c.record_store().read().data_for(rid).unwrap();
        assert_eq!(doc["x"], json!(9));
        assert_eq!(doc["y"], json!(1));
        assert!(doc.get("_id").is_some());
    }
}
