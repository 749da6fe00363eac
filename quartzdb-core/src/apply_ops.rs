// src/apply_ops.rs
// Replication-style batch application. A batch of plain CRUD operations
// against existing collections applies atomically: any failure rolls the
// earlier operations back through an undo log, and the observer sees one
// applyOps record for the whole batch. Batches containing commands or
// touching collections that do not exist yet fall back to sequential,
// non-atomic application with per-operation outcomes.

use crate::collection::{Collection, CollectionOptions};
use crate::database::Database;
use crate::error::{QuartzError, Result};
use crate::exec::update::apply_update;
use crate::log_debug;
use crate::record_store::RecordId;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Command,
}

/// One parsed operation from an applyOps batch.
#[derive(Debug, Clone)]
pub struct ReplOperation {
    pub kind: OpKind,
    pub coll_name: String,
    /// Insert: the document. Update: the update spec. Delete: the query.
    /// Command: the command document.
    pub o: Value,
    /// Update only: the target query, {_id: ...}.
    pub o2: Option<Value>,
}

impl ReplOperation {
    pub fn from_value(db_name: &str, value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| QuartzError::InvalidQuery("applyOps entries must be objects".into()))?;
        let op = obj
            .get("op")
            .and_then(|o| o.as_str())
            .ok_or_else(|| QuartzError::InvalidQuery("missing op type".into()))?;
        let ns = obj
            .get("ns")
            .and_then(|n| n.as_str())
            .ok_or_else(|| QuartzError::InvalidQuery("missing ns".into()))?;
        let o = obj
            .get("o")
            .cloned()
            .ok_or_else(|| QuartzError::InvalidQuery("missing o document".into()))?;

        let kind = match op {
            "i" => OpKind::Insert,
            "u" => OpKind::Update,
            "d" => OpKind::Delete,
            "c" => OpKind::Command,
            other => {
                return Err(QuartzError::InvalidQuery(format!(
                    "unknown op type '{}'",
                    other
                )))
            }
        };

        let (ns_db, coll_name) = ns
            .split_once('.')
            .ok_or_else(|| QuartzError::InvalidNamespace(ns.to_string()))?;
        if ns_db != db_name {
            return Err(QuartzError::InvalidNamespace(format!(
                "{} does not belong to database {}",
                ns, db_name
            )));
        }

        let coll_name = if kind == OpKind::Command {
            // Commands address db.$cmd; the target collection is named in
            // the command document itself.
            o.as_object()
                .and_then(|cmd| cmd.get("create").or_else(|| cmd.get("drop")))
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    QuartzError::InvalidQuery("command must name a collection".into())
                })?
                .to_string()
        } else {
            coll_name.to_string()
        };

        if kind == OpKind::Update && obj.get("o2").is_none() {
            return Err(QuartzError::InvalidQuery("update op requires o2".into()));
        }

        Ok(ReplOperation {
            kind,
            coll_name,
            o,
            o2: obj.get("o2").cloned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOpsResult {
    pub applied: usize,
    /// Per-operation outcome, in batch order.
    pub results: Vec<bool>,
}

enum UndoRecord {
    Insert {
        collection: Arc<Collection>,
        record_id: RecordId,
    },
    Update {
        collection: Arc<Collection>,
        record_id: RecordId,
        pre_image: Value,
    },
    Delete {
        collection: Arc<Collection>,
        pre_image: Value,
    },
}

/// Apply a batch of operations. See the module comment for the atomicity
/// contract.
pub fn apply_ops(db: &Database, ops: &Value) -> Result<ApplyOpsResult> {
    let entries = ops
        .as_array()
        .ok_or_else(|| QuartzError::InvalidQuery("applyOps expects an array".into()))?;
    let parsed: Vec<ReplOperation> = entries
        .iter()
        .map(|e| ReplOperation::from_value(db.name(), e))
        .collect::<Result<_>>()?;

    let atomic = parsed.iter().all(|op| {
        op.kind != OpKind::Command && db.get_collection(&op.coll_name).is_some()
    });

    if atomic {
        apply_atomic(db, &parsed, ops)
    } else {
        apply_sequential(db, &parsed)
    }
}

fn apply_atomic(db: &Database, ops: &[ReplOperation], raw_ops: &Value) -> Result<ApplyOpsResult> {
    let collections: Vec<Arc<Collection>> = ops
        .iter()
        .map(|op| {
            db.get_collection(&op.coll_name)
                .ok_or_else(|| QuartzError::CollectionNotFound(op.coll_name.clone()))
        })
        .collect::<Result<_>>()?;

    for collection in &collections {
        collection.set_observer_muted(true);
    }
    let outcome = apply_atomic_inner(ops, &collections);
    for collection in &collections {
        collection.set_observer_muted(false);
    }

    match outcome {
        Ok(()) => {
            db.observer().on_apply_ops(db.name(), raw_ops);
            Ok(ApplyOpsResult {
                applied: ops.len(),
                results: vec![true; ops.len()],
            })
        }
        Err(e) => Err(e),
    }
}

fn apply_atomic_inner(ops: &[ReplOperation], collections: &[Arc<Collection>]) -> Result<()> {
    let mut undo_log: Vec<UndoRecord> = Vec::with_capacity(ops.len());

    for (op, collection) in ops.iter().zip(collections) {
        let applied = apply_one(op, collection);
        match applied {
            Ok(undo) => undo_log.push(undo),
            Err(e) => {
                log_debug!("atomic applyOps failed at op {}: {}", undo_log.len(), e);
                rollback(undo_log);
                return Err(e);
            }
        }
    }
    Ok(())
}

fn apply_one(op: &ReplOperation, collection: &Arc<Collection>) -> Result<UndoRecord> {
    match op.kind {
        OpKind::Insert => {
            let record_id = collection.insert_document(&op.o)?;
            Ok(UndoRecord::Insert {
                collection: Arc::clone(collection),
                record_id,
            })
        }
        OpKind::Update => {
            let target = op
                .o2
                .as_ref()
                .and_then(|o2| o2.get("_id"))
                .ok_or_else(|| QuartzError::InvalidQuery("update o2 requires _id".into()))?;
            let (record_id, pre_image) = collection
                .find_record_by_id(target)
                .ok_or_else(|| QuartzError::DocumentNotFound(target.to_string()))?;
            let new_doc = apply_update(&pre_image, &op.o)?;
            let location = collection.update_document(record_id, &new_doc)?;
            Ok(UndoRecord::Update {
                collection: Arc::clone(collection),
                record_id: location.record_id(),
                pre_image,
            })
        }
        OpKind::Delete => {
            let target = op
                .o
                .get("_id")
                .ok_or_else(|| QuartzError::InvalidQuery("delete op requires _id".into()))?;
            let (record_id, pre_image) = collection
                .find_record_by_id(target)
                .ok_or_else(|| QuartzError::DocumentNotFound(target.to_string()))?;
            collection.delete_document(record_id, false)?;
            Ok(UndoRecord::Delete {
                collection: Arc::clone(collection),
                pre_image,
            })
        }
        OpKind::Command => Err(QuartzError::Internal(
            "commands cannot run on the atomic path".into(),
        )),
    }
}

fn rollback(undo_log: Vec<UndoRecord>) {
    for record in undo_log.into_iter().rev() {
        // Undo failures leave the batch partially visible; there is no
        // further recourse, so they are logged and skipped.
        let result = match record {
            UndoRecord::Insert {
                collection,
                record_id,
            } => collection.delete_document(record_id, true),
            UndoRecord::Update {
                collection,
                record_id,
                pre_image,
            } => collection.update_document(record_id, &pre_image).map(|_| ()),
            UndoRecord::Delete {
                collection,
                pre_image,
            } => collection.insert_document(&pre_image).map(|_| ()),
        };
        if let Err(e) = result {
            crate::log_error!("applyOps rollback step failed: {}", e);
        }
    }
}

fn apply_sequential(db: &Database, ops: &[ReplOperation]) -> Result<ApplyOpsResult> {
    let mut results = Vec::with_capacity(ops.len());
    let mut applied = 0;

    for op in ops {
        let outcome = match op.kind {
            OpKind::Command => run_command(db, op),
            _ => db
                .get_or_create_collection(&op.coll_name)
                .and_then(|collection| apply_one(op, &collection).map(|_| ())),
        };
        match outcome {
            Ok(()) => {
                applied += 1;
                results.push(true);
            }
            Err(e) => {
                // First failure stops the batch; later ops never run.
                results.push(false);
                log_debug!("applyOps stopped at op {}: {}", results.len() - 1, e);
                return Ok(ApplyOpsResult { applied, results });
            }
        }
    }
    Ok(ApplyOpsResult { applied, results })
}

fn run_command(db: &Database, op: &ReplOperation) -> Result<()> {
    let cmd = op
        .o
        .as_object()
        .ok_or_else(|| QuartzError::InvalidQuery("command must be an object".into()))?;
    if cmd.contains_key("create") {
        let capped = cmd.get("capped").and_then(|c| c.as_bool()).unwrap_or(false);
        db.create_collection(
            &op.coll_name,
            CollectionOptions {
                capped,
                no_id_index: false,
            },
        )
        .map(|_| ())
    } else if cmd.contains_key("drop") {
        db.drop_collection(&op.coll_name)
    } else {
        Err(QuartzError::InvalidQuery(
            "unsupported command in applyOps".into(),
        ))
    }
}

/// Convenience builders for batch entries.
pub fn insert_op(ns: &str, doc: Value) -> Value {
    json!({"op": "i", "ns": ns, "o": doc})
}

pub fn update_op(ns: &str, target_id: Value, update: Value) -> Value {
    json!({"op": "u", "ns": ns, "o": update, "o2": {"_id": target_id}})
}

pub fn delete_op(ns: &str, target_id: Value) -> Value {
    json!({"op": "d", "ns": ns, "o": {"_id": target_id}})
}
