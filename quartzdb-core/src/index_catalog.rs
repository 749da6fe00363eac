// src/index_catalog.rs
// The single authority for index lookup, creation and removal on one
// collection, and the mediator for index maintenance during document writes.
//
// The catalog performs no locking of its own; the owning Collection
// serializes access. Entries are owned by value in the catalog's container;
// nothing else holds an owning reference to them.

use crate::error::{QuartzError, Result};
use crate::index_access::{BTreeAccessMethod, IndexAccessMethod, UpdateTicket};
use crate::index_key::{generate_keys, generate_text_keys, IndexKey, KeyPattern};
use crate::record_store::RecordId;
use crate::{log_debug, log_warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub const ID_INDEX_NAME: &str = "_id_";

/// Index flavor. Text indexes key `(term, score)` pairs and are consumed by
/// the text-union stage; everything else is a plain ordered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    BTree,
    Text,
}

/// Immutable description of one index: name, key pattern, options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub key_pattern: KeyPattern,
    pub kind: IndexKind,
    pub unique: bool,
    pub sparse: bool,
    pub background: bool,
}

impl IndexDescriptor {
    pub fn new(name: &str, key_pattern: KeyPattern) -> Self {
        IndexDescriptor {
            name: name.to_string(),
            key_pattern,
            kind: IndexKind::BTree,
            unique: false,
            sparse: false,
            background: false,
        }
    }

    pub fn id_descriptor() -> Self {
        IndexDescriptor {
            name: ID_INDEX_NAME.to_string(),
            key_pattern: KeyPattern::id(),
            kind: IndexKind::BTree,
            unique: true,
            sparse: false,
            background: false,
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn text(mut self) -> Self {
        self.kind = IndexKind::Text;
        self
    }

    /// Parse a JSON index spec:
    /// `{"name": ..., "key": [["a", 1], ["b", -1]], "unique": ..., ...}`.
    /// A single-field object form `{"key": {"a": 1}}` is accepted as a
    /// convenience; compound patterns must use the array form because JSON
    /// object field order is not reliable.
    pub fn from_spec(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| QuartzError::InvalidIndexSpec("spec must be an object".into()))?;

        let key = obj
            .get("key")
            .ok_or_else(|| QuartzError::InvalidIndexSpec("missing key pattern".into()))?;

        let mut kind = IndexKind::BTree;
        let mut fields: Vec<(String, i32)> = Vec::new();

        let mut push_field = |field: &str, dir: &Value| -> Result<()> {
            if field.is_empty() {
                return Err(QuartzError::InvalidIndexSpec("empty field name".into()));
            }
            match dir {
                Value::Number(n) if n.as_i64() == Some(1) => fields.push((field.into(), 1)),
                Value::Number(n) if n.as_i64() == Some(-1) => fields.push((field.into(), -1)),
                Value::String(s) if s == "text" => {
                    kind = IndexKind::Text;
                    fields.push((field.into(), 1));
                }
                other => {
                    return Err(QuartzError::InvalidIndexSpec(format!(
                        "bad direction {:?} for field '{}'",
                        other, field
                    )))
                }
            }
            Ok(())
        };

        match key {
            Value::Array(pairs) => {
                for pair in pairs {
                    let pair = pair.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        QuartzError::InvalidIndexSpec("key pairs must be [field, dir]".into())
                    })?;
                    let field = pair[0].as_str().ok_or_else(|| {
                        QuartzError::InvalidIndexSpec("field name must be a string".into())
                    })?;
                    push_field(field, &pair[1])?;
                }
            }
            Value::Object(map) => {
                if map.len() > 1 {
                    return Err(QuartzError::InvalidIndexSpec(
                        "compound patterns must use the ordered array form".into(),
                    ));
                }
                for (field, dir) in map {
                    push_field(field, dir)?;
                }
            }
            _ => {
                return Err(QuartzError::InvalidIndexSpec(
                    "key pattern must be an object or array".into(),
                ))
            }
        }

        if fields.is_empty() {
            return Err(QuartzError::InvalidIndexSpec("empty key pattern".into()));
        }

        let key_pattern = KeyPattern::new(fields);
        let name = match obj.get("name").and_then(|n| n.as_str()) {
            Some(n) => n.to_string(),
            None => default_index_name(&key_pattern),
        };

        let mut desc = IndexDescriptor::new(&name, key_pattern);
        desc.kind = kind;
        desc.unique = obj.get("unique").and_then(|v| v.as_bool()).unwrap_or(false);
        desc.sparse = obj.get("sparse").and_then(|v| v.as_bool()).unwrap_or(false);
        desc.background = obj
            .get("background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(desc)
    }
}

fn default_index_name(pattern: &KeyPattern) -> String {
    let parts: Vec<String> = pattern
        .fields
        .iter()
        .map(|(f, d)| format!("{}_{}", f, d))
        .collect();
    parts.join("_")
}

/// Build states of a catalog entry. An in-progress entry is registered so
/// that concurrent writers maintain it, but is not yet queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    InProgress,
    Ready,
}

/// One index: immutable descriptor plus live access method and build state.
pub struct IndexCatalogEntry {
    pub descriptor: IndexDescriptor,
    access: Box<dyn IndexAccessMethod>,
    state: BuildState,
    multikey: bool,
}

impl IndexCatalogEntry {
    fn new(descriptor: IndexDescriptor) -> Self {
        let access = Box::new(BTreeAccessMethod::new(descriptor.unique));
        IndexCatalogEntry {
            descriptor,
            access,
            state: BuildState::InProgress,
            multikey: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == BuildState::Ready
    }

    pub fn is_multikey(&self) -> bool {
        self.multikey
    }

    pub fn access(&self) -> &dyn IndexAccessMethod {
        self.access.as_ref()
    }

    /// Key set of one document under this index's pattern.
    pub fn keys_for(&self, doc: &Value) -> Result<BTreeSet<IndexKey>> {
        match self.descriptor.kind {
            IndexKind::BTree => generate_keys(
                doc,
                &self.descriptor.key_pattern,
                self.descriptor.sparse,
            ),
            IndexKind::Text => Ok(generate_text_keys(doc, self.descriptor.key_pattern.first_field())),
        }
    }
}

/// The set of indexes for one collection.
pub struct IndexCatalog {
    entries: Vec<IndexCatalogEntry>,
}

impl IndexCatalog {
    pub fn new() -> Self {
        IndexCatalog {
            entries: Vec::new(),
        }
    }

    // ---- validation ----

    fn validate_spec(&self, descriptor: &IndexDescriptor) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(QuartzError::InvalidIndexSpec("empty index name".into()));
        }
        let pattern = &descriptor.key_pattern;
        if pattern.fields.is_empty() {
            return Err(QuartzError::InvalidIndexSpec("empty key pattern".into()));
        }
        let mut seen = BTreeSet::new();
        for (field, dir) in &pattern.fields {
            if field.is_empty() {
                return Err(QuartzError::InvalidIndexSpec("empty field name".into()));
            }
            if !seen.insert(field.clone()) {
                return Err(QuartzError::InvalidIndexSpec(format!(
                    "field '{}' appears twice in key pattern",
                    field
                )));
            }
            if *dir != 1 && *dir != -1 {
                return Err(QuartzError::InvalidIndexSpec(format!(
                    "bad direction {} for field '{}'",
                    dir, field
                )));
            }
        }
        // The _id index must be exactly {_id: 1} and unique.
        if descriptor.name == ID_INDEX_NAME || pattern.fields.iter().any(|(f, _)| f == "_id") {
            if !pattern.is_id() || !descriptor.unique || descriptor.kind != IndexKind::BTree {
                return Err(QuartzError::InvalidIndexSpec(
                    "_id index must be the simple unique {_id: 1} index".into(),
                ));
            }
        }
        if descriptor.kind == IndexKind::Text {
            if pattern.fields.len() != 1 {
                return Err(QuartzError::InvalidIndexSpec(
                    "text indexes cover exactly one field".into(),
                ));
            }
            if descriptor.unique {
                return Err(QuartzError::InvalidIndexSpec(
                    "text indexes cannot be unique".into(),
                ));
            }
        }
        Ok(())
    }

    fn check_conflicts(&self, descriptor: &IndexDescriptor) -> Result<()> {
        for entry in &self.entries {
            if entry.descriptor.name == descriptor.name {
                return Err(QuartzError::IndexAlreadyExists(descriptor.name.clone()));
            }
            if entry.descriptor.key_pattern.canonical() == descriptor.key_pattern.canonical()
                && entry.descriptor.kind == descriptor.kind
                && entry.descriptor.unique == descriptor.unique
                && entry.descriptor.sparse == descriptor.sparse
            {
                // Same pattern with meaningfully identical options.
                return Err(QuartzError::IndexAlreadyExists(format!(
                    "{} (same key pattern as {})",
                    descriptor.name, entry.descriptor.name
                )));
            }
        }
        Ok(())
    }

    // ---- build protocol ----

    /// Register an in-progress entry. From this point concurrent writers
    /// maintain the index; it becomes queryable only at `commit_build`.
    pub fn register_build(&mut self, descriptor: IndexDescriptor) -> Result<()> {
        self.validate_spec(&descriptor)?;
        self.check_conflicts(&descriptor)?;
        log_debug!("registering index build '{}'", descriptor.name);
        self.entries.push(IndexCatalogEntry::new(descriptor));
        Ok(())
    }

    /// Insert one document's keys into an in-progress build. Idempotent for
    /// keys a concurrent writer already applied.
    pub fn populate_build(&mut self, name: &str, doc: &Value, record_id: RecordId) -> Result<()> {
        let entry = self
            .entry_mut(name)
            .ok_or_else(|| QuartzError::IndexNotFound(name.to_string()))?;
        let keys = entry.keys_for(doc)?;
        if keys.len() > 1 {
            entry.multikey = true;
        }
        entry.access.insert(&keys, record_id)
    }

    pub fn commit_build(&mut self, name: &str) -> Result<()> {
        let entry = self
            .entry_mut(name)
            .ok_or_else(|| QuartzError::IndexNotFound(name.to_string()))?;
        entry.state = BuildState::Ready;
        log_debug!("index build '{}' committed ({} entries)", name, entry.access.num_entries());
        Ok(())
    }

    /// Remove a failed or abandoned build. The entry vanishes as if the
    /// build had never been registered.
    pub fn abort_build(&mut self, name: &str) -> Result<()> {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.descriptor.name == name && e.state == BuildState::InProgress));
        if self.entries.len() == before {
            return Err(QuartzError::IndexNotFound(name.to_string()));
        }
        log_warn!("index build '{}' aborted", name);
        Ok(())
    }

    // ---- lookup ----

    fn entry_mut(&mut self, name: &str) -> Option<&mut IndexCatalogEntry> {
        self.entries.iter_mut().find(|e| e.descriptor.name == name)
    }

    pub fn find_index_by_name(&self, name: &str, include_in_progress: bool) -> Option<&IndexCatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == name && (include_in_progress || e.is_ready()))
    }

    pub fn find_index_by_key_pattern(&self, pattern: &KeyPattern) -> Option<&IndexCatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.is_ready() && e.descriptor.key_pattern.canonical() == pattern.canonical())
    }

    /// Ready indexes whose key pattern starts with `path`. When
    /// `require_single_key` is set, multikey indexes are excluded — callers
    /// that need one key per document (shard-key style lookups) pass true,
    /// scan planning passes false.
    pub fn find_indexes_by_prefix(&self, path: &str, require_single_key: bool) -> Vec<&IndexCatalogEntry> {
        self.entries
            .iter()
            .filter(|e| {
                e.is_ready()
                    && e.descriptor.kind == IndexKind::BTree
                    && e.descriptor.key_pattern.first_field() == path
                    && !(require_single_key && e.multikey)
            })
            .collect()
    }

    pub fn id_index(&self) -> Option<&IndexCatalogEntry> {
        self.find_index_by_name(ID_INDEX_NAME, false)
    }

    pub fn is_multikey(&self, name: &str) -> Result<bool> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.multikey)
            .ok_or_else(|| QuartzError::IndexNotFound(name.to_string()))
    }

    pub fn ready_entries(&self) -> impl Iterator<Item = &IndexCatalogEntry> {
        self.entries.iter().filter(|e| e.is_ready())
    }

    pub fn num_indexes_total(&self) -> usize {
        self.entries.len()
    }

    pub fn num_indexes_ready(&self) -> usize {
        self.entries.iter().filter(|e| e.is_ready()).count()
    }

    // ---- drops ----

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(QuartzError::InvalidIndexSpec(
                "cannot drop the _id index".into(),
            ));
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.descriptor.name != name);
        if self.entries.len() == before {
            return Err(QuartzError::IndexNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn drop_all_indexes(&mut self, including_id: bool) {
        if including_id {
            self.entries.clear();
        } else {
            self.entries.retain(|e| e.descriptor.name == ID_INDEX_NAME);
        }
    }

    // ---- write-path maintenance ----

    /// Insert keys for `doc` into every entry (ready and in-progress).
    ///
    /// All-or-nothing per document: a failure on any index rolls back the
    /// inserts already applied to earlier entries before returning.
    pub fn index_record(&mut self, doc: &Value, record_id: RecordId) -> Result<()> {
        let mut applied: Vec<(usize, BTreeSet<IndexKey>)> = Vec::new();

        for i in 0..self.entries.len() {
            let keys = match self.entries[i].keys_for(doc) {
                Ok(keys) => keys,
                Err(e) => {
                    self.rollback_applied(&applied, record_id);
                    return Err(e);
                }
            };
            if let Err(e) = self.entries[i].access.insert(&keys, record_id) {
                self.rollback_applied(&applied, record_id);
                return Err(e);
            }
            if keys.len() > 1 {
                self.entries[i].multikey = true;
            }
            applied.push((i, keys));
        }
        Ok(())
    }

    fn rollback_applied(&mut self, applied: &[(usize, BTreeSet<IndexKey>)], record_id: RecordId) {
        for (i, keys) in applied.iter().rev() {
            self.entries[*i].access.remove(keys, record_id);
        }
    }

    /// Remove keys for `doc` from every entry. Key generation failures are
    /// logged and skipped: the document was indexed once, so the worst case
    /// is a stale-key warning, not data loss.
    pub fn unindex_record(&mut self, doc: &Value, record_id: RecordId) {
        for entry in &mut self.entries {
            match entry.keys_for(doc) {
                Ok(keys) => entry.access.remove(&keys, record_id),
                Err(e) => {
                    log_warn!(
                        "could not regenerate keys for '{}' while unindexing {}: {}",
                        entry.descriptor.name,
                        record_id,
                        e
                    );
                }
            }
        }
    }

    /// Phase one of a document update: per-index key diffs with duplicate
    /// pre-checks. Nothing is mutated; a failure here means the whole
    /// update can be abandoned with storage untouched.
    pub fn validate_update(
        &self,
        old_doc: &Value,
        new_doc: &Value,
        record_id: RecordId,
    ) -> Result<Vec<(String, UpdateTicket)>> {
        let mut tickets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let old_keys = entry.keys_for(old_doc)?;
            let new_keys = entry.keys_for(new_doc)?;
            let ticket = entry.access.validate_update(&old_keys, &new_keys, record_id)?;
            tickets.push((entry.descriptor.name.clone(), ticket));
        }
        Ok(tickets)
    }

    /// Phase two: commit precomputed tickets.
    pub fn commit_update(&mut self, tickets: &[(String, UpdateTicket)]) -> Result<()> {
        for (name, ticket) in tickets {
            let entry = self
                .entry_mut(name)
                .ok_or_else(|| QuartzError::IndexNotFound(name.clone()))?;
            entry.access.apply_update(ticket)?;
            if ticket.made_multikey {
                entry.multikey = true;
            }
        }
        Ok(())
    }
}

impl Default for IndexCatalog {
    fn default() -> Self {
        Self::new()
    }
}
