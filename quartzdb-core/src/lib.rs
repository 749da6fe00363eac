// src/lib.rs
//! QuartzDB core: document collections with secondary indexes and a
//! staged query execution engine.
//!
//! Queries compile to trees of [`exec::PlanStage`] workers driven by a
//! [`executor::PlanExecutor`], which owns yielding, kill propagation and
//! document invalidation. Writes go through [`collection::Collection`],
//! which keeps every index consistent with the record store.

pub mod apply_ops;
pub mod collection;
pub mod cursor_manager;
pub mod database;
pub mod document;
pub mod error;
pub mod exec;
pub mod executor;
pub mod get_executor;
pub mod index_access;
pub mod index_catalog;
pub mod index_key;
pub mod logging;
pub mod notifier;
pub mod op_observer;
pub mod plan;
pub mod plan_cache;
pub mod query;
pub mod record_store;
pub mod working_set;
pub mod yield_policy;

pub use apply_ops::{apply_ops as apply_ops_batch, ApplyOpsResult, ReplOperation};
pub use collection::{Collection, CollectionOptions};
pub use database::Database;
pub use error::{QuartzError, Result};
pub use exec::{PlanStage, WorkStatus};
pub use executor::PlanExecutor;
pub use get_executor::{
    get_executor_count, get_executor_delete, get_executor_distinct, get_executor_find,
    get_executor_group, get_executor_text, get_executor_update,
};
pub use index_catalog::{IndexCatalog, IndexDescriptor};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use op_observer::{NoopObserver, OpObserver};
pub use query::CanonicalQuery;
pub use record_store::{RecordId, RecordStore};
pub use working_set::{WorkingSet, WorkingSetId};
pub use yield_policy::YieldPolicyKind;
