// src/get_executor.rs
// Factories that turn a canonical query into a ready-to-drive executor.
// Planning is heuristic: _id point queries bypass planning entirely, a
// top-level $or becomes per-branch subplans, a single usable index goes
// straight to scan-and-fetch, several compete in a multi-plan trial whose
// winner lands in the plan cache, and everything else falls back to a
// collection scan.

use crate::collection::Collection;
use crate::error::{QuartzError, Result};
use crate::exec::cached_plan::CachedPlanStage;
use crate::exec::count::CountStage;
use crate::exec::delete::DeleteStage;
use crate::exec::distinct::DistinctStage;
use crate::exec::group::{GroupSpec, GroupStage};
use crate::exec::limit_skip::LimitSkipStage;
use crate::exec::multi_plan::MultiPlanStage;
use crate::exec::subplan::SubplanStage;
use crate::exec::text_or::TextOrStage;
use crate::exec::update::UpdateStage;
use crate::exec::PlanStage;
use crate::executor::PlanExecutor;
use crate::index_access::IndexBounds;
use crate::index_catalog::IndexKind;
use crate::index_key::IndexKey;
use crate::plan::{build_stage, QuerySolution};
use crate::query::CanonicalQuery;
use crate::record_store::ScanDirection;
use crate::yield_policy::YieldPolicyKind;
use serde_json::Value;
use std::sync::Arc;

/// Index bounds equivalent to one field's predicate, when the predicate is
/// expressible as a single contiguous key range.
pub fn bounds_for_predicate(condition: &Value) -> Option<IndexBounds> {
    let ops = match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops,
        literal => return Some(IndexBounds::point(IndexKey::from(literal))),
    };

    if let Some(eq) = ops.get("$eq") {
        if ops.len() == 1 {
            return Some(IndexBounds::point(IndexKey::from(eq)));
        }
    }

    let mut bounds = IndexBounds::all();
    let mut usable = false;
    for (op, operand) in ops {
        match op.as_str() {
            "$gt" => {
                bounds.start = IndexKey::from(operand);
                bounds.start_inclusive = false;
                usable = true;
            }
            "$gte" => {
                bounds.start = IndexKey::from(operand);
                bounds.start_inclusive = true;
                usable = true;
            }
            "$lt" => {
                bounds.end = IndexKey::from(operand);
                bounds.end_inclusive = false;
                usable = true;
            }
            "$lte" => {
                bounds.end = IndexKey::from(operand);
                bounds.end_inclusive = true;
                usable = true;
            }
            // Anything else disqualifies the whole predicate from index use.
            _ => return None,
        }
    }
    if usable {
        Some(bounds)
    } else {
        None
    }
}

/// Ready indexes that can serve one of the filter's top-level predicates.
fn index_candidates(collection: &Arc<Collection>, filter: &Value) -> Vec<(String, IndexBounds)> {
    let mut candidates = Vec::new();
    let obj = match filter.as_object() {
        Some(obj) => obj,
        None => return candidates,
    };
    let catalog = collection.index_catalog().read();
    for (field, condition) in obj {
        if field.starts_with('$') {
            continue;
        }
        let bounds = match bounds_for_predicate(condition) {
            Some(bounds) => bounds,
            None => continue,
        };
        for entry in catalog.find_indexes_by_prefix(field, false) {
            candidates.push((entry.descriptor.name.clone(), bounds.clone()));
        }
    }
    candidates
}

/// The standard find root: cache-aware index selection over the filter.
fn build_find_root(collection: &Arc<Collection>, cq: &CanonicalQuery) -> Box<dyn PlanStage> {
    let shape = crate::plan_cache::PlanCache::shape_key(&cq.filter);
    let candidates = index_candidates(collection, &cq.filter);

    if let Some(cached) = collection.plan_cache().lookup(shape) {
        let cached_root = match &cached.index_name {
            Some(name) => candidates
                .iter()
                .find(|(n, _)| n == name)
                .map(|(name, bounds)| {
                    let solution =
                        QuerySolution::indexed(name, bounds.clone(), Some(cq.filter.clone()));
                    build_stage(collection, &solution.root)
                }),
            None => {
                let solution = QuerySolution::collscan(
                    Some(cq.filter.clone()),
                    ScanDirection::Forward,
                    false,
                );
                Some(build_stage(collection, &solution.root))
            }
        };
        match cached_root {
            Some(root) => {
                let fallback = build_uncached_root(collection, cq, &candidates, None);
                return Box::new(CachedPlanStage::new(
                    Arc::clone(collection),
                    shape,
                    cached.works,
                    root,
                    fallback,
                ));
            }
            None => {
                // The cached index no longer serves this shape.
                collection.plan_cache().remove(shape);
            }
        }
    }

    build_uncached_root(collection, cq, &candidates, Some(shape))
}

fn build_uncached_root(
    collection: &Arc<Collection>,
    cq: &CanonicalQuery,
    candidates: &[(String, IndexBounds)],
    shape: Option<u64>,
) -> Box<dyn PlanStage> {
    match candidates.len() {
        0 => {
            let solution =
                QuerySolution::collscan(Some(cq.filter.clone()), ScanDirection::Forward, false);
            build_stage(collection, &solution.root)
        }
        1 => {
            let (name, bounds) = &candidates[0];
            let solution = QuerySolution::indexed(name, bounds.clone(), Some(cq.filter.clone()));
            build_stage(collection, &solution.root)
        }
        _ => {
            let mut multi = MultiPlanStage::new(Arc::clone(collection), shape);
            for (name, bounds) in candidates {
                let solution =
                    QuerySolution::indexed(name, bounds.clone(), Some(cq.filter.clone()));
                multi.add_candidate(build_stage(collection, &solution.root), Some(name.clone()));
            }
            Box::new(multi)
        }
    }
}

/// Per-branch subplanning for a top-level $or. Returns None when some
/// branch has no usable index, in which case the whole disjunction is
/// better served by one collection scan.
fn build_or_root(collection: &Arc<Collection>, branches: &[Value]) -> Option<Box<dyn PlanStage>> {
    let mut branch_roots: Vec<Box<dyn PlanStage>> = Vec::with_capacity(branches.len());
    for branch in branches {
        let candidates = index_candidates(collection, branch);
        if candidates.is_empty() {
            return None;
        }
        let root = if candidates.len() == 1 {
            let (name, bounds) = &candidates[0];
            let solution = QuerySolution::indexed(name, bounds.clone(), Some(branch.clone()));
            build_stage(collection, &solution.root)
        } else {
            let mut multi = MultiPlanStage::new(Arc::clone(collection), None);
            for (name, bounds) in &candidates {
                let solution = QuerySolution::indexed(name, bounds.clone(), Some(branch.clone()));
                multi.add_candidate(build_stage(collection, &solution.root), Some(name.clone()));
            }
            Box::new(multi)
        };
        branch_roots.push(root);
    }
    Some(Box::new(SubplanStage::new(branch_roots)))
}

/// Executor for a find. Dispatches to the idhack, subplan, cached-plan or
/// multi-plan shape as the query warrants.
pub fn get_executor_find(
    collection: &Arc<Collection>,
    cq: CanonicalQuery,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    if cq.tailable {
        if !collection.is_capped() {
            return Err(QuartzError::InvalidQuery(
                "tailable cursors require a capped collection".into(),
            ));
        }
        let filter = if cq.is_empty_filter() {
            None
        } else {
            Some(cq.filter.clone())
        };
        let solution = QuerySolution::collscan(filter, ScanDirection::Forward, true);
        let root = build_stage(collection, &solution.root);
        let executor = PlanExecutor::new(Arc::clone(collection), root, yield_policy)?;
        return Ok(if cq.await_data {
            executor.await_data(cq.await_data_timeout)
        } else {
            executor
        });
    }

    let root: Box<dyn PlanStage> = if let Some(id_value) = cq.id_equality_value() {
        if collection.index_catalog().read().id_index().is_some() {
            let solution = QuerySolution::id_hack(id_value.clone());
            build_stage(collection, &solution.root)
        } else {
            build_find_root(collection, &cq)
        }
    } else if let Some(branches) = cq.top_level_or_branches() {
        match build_or_root(collection, branches) {
            Some(root) => root,
            None => build_find_root(collection, &cq),
        }
    } else {
        build_find_root(collection, &cq)
    };

    let root: Box<dyn PlanStage> = if cq.skip > 0 || cq.limit.is_some() {
        Box::new(LimitSkipStage::new(root, cq.skip, cq.limit))
    } else {
        root
    };
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

/// Executor producing a single {"n": <count>} document.
pub fn get_executor_count(
    collection: &Arc<Collection>,
    cq: CanonicalQuery,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    let skip = cq.skip as u64;
    let limit = cq.limit.map(|l| l as u64);
    let root: Box<dyn PlanStage> = if cq.is_empty_filter() {
        Box::new(CountStage::trivial(Arc::clone(collection), skip, limit))
    } else {
        let child = build_find_root(collection, &cq);
        Box::new(CountStage::over_plan(
            Arc::clone(collection),
            child,
            skip,
            limit,
        ))
    };
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

/// Executor whose side effect is the deletion; results are the pre-images.
pub fn get_executor_delete(
    collection: &Arc<Collection>,
    cq: CanonicalQuery,
    is_multi: bool,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    if collection.is_capped() {
        return Err(QuartzError::InvalidQuery(format!(
            "cannot remove from capped collection {}",
            collection.ns()
        )));
    }
    let filter = cq.filter.clone();
    let child = build_find_root(collection, &cq);
    let root = Box::new(DeleteStage::new(
        Arc::clone(collection),
        child,
        Some(filter),
        is_multi,
    ));
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

/// Executor whose side effect is the update; results are the post-images.
pub fn get_executor_update(
    collection: &Arc<Collection>,
    cq: CanonicalQuery,
    update: Value,
    is_multi: bool,
    upsert: bool,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    let filter = cq.filter.clone();
    let child = build_find_root(collection, &cq);
    let root = Box::new(UpdateStage::new(
        Arc::clone(collection),
        child,
        filter,
        update,
        is_multi,
        upsert,
    ));
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

/// Executor producing a single {"values": [...]} document.
pub fn get_executor_distinct(
    collection: &Arc<Collection>,
    cq: CanonicalQuery,
    field: &str,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    let child = build_find_root(collection, &cq);
    let root = Box::new(DistinctStage::new(child, field));
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

/// Executor producing one document per group, ordered by group key.
pub fn get_executor_group(
    collection: &Arc<Collection>,
    cq: CanonicalQuery,
    spec: GroupSpec,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    let child = build_find_root(collection, &cq);
    let root = Box::new(GroupStage::new(child, spec));
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

/// Executor over the collection's text index, scoring and deduplicating
/// matches for the whitespace-separated terms of `search`.
pub fn get_executor_text(
    collection: &Arc<Collection>,
    search: &str,
    yield_policy: YieldPolicyKind,
) -> Result<PlanExecutor> {
    let index_name = {
        let catalog = collection.index_catalog().read();
        let name = catalog
            .ready_entries()
            .find(|e| e.descriptor.kind == IndexKind::Text)
            .map(|e| e.descriptor.name.clone())
            .ok_or_else(|| {
                QuartzError::IndexNotFound(format!("no text index on {}", collection.ns()))
            })?;
        name
    };
    let terms: Vec<String> = search
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if terms.is_empty() {
        return Err(QuartzError::InvalidQuery("empty text search".into()));
    }
    let root = Box::new(TextOrStage::new(Arc::clone(collection), &index_name, terms));
    PlanExecutor::new(Arc::clone(collection), root, yield_policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::op_observer::NoopObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn collection() -> Arc<Collection> {
        let c = Collection::new(
            "test.planner",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        for i in 0..10 {
            c.insert_document(&json!({"_id": i, "x": i, "y": i % 3})).unwrap();
        }
        Arc::new(c)
    }

    #[test]
    fn test_bounds_for_predicate() {
        let b = bounds_for_predicate(&json!(5)).unwrap();
        assert_eq!(b.start, IndexKey::Int(5));
        assert_eq!(b.end, IndexKey::Int(5));

        let b = bounds_for_predicate(&json!({"$gte": 2, "$lt": 9})).unwrap();
        assert_eq!(b.start, IndexKey::Int(2));
        assert!(b.start_inclusive);
        assert_eq!(b.end, IndexKey::Int(9));
        assert!(!b.end_inclusive);

        assert!(bounds_for_predicate(&json!({"$in": [1, 2]})).is_none());
        assert!(bounds_for_predicate(&json!({"$exists": true})).is_none());
    }

    #[test]
    fn test_find_without_index_scans_collection() {
        let c = collection();
        let cq = CanonicalQuery::new(json!({"y": 1})).unwrap();
        let mut exec = get_executor_find(&c, cq, YieldPolicyKind::NoYield).unwrap();
        let mut n = 0;
        while exec.get_next().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[test]
    fn test_find_skip_and_limit() {
        let c = collection();
        let cq = CanonicalQuery::new(json!({})).unwrap().skip(2).limit(3);
        let mut exec = get_executor_find(&c, cq, YieldPolicyKind::NoYield).unwrap();
        let mut ids = Vec::new();
        while let Some(doc) = exec.get_next().unwrap() {
            ids.push(doc["_id"].as_i64().unwrap());
        }
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_id_point_query_uses_idhack() {
        let c = collection();
        let cq = CanonicalQuery::new(json!({"_id": 4})).unwrap();
        let mut exec = get_executor_find(&c, cq, YieldPolicyKind::NoYield).unwrap();
        let doc = exec.get_next().unwrap().unwrap();
        assert_eq!(doc["x"], json!(4));
        assert_eq!(exec.get_next().unwrap(), None);
        assert_eq!(exec.get_stats().stage_type, crate::exec::StageType::IdHack);
    }

    #[test]
    fn test_tailable_requires_capped() {
        let c = collection();
        let cq = CanonicalQuery::new(json!({}))
            .unwrap()
            .tailable_await(std::time::Duration::from_millis(10));
        assert!(matches!(
            get_executor_find(&c, cq, YieldPolicyKind::NoYield),
            Err(QuartzError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_count_with_filter_skip_limit() {
        let c = collection();
        let cq = CanonicalQuery::new(json!({"x": {"$lt": 8}})).unwrap().skip(2).limit(4);
        let mut exec = get_executor_count(&c, cq, YieldPolicyKind::NoYield).unwrap();
        let doc = exec.get_next().unwrap().unwrap();
        assert_eq!(doc["n"], json!(4));
    }

    #[test]
    fn test_delete_refused_on_capped() {
        let c = Arc::new(
            Collection::new(
                "test.caplog",
                CollectionOptions {
                    capped: true,
                    no_id_index: false,
                },
                Arc::new(NoopObserver),
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap(),
        );
        let cq = CanonicalQuery::new(json!({})).unwrap();
        assert!(matches!(
            get_executor_delete(&c, cq, true, YieldPolicyKind::NoYield),
            Err(QuartzError::InvalidQuery(_))
        ));
    }
}
