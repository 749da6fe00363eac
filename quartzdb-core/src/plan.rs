// src/plan.rs
// Query solutions: the planner's output, a declarative tree that build_stage
// lowers into executable stages.

use crate::collection::Collection;
use crate::exec::collection_scan::CollectionScanStage;
use crate::exec::fetch::FetchStage;
use crate::exec::id_hack::IdHackStage;
use crate::exec::index_scan::IndexScanStage;
use crate::exec::PlanStage;
use crate::index_access::IndexBounds;
use crate::record_store::ScanDirection;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum SolutionNode {
    CollScan {
        filter: Option<Value>,
        direction: ScanDirection,
        tailable: bool,
    },
    IndexScan {
        index_name: String,
        bounds: IndexBounds,
        forward: bool,
    },
    Fetch {
        child: Box<SolutionNode>,
        filter: Option<Value>,
    },
    IdHack {
        id_value: Value,
    },
}

#[derive(Debug, Clone)]
pub struct QuerySolution {
    pub root: SolutionNode,
    /// Index backing the solution, used as the plan cache payload.
    pub index_name: Option<String>,
}

impl QuerySolution {
    pub fn collscan(filter: Option<Value>, direction: ScanDirection, tailable: bool) -> Self {
        QuerySolution {
            root: SolutionNode::CollScan {
                filter,
                direction,
                tailable,
            },
            index_name: None,
        }
    }

    /// IndexScan under a Fetch, the standard indexed-access shape.
    pub fn indexed(index_name: &str, bounds: IndexBounds, filter: Option<Value>) -> Self {
        QuerySolution {
            root: SolutionNode::Fetch {
                child: Box::new(SolutionNode::IndexScan {
                    index_name: index_name.to_string(),
                    bounds,
                    forward: true,
                }),
                filter,
            },
            index_name: Some(index_name.to_string()),
        }
    }

    pub fn id_hack(id_value: Value) -> Self {
        QuerySolution {
            root: SolutionNode::IdHack { id_value },
            index_name: None,
        }
    }
}

/// Lower a solution node into its stage.
pub fn build_stage(collection: &Arc<Collection>, node: &SolutionNode) -> Box<dyn PlanStage> {
    match node {
        SolutionNode::CollScan {
            filter,
            direction,
            tailable,
        } => {
            let stage =
                CollectionScanStage::new(Arc::clone(collection), *direction, filter.clone());
            if *tailable {
                Box::new(stage.tailable())
            } else {
                Box::new(stage)
            }
        }
        SolutionNode::IndexScan {
            index_name,
            bounds,
            forward,
        } => Box::new(IndexScanStage::new(
            Arc::clone(collection),
            index_name,
            bounds.clone(),
            *forward,
        )),
        SolutionNode::Fetch { child, filter } => {
            let child_stage = build_stage(collection, child);
            Box::new(FetchStage::new(
                Arc::clone(collection),
                child_stage,
                filter.clone(),
            ))
        }
        SolutionNode::IdHack { id_value } => {
            Box::new(IdHackStage::new(Arc::clone(collection), id_value.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::exec::StageType;
    use crate::op_observer::NoopObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_lowering_preserves_tree_shape() {
        let c = Arc::new(
            Collection::new(
                "test.plan",
                CollectionOptions::default(),
                Arc::new(NoopObserver),
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap(),
        );
        let solution = QuerySolution::indexed("x_1", IndexBounds::all(), Some(json!({"y": 1})));
        let stage = build_stage(&c, &solution.root);
        assert_eq!(stage.stage_type(), StageType::Fetch);
        let stats = stage.stats();
        assert_eq!(stats.children[0].stage_type, StageType::IndexScan);
    }
}
