//! Lineage query results and exports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::TrailId;
use crate::orchestrator::FailureRecord;
use crate::reference::{Edge, EdgeKind, EntityRef, LineageNode};
use crate::trail::TrailStatus;

/// Direct and transitive sources of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageReport {
    pub entity: EntityRef,
    pub direct: Vec<Edge>,
    /// Breadth-first, each entity once at its shallowest depth.
    pub transitive: Vec<LineageNode>,
    /// Reached entities that have no sources of their own.
    pub leaves: Vec<EntityRef>,
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub entity: EntityRef,
    pub label: String,
}

/// Node/edge export of a trail's lineage for visualization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineageGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailSummary {
    pub trail_id: TrailId,
    pub status: TrailStatus,
    pub populated_tables: usize,
    pub rows: usize,
    pub values: usize,
    pub edges: BTreeMap<EdgeKind, usize>,
    pub skipped_inits: usize,
    pub failures: Vec<FailureRecord>,
}

impl TrailSummary {
    pub fn edge_total(&self) -> usize {
        self.edges.values().sum()
    }
}
