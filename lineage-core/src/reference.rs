//! Polymorphic lineage edges and their resolution.
//!
//! An edge points from an owner entity to a target of any concrete variant.
//! The target is a tagged union (`EntityKind` + `EntityId`) rather than an
//! untyped id, so every edge kind can state which variants it accepts.
//!
//! Edges are deduplicated and append-only. Transitive resolution is a lazy
//! breadth-first walk; the reachable subgraph is checked for cycles before the
//! walk starts, so a malformed graph fails instead of looping.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};
use crate::ids::EntityId;

// ── Entity variants ───────────────────────────────────────────

/// Concrete variant tag for every entity an edge may point at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    DatabaseTable,
    DerivedTable,
    TableCreationFunction,
    DatabaseField,
    Function,
    PopulatedDatabaseTable,
    EvaluatedDerivedTable,
    DatabaseRow,
    DerivedTableRow,
    DatabaseColumnValue,
    EvaluatedFunction,
}

impl EntityKind {
    /// Definitional entities live in the metadata snapshot, not in a trail.
    pub fn is_definitional(&self) -> bool {
        matches!(
            self,
            Self::DatabaseTable
                | Self::DerivedTable
                | Self::TableCreationFunction
                | Self::DatabaseField
                | Self::Function
        )
    }
}

/// Typed pointer to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ── Edges ─────────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EdgeKind {
    /// Function column → column it reads.
    FunctionColumnReference,
    /// Derived row → source row it was built from.
    DerivedRowSourceReference,
    /// Evaluated value → source value consulted while computing it.
    EvaluatedFunctionSourceValue,
    /// Table creation function → source table.
    TableCreationSourceTable,
    /// Table creation function → column used by its predicate, keys or grouping.
    TableCreationFunctionColumn,
}

impl EdgeKind {
    /// Reject an owner or target variant this kind does not link.
    pub fn check(&self, owner: EntityRef, target: EntityRef) -> Result<()> {
        if !self.accepts_owner(owner.kind) {
            return Err(LineageError::InvalidEdgeOwner { kind: *self, owner });
        }
        if !self.accepts_target(target.kind) {
            return Err(LineageError::InvalidEdgeTarget {
                kind: *self,
                owner,
                target,
            });
        }
        Ok(())
    }

    pub fn accepts_owner(&self, owner: EntityKind) -> bool {
        use EntityKind as K;
        match self {
            Self::FunctionColumnReference => owner == K::Function,
            Self::DerivedRowSourceReference => owner == K::DerivedTableRow,
            Self::EvaluatedFunctionSourceValue => owner == K::EvaluatedFunction,
            Self::TableCreationSourceTable | Self::TableCreationFunctionColumn => {
                owner == K::TableCreationFunction
            }
        }
    }

    pub fn accepts_target(&self, target: EntityKind) -> bool {
        use EntityKind as K;
        match self {
            Self::FunctionColumnReference | Self::TableCreationFunctionColumn => {
                matches!(target, K::DatabaseField | K::Function)
            }
            Self::DerivedRowSourceReference => matches!(target, K::DatabaseRow | K::DerivedTableRow),
            Self::EvaluatedFunctionSourceValue => {
                matches!(target, K::DatabaseColumnValue | K::EvaluatedFunction)
            }
            Self::TableCreationSourceTable => matches!(target, K::DatabaseTable | K::DerivedTable),
        }
    }
}

/// One directed lineage edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub owner: EntityRef,
    pub kind: EdgeKind,
    pub target: EntityRef,
}

// ── Resolver ──────────────────────────────────────────────────

/// Append-only edge store for one trail.
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    log: Vec<Edge>,
    by_owner: HashMap<EntityId, Vec<usize>>,
    dedupe: HashSet<Edge>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a resolver from persisted edges, preserving their order.
    pub fn from_edges(edges: impl IntoIterator<Item = Edge>) -> Result<Self> {
        let mut resolver = Self::new();
        for edge in edges {
            resolver.add_reference(edge.owner, edge.kind, edge.target)?;
        }
        Ok(resolver)
    }

    /// Record one edge. Identical edges are rejected with `DuplicateEdge`.
    pub fn add_reference(
        &mut self,
        owner: EntityRef,
        kind: EdgeKind,
        target: EntityRef,
    ) -> Result<()> {
        kind.check(owner, target)?;
        let edge = Edge {
            owner,
            kind,
            target,
        };
        if !self.dedupe.insert(edge) {
            return Err(LineageError::DuplicateEdge {
                owner: owner.id,
                kind,
                target,
            });
        }
        self.by_owner
            .entry(owner.id)
            .or_default()
            .push(self.log.len());
        self.log.push(edge);
        Ok(())
    }

    /// Direct edges of `owner` in insertion order. Leaves yield an empty list.
    pub fn resolve(&self, owner: EntityId) -> Vec<Edge> {
        self.by_owner
            .get(&owner)
            .map(|idx| idx.iter().map(|&i| self.log[i]).collect())
            .unwrap_or_default()
    }

    pub fn resolve_kind(&self, owner: EntityId, kind: EdgeKind) -> Vec<Edge> {
        self.resolve(owner)
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Lazy breadth-first walk of everything that fed `owner`, up to `max_depth`
    /// hops (`None` walks to the leaves).
    pub fn resolve_transitive(
        &self,
        owner: EntityRef,
        max_depth: Option<usize>,
    ) -> Result<TransitiveLineage<'_>> {
        if let Some(path) = self.find_cycle(owner) {
            return Err(LineageError::CyclicLineage { path });
        }
        Ok(TransitiveLineage::new(self, owner, max_depth))
    }

    pub fn edge_count(&self) -> usize {
        self.log.len()
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.log
    }

    pub fn count_by_kind(&self) -> BTreeMap<EdgeKind, usize> {
        let mut counts = BTreeMap::new();
        for edge in &self.log {
            *counts.entry(edge.kind).or_insert(0) += 1;
        }
        counts
    }

    fn targets(&self, owner: EntityId) -> impl Iterator<Item = EntityRef> + '_ {
        self.by_owner
            .get(&owner)
            .into_iter()
            .flatten()
            .map(move |&i| self.log[i].target)
    }

    /// Iterative DFS over the subgraph reachable from `start`.
    /// Returns the cycle path (first node repeated at the end) if one exists.
    fn find_cycle(&self, start: EntityRef) -> Option<Vec<EntityRef>> {
        #[derive(Clone, Copy)]
        enum Mark {
            OnPath,
            Done,
        }

        let mut marks: HashMap<EntityId, Mark> = HashMap::new();
        let mut path: Vec<EntityRef> = vec![start];
        let mut stack: Vec<(EntityRef, Vec<EntityRef>)> =
            vec![(start, self.targets(start.id).collect())];
        marks.insert(start.id, Mark::OnPath);

        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            match pending.pop() {
                Some(next) => match marks.get(&next.id).copied() {
                    Some(Mark::OnPath) => {
                        let pos = path.iter().position(|r| r.id == next.id).unwrap_or(0);
                        let mut cycle = path[pos..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next.id, Mark::OnPath);
                        path.push(next);
                        let children: Vec<EntityRef> = self.targets(next.id).collect();
                        stack.push((next, children));
                    }
                },
                None => {
                    marks.insert(node.id, Mark::Done);
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }
}

// ── Transitive walk ───────────────────────────────────────────

/// One entity reached by a transitive walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageNode {
    pub entity: EntityRef,
    /// Hops from the walk's origin (direct sources are depth 1).
    pub depth: usize,
    /// Kind of the edge through which the entity was first reached.
    pub via: EdgeKind,
}

/// Lazy BFS iterator. Each entity is yielded once, at its shallowest depth.
pub struct TransitiveLineage<'a> {
    resolver: &'a ReferenceResolver,
    queue: VecDeque<(Edge, usize)>,
    seen: HashSet<EntityId>,
    max_depth: Option<usize>,
}

impl<'a> TransitiveLineage<'a> {
    fn new(resolver: &'a ReferenceResolver, origin: EntityRef, max_depth: Option<usize>) -> Self {
        let mut walk = Self {
            resolver,
            queue: VecDeque::new(),
            seen: HashSet::from([origin.id]),
            max_depth,
        };
        walk.enqueue(origin.id, 1);
        walk
    }

    fn enqueue(&mut self, owner: EntityId, depth: usize) {
        if self.max_depth.is_some_and(|max| depth > max) {
            return;
        }
        for edge in self.resolver.resolve(owner) {
            self.queue.push_back((edge, depth));
        }
    }
}

impl Iterator for TransitiveLineage<'_> {
    type Item = LineageNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((edge, depth)) = self.queue.pop_front() {
            if !self.seen.insert(edge.target.id) {
                continue;
            }
            self.enqueue(edge.target.id, depth + 1);
            return Some(LineageNode {
                entity: edge.target,
                depth,
                via: edge.kind,
            });
        }
        None
    }
}
