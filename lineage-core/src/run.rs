//! Engine entry point and the per-trail execution handle.
//!
//! A [`LineageEngine`] holds one compiled snapshot and is cheap to share.
//! Each [`TrailRun`] exclusively owns its trail's state; runs on different
//! threads share nothing but the `Arc<MetaDataTrail>`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::arena::EntityArena;
use crate::builtins::BuiltinRegistry;
use crate::config::EngineConfig;
use crate::error::{LineageError, Result};
use crate::ids::{EntityId, TrailId};
use crate::lineage::{GraphNode, LineageGraph, LineageReport, TrailSummary};
use crate::orchestrator::{FailureRecord, Orchestrator};
use crate::reference::{EntityKind, EntityRef, ReferenceResolver};
use crate::repository::TrailSnapshot;
use crate::schema::MetaDataTrail;
use crate::source::SourceData;
use crate::trail::{Trail, TrailStatus};
use crate::view::{CellView, EntityView, RowView, TableView};

// ── Engine ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LineageEngine {
    schema: Arc<MetaDataTrail>,
    config: EngineConfig,
    builtins: Arc<BuiltinRegistry>,
}

impl LineageEngine {
    pub fn new(schema: Arc<MetaDataTrail>, config: EngineConfig) -> Self {
        Self {
            schema,
            config,
            builtins: Arc::new(BuiltinRegistry::standard()),
        }
    }

    pub fn with_builtins(mut self, builtins: BuiltinRegistry) -> Self {
        self.builtins = Arc::new(builtins);
        self
    }

    pub fn schema(&self) -> &Arc<MetaDataTrail> {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a new trail over `data`.
    pub fn start_trail(
        &self,
        name: impl Into<String>,
        context: BTreeMap<String, serde_json::Value>,
        data: SourceData,
    ) -> TrailRun {
        let trail = Trail::new(name, context, self.schema.id(), self.schema.fingerprint());
        info!(trail = %trail.id, name = %trail.name, schema = %self.schema.name(), "trail started");
        TrailRun {
            state: TrailState {
                trail,
                schema: self.schema.clone(),
                config: self.config.clone(),
                builtins: self.builtins.clone(),
                data,
                arena: EntityArena::new(),
                resolver: ReferenceResolver::new(),
            },
            orchestrator: Orchestrator::new(),
        }
    }
}

// ── Trail state ───────────────────────────────────────────────

/// Everything one trail owns. Mutated only through the orchestrator.
#[derive(Debug)]
pub struct TrailState {
    pub(crate) trail: Trail,
    pub(crate) schema: Arc<MetaDataTrail>,
    pub(crate) config: EngineConfig,
    pub(crate) builtins: Arc<BuiltinRegistry>,
    pub(crate) data: SourceData,
    pub(crate) arena: EntityArena,
    pub(crate) resolver: ReferenceResolver,
}

impl TrailState {
    /// Resolve an entity reference of any variant to the concrete entity,
    /// looking in the trail for materialized entities and in the snapshot
    /// for definitional ones.
    pub fn lookup(&self, entity: &EntityRef) -> Option<EntityView<'_>> {
        let view = match entity.kind {
            EntityKind::DatabaseTable | EntityKind::DerivedTable => {
                self.schema.table_by_id(entity.id).map(EntityView::Table)
            }
            EntityKind::TableCreationFunction => self
                .schema
                .table_creation(entity.id)
                .map(EntityView::TableCreationFunction),
            EntityKind::DatabaseField | EntityKind::Function => {
                self.schema.column_by_id(entity.id).map(EntityView::Column)
            }
            EntityKind::PopulatedDatabaseTable | EntityKind::EvaluatedDerivedTable => {
                self.arena.populated(entity.id).map(EntityView::PopulatedTable)
            }
            EntityKind::DatabaseRow | EntityKind::DerivedTableRow => {
                self.arena.row(entity.id).map(EntityView::Row)
            }
            EntityKind::DatabaseColumnValue | EntityKind::EvaluatedFunction => {
                self.arena.value(entity.id).map(EntityView::Value)
            }
        }?;
        (view.entity_ref() == *entity).then_some(view)
    }

    fn label(&self, entity: &EntityRef) -> String {
        match self.lookup(entity) {
            Some(EntityView::Table(t)) => t.name.clone(),
            Some(EntityView::TableCreationFunction(c)) => c.approach.name().to_string(),
            Some(EntityView::Column(c)) => self
                .schema
                .table_by_id(c.table_id)
                .map_or_else(|| c.name.clone(), |t| format!("{}.{}", t.name, c.name)),
            Some(EntityView::PopulatedTable(p)) => self.table_name(p.table_id),
            Some(EntityView::Row(r)) => {
                let table = self
                    .arena
                    .populated(r.populated_table_id)
                    .map(|p| self.table_name(p.table_id))
                    .unwrap_or_default();
                format!("{table}#{}", r.row_number)
            }
            Some(EntityView::Value(v)) => {
                let column = self
                    .schema
                    .column_by_id(v.column_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                format!("{column}={}", v.payload)
            }
            None => entity.to_string(),
        }
    }

    fn table_name(&self, table_id: EntityId) -> String {
        self.schema
            .table_by_id(table_id)
            .map(|t| t.name.clone())
            .unwrap_or_default()
    }
}

// ── Trail run ─────────────────────────────────────────────────

/// Result of driving a trail to one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailOutcome {
    pub trail_id: TrailId,
    pub target: String,
    pub status: TrailStatus,
    /// Every failed table of the trail, including independent ones.
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug)]
pub struct TrailRun {
    state: TrailState,
    orchestrator: Orchestrator,
}

impl TrailRun {
    pub fn trail(&self) -> &Trail {
        &self.state.trail
    }

    pub fn schema(&self) -> &MetaDataTrail {
        &self.state.schema
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.state.resolver
    }

    /// Initialize any definitional entity and its dependencies.
    pub fn init(&mut self, entity: EntityRef) -> Result<()> {
        self.orchestrator.init(&mut self.state, entity)
    }

    pub fn init_table(&mut self, name: &str) -> Result<()> {
        let target = self.state.schema.table(name)?.entity_ref();
        self.init(target)
    }

    pub fn is_initialized(&self, id: EntityId) -> bool {
        self.orchestrator.is_initialized(id)
    }

    pub fn skipped_inits(&self) -> usize {
        self.orchestrator.skipped_inits()
    }

    pub fn failures(&self) -> &[FailureRecord] {
        self.orchestrator.failures()
    }

    /// Discard everything this run materialized and continue under a fresh
    /// trail id. Lineage already handed out is never rewritten in place.
    pub fn reset(&mut self) {
        let old = self.state.trail.id;
        self.orchestrator.reset();
        self.state.arena = EntityArena::new();
        self.state.resolver = ReferenceResolver::new();
        self.state.trail = Trail::new(
            self.state.trail.name.clone(),
            self.state.trail.context.clone(),
            self.state.schema.id(),
            self.state.schema.fingerprint(),
        );
        info!(previous = %old, trail = %self.state.trail.id, "trail reset");
    }

    /// Initialize `name` and return its materialized view.
    pub fn materialize(&mut self, name: &str) -> Result<TableView> {
        self.init_table(name)?;
        self.table_view(name)
    }

    /// Drive the trail to `target` and settle its status. The trail is failed
    /// only when the target itself could not be materialized.
    pub fn execute(&mut self, target: &str) -> TrailOutcome {
        let status = match self.init_table(target) {
            Ok(()) => TrailStatus::Completed,
            Err(err) => {
                warn!(trail = %self.state.trail.id, target, error = %err, "trail target failed");
                TrailStatus::Failed
            }
        };
        self.state.trail.finish(status);
        info!(trail = %self.state.trail.id, target, status = %self.state.trail.status, "trail finished");
        TrailOutcome {
            trail_id: self.state.trail.id,
            target: target.to_string(),
            status: self.state.trail.status,
            failures: self.failures().to_vec(),
        }
    }

    pub fn lookup(&self, entity: &EntityRef) -> Option<EntityView<'_>> {
        self.state.lookup(entity)
    }

    /// Rows and values of a table materialized in this trail.
    pub fn table_view(&self, name: &str) -> Result<TableView> {
        let schema = &self.state.schema;
        let arena = &self.state.arena;
        let table = schema.table(name)?;
        let populated = arena.populated_for_table(table.id).ok_or_else(|| {
            LineageError::InvariantViolation(format!("table {name} is not materialized"))
        })?;
        let column_names: Vec<(EntityId, String)> = arena
            .columns_of(populated.id)
            .iter()
            .filter_map(|&id| schema.column_by_id(id).map(|c| (id, c.name.clone())))
            .collect();
        let rows = arena
            .rows_of(populated.id)
            .map(|row| RowView {
                row: row.entity_ref(),
                row_number: row.row_number,
                cells: arena
                    .values_of(row.id)
                    .filter_map(|v| {
                        let column = column_names.iter().find(|(id, _)| *id == v.column_id)?;
                        Some(CellView {
                            column: column.1.clone(),
                            value: v.entity_ref(),
                            payload: v.payload.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();
        Ok(TableView {
            table: table.name.clone(),
            populated: populated.entity_ref(),
            columns: column_names.into_iter().map(|(_, n)| n).collect(),
            rows,
        })
    }

    /// Direct and transitive sources of any entity in this trail, bounded by
    /// the configured `max_lineage_depth`.
    pub fn lineage(&self, entity: EntityRef) -> Result<LineageReport> {
        self.lineage_with_depth(entity, self.state.config.max_lineage_depth)
    }

    pub fn lineage_with_depth(
        &self,
        entity: EntityRef,
        max_depth: Option<usize>,
    ) -> Result<LineageReport> {
        if self.lookup(&entity).is_none() {
            return Err(LineageError::DanglingReference(entity));
        }
        let resolver = &self.state.resolver;
        let transitive: Vec<_> = resolver.resolve_transitive(entity, max_depth)?.collect();
        let leaves = transitive
            .iter()
            .map(|n| n.entity)
            .filter(|e| resolver.resolve(e.id).is_empty())
            .collect();
        Ok(LineageReport {
            entity,
            direct: resolver.resolve(entity.id),
            transitive,
            leaves,
            max_depth,
        })
    }

    /// Every edge of the trail plus a labelled node for each endpoint.
    pub fn lineage_graph(&self) -> LineageGraph {
        let edges = self.state.resolver.edges().to_vec();
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for e in &edges {
            for entity in [e.owner, e.target] {
                if seen.insert(entity) {
                    nodes.push(GraphNode {
                        entity,
                        label: self.state.label(&entity),
                    });
                }
            }
        }
        LineageGraph { nodes, edges }
    }

    pub fn summary(&self) -> TrailSummary {
        let arena = &self.state.arena;
        TrailSummary {
            trail_id: self.state.trail.id,
            status: self.state.trail.status,
            populated_tables: arena.populated_tables().len(),
            rows: arena.rows().len(),
            values: arena.values().len(),
            edges: self.state.resolver.count_by_kind(),
            skipped_inits: self.orchestrator.skipped_inits(),
            failures: self.failures().to_vec(),
        }
    }

    /// Close the run and hand over everything it produced for persistence.
    /// A still-running trail is marked completed.
    pub fn finish(mut self) -> TrailSnapshot {
        self.state.trail.finish(TrailStatus::Completed);
        let arena = self.state.arena;
        TrailSnapshot {
            trail: self.state.trail,
            populated_tables: arena.populated_tables().to_vec(),
            rows: arena.rows().to_vec(),
            values: arena.values().to_vec(),
            edges: self.state.resolver.edges().to_vec(),
            failures: self.orchestrator.failures().to_vec(),
        }
    }
}
