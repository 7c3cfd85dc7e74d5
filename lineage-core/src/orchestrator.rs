//! Trail-scoped, at-most-once initialization across the derivation graph.
//!
//! `init` walks source tables depth-first before materializing a derived
//! table. A table is built into a [`StagedTable`] and committed only when every
//! row, value and edge of it is valid, so a failure leaves the trail exactly as
//! it was. Failed entities are remembered and not re-attempted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arena::StagedTable;
use crate::config::SpeculativePolicy;
use crate::definition::RowCreationApproach;
use crate::error::{LineageError, Result};
use crate::evaluator::FunctionEvaluator;
use crate::expr::{Expr, SpeculativeParam};
use crate::ids::EntityId;
use crate::model::{Column, ColumnKind, PopulatedTable, Row, Table, TableCreationFunction, Value};
use crate::reference::{Edge, EdgeKind, EntityKind, EntityRef};
use crate::row_creation::{create_rows, SourceTable};
use crate::run::TrailState;
use crate::schema::MetaDataTrail;
use crate::value::Scalar;

/// A derived or database table whose initialization failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub entity: EntityRef,
    pub table: String,
    pub code: String,
    pub message: String,
}

/// How a function column is filled for this trail.
enum ColumnPlan<'s> {
    Evaluate(&'s Column),
    Default(&'s Column, Scalar),
}

#[derive(Debug, Default)]
pub struct Orchestrator {
    initialized: HashSet<EntityId>,
    in_progress: Vec<EntityRef>,
    failed: HashMap<EntityId, String>,
    failures: Vec<FailureRecord>,
    skipped: usize,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self, id: EntityId) -> bool {
        self.initialized.contains(&id)
    }

    /// Number of `init` calls that found their entity already initialized.
    pub fn skipped_inits(&self) -> usize {
        self.skipped
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Forget every initialization and failure. The caller owns discarding
    /// whatever the trail already materialized.
    pub fn reset(&mut self) {
        self.initialized.clear();
        self.in_progress.clear();
        self.failed.clear();
        self.failures.clear();
        self.skipped = 0;
    }

    /// Initialize `target` and everything it depends on.
    ///
    /// Tables, table creation functions and columns resolve to their owning
    /// table. Trail entities are already materialized by construction.
    pub fn init(&mut self, state: &mut TrailState, target: EntityRef) -> Result<()> {
        if self.initialized.contains(&target.id) {
            self.skipped += 1;
            debug!(entity = %target, "already initialized, skipping");
            return Ok(());
        }

        let schema = state.schema.clone();
        let table = match target.kind {
            EntityKind::DatabaseTable | EntityKind::DerivedTable => schema
                .table_by_id(target.id)
                .filter(|t| t.entity_ref() == target),
            EntityKind::DatabaseField | EntityKind::Function => schema
                .column_by_id(target.id)
                .filter(|c| c.entity_ref() == target)
                .and_then(|c| schema.table_by_id(c.table_id)),
            EntityKind::TableCreationFunction => schema
                .tables()
                .iter()
                .find(|t| t.creation().is_some_and(|c| c.id == target.id)),
            _ => {
                return if state.arena.contains(&target) {
                    Ok(())
                } else {
                    Err(LineageError::DanglingReference(target))
                };
            }
        };
        let table = table.ok_or(LineageError::DanglingReference(target))?;
        self.init_table(state, table)?;

        if !self.initialized.contains(&target.id) {
            // A column omitted by the speculative skip policy.
            debug!(entity = %target, table = %table.name, "column not materialized in this trail");
        }
        Ok(())
    }

    fn init_table(&mut self, state: &mut TrailState, table: &Table) -> Result<()> {
        let target = table.entity_ref();
        if self.initialized.contains(&table.id) {
            self.skipped += 1;
            debug!(table = %table.name, "already initialized, skipping");
            return Ok(());
        }
        if let Some(reason) = self.failed.get(&table.id) {
            return Err(LineageError::DependencyFailed(format!("{}: {reason}", table.name)));
        }
        if let Some(pos) = self.in_progress.iter().position(|r| *r == target) {
            let mut path = self.in_progress[pos..].to_vec();
            path.push(target);
            return Err(LineageError::CyclicLineage { path });
        }

        self.in_progress.push(target);
        let staged = self.build(state, table);
        self.in_progress.pop();

        let committed = staged.and_then(|staged| commit(state, staged));
        match committed {
            Ok(columns) => {
                self.initialized.insert(table.id);
                if let Some(creation) = table.creation() {
                    self.initialized.insert(creation.id);
                }
                self.initialized.extend(columns);
                Ok(())
            }
            Err(err) => {
                warn!(table = %table.name, code = err.code(), error = %err, "table initialization failed");
                self.failed.insert(table.id, err.to_string());
                self.failures.push(FailureRecord {
                    entity: target,
                    table: table.name.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn build(&mut self, state: &mut TrailState, table: &Table) -> Result<StagedTable> {
        match table.creation() {
            None => populate_database_table(state, table),
            Some(creation) => {
                let schema = state.schema.clone();
                for source in &creation.source_tables {
                    let source_table = schema
                        .table_by_id(source.id)
                        .ok_or(LineageError::DanglingReference(*source))?;
                    self.init_table(state, source_table)?;
                }
                materialize_derived_table(state, table, creation)
            }
        }
    }
}

// ── Database tables ───────────────────────────────────────────

fn populate_database_table(state: &TrailState, table: &Table) -> Result<StagedTable> {
    let populated = PopulatedTable::new(state.trail.id, table);
    let columns = state.schema.columns_of(table.id);
    let records = state.data.records(&table.name);
    if records.is_empty() {
        debug!(table = %table.name, "no source records supplied");
    }

    let mut staged = StagedTable::new(populated);
    staged.columns = columns.iter().map(|c| c.id).collect();
    for (n, record) in records.iter().enumerate() {
        if state.config.strict_source_columns {
            if let Some(unknown) = record.keys().find(|k| !columns.iter().any(|c| &c.name == *k)) {
                return Err(LineageError::UnresolvedSourceColumn {
                    table: table.name.clone(),
                    column: unknown.clone(),
                });
            }
        }
        let row = Row::new(&staged.populated, n);
        for column in &columns {
            let ColumnKind::DatabaseField { data_type } = column.kind else {
                return Err(LineageError::InvariantViolation(format!(
                    "database table {} owns function {}",
                    table.name, column.name
                )));
            };
            let raw = record.get(&column.name).unwrap_or(&serde_json::Value::Null);
            let payload = Scalar::coerce_json(raw, data_type).map_err(|e| match e {
                LineageError::TypeMismatch(msg) => {
                    LineageError::TypeMismatch(format!("{}.{} row {n}: {msg}", table.name, column.name))
                }
                other => other,
            })?;
            let value = Value::new(&staged.populated, &row, column, payload)?;
            staged.push_value(value);
        }
        staged.push_row(row);
    }
    info!(table = %table.name, rows = staged.rows().len(), "populated database table");
    Ok(staged)
}

// ── Derived tables ────────────────────────────────────────────

#[tracing::instrument(skip_all, fields(table = %table.name, approach = creation.approach.name()))]
fn materialize_derived_table(
    state: &TrailState,
    table: &Table,
    creation: &TableCreationFunction,
) -> Result<StagedTable> {
    let schema = &*state.schema;
    let sources = creation
        .approach
        .source_tables()
        .into_iter()
        .map(|name| SourceTable::bind(schema, &state.arena, schema.table(name)?))
        .collect::<Result<Vec<_>>>()?;

    // Predicates decide row membership, so no policy can stand in for them.
    if let RowCreationApproach::Filter { predicate, .. } = &creation.approach {
        if let Some(missing) = unresolved_speculative(predicate, schema, &sources)? {
            return Err(LineageError::UnresolvedSpeculativeReference {
                cube: missing.cube.clone(),
                column: missing.column.clone(),
            });
        }
    }

    let columns = schema.columns_of(table.id);
    let plan = plan_columns(
        schema,
        &columns,
        &sources,
        &state.config.speculative_policy,
        &table.name,
    )?;

    let evaluator = FunctionEvaluator::new(schema, &state.builtins);
    let frames = create_rows(&creation.approach, &sources, &evaluator)?;

    let mut staged = StagedTable::new(PopulatedTable::new(state.trail.id, table));
    staged.columns = plan
        .iter()
        .map(|p| match p {
            ColumnPlan::Evaluate(c) | ColumnPlan::Default(c, _) => c.id,
        })
        .collect();

    if state.config.record_definition_edges {
        definition_edges(&mut staged.edges, creation, &plan);
    }

    for (n, frame) in frames.iter().enumerate() {
        let row = Row::new(&staged.populated, n);
        for source in &frame.source_rows {
            staged.edges.push(Edge {
                owner: row.entity_ref(),
                kind: EdgeKind::DerivedRowSourceReference,
                target: *source,
            });
        }

        for p in &plan {
            let value = match p {
                ColumnPlan::Default(column, literal) => {
                    Value::new(&staged.populated, &row, column, literal.clone())?
                }
                ColumnPlan::Evaluate(column) => {
                    let Some(expr) = column.expr() else {
                        continue;
                    };
                    let out = evaluator.evaluate(expr, &frame.scope)?;
                    let parameters = expr.parameter_count();
                    if parameters > 0 && out.sources.is_empty() && !out.null_extended {
                        return Err(LineageError::IncompleteLineage { parameters });
                    }
                    let value = Value::new(&staged.populated, &row, column, out.value)?;
                    for source in out.sources {
                        staged.edges.push(Edge {
                            owner: value.entity_ref(),
                            kind: EdgeKind::EvaluatedFunctionSourceValue,
                            target: source,
                        });
                    }
                    value
                }
            };
            staged.push_value(value);
        }
        staged.push_row(row);
    }

    info!(rows = staged.rows().len(), edges = staged.edges.len(), "materialized derived table");
    Ok(staged)
}

/// Decide per function column whether it is evaluated, defaulted or omitted.
///
/// Plain column parameters must name a source table column. Speculative
/// parameters missing from the snapshot fall to `policy`, once per column.
fn plan_columns<'s>(
    schema: &MetaDataTrail,
    columns: &[&'s Column],
    sources: &[SourceTable],
    policy: &SpeculativePolicy,
    table: &str,
) -> Result<Vec<ColumnPlan<'s>>> {
    let mut plan = Vec::with_capacity(columns.len());
    for &column in columns {
        let Some(expr) = column.expr() else {
            return Err(LineageError::InvariantViolation(format!(
                "derived table {table} owns database field {}",
                column.name
            )));
        };
        for param in expr.column_params() {
            let known = sources
                .iter()
                .any(|s| s.name == param.table && s.has_column(&param.column));
            if !known {
                return Err(LineageError::UnresolvedSourceColumn {
                    table: param.table.clone(),
                    column: param.column.clone(),
                });
            }
        }

        let Some(missing) = unresolved_speculative(expr, schema, sources)? else {
            plan.push(ColumnPlan::Evaluate(column));
            continue;
        };
        match policy {
            SpeculativePolicy::Abort => {
                return Err(LineageError::UnresolvedSpeculativeReference {
                    cube: missing.cube.clone(),
                    column: missing.column.clone(),
                });
            }
            SpeculativePolicy::Skip => {
                warn!(
                    table,
                    column = %column.name,
                    cube = %missing.cube,
                    missing = %missing.column,
                    "speculative reference unresolved, omitting column"
                );
            }
            SpeculativePolicy::Default(literal) => {
                warn!(
                    table,
                    column = %column.name,
                    cube = %missing.cube,
                    missing = %missing.column,
                    default = %literal,
                    "speculative reference unresolved, substituting default"
                );
                plan.push(ColumnPlan::Default(column, literal.clone()));
            }
        }
    }
    Ok(plan)
}

/// First speculative parameter of `expr` the snapshot does not declare.
///
/// This is the same test the evaluator applies. A parameter the snapshot does
/// declare is an ordinary column read and must be readable from `sources`.
fn unresolved_speculative<'e>(
    expr: &'e Expr,
    schema: &MetaDataTrail,
    sources: &[SourceTable],
) -> Result<Option<&'e SpeculativeParam>> {
    let mut missing = None;
    for p in expr.speculative_params() {
        if !schema.has_column(&p.cube, &p.column) {
            missing.get_or_insert(p);
        } else if !sources
            .iter()
            .any(|s| s.name == p.cube && s.has_column(&p.column))
        {
            return Err(LineageError::UnresolvedSourceColumn {
                table: p.cube.clone(),
                column: p.column.clone(),
            });
        }
    }
    Ok(missing)
}

fn definition_edges(edges: &mut Vec<Edge>, creation: &TableCreationFunction, plan: &[ColumnPlan<'_>]) {
    let owner = creation.entity_ref();
    for target in &creation.source_tables {
        edges.push(Edge {
            owner,
            kind: EdgeKind::TableCreationSourceTable,
            target: *target,
        });
    }
    for target in &creation.source_columns {
        edges.push(Edge {
            owner,
            kind: EdgeKind::TableCreationFunctionColumn,
            target: *target,
        });
    }
    for p in plan {
        let ColumnPlan::Evaluate(column) = p else {
            continue;
        };
        if let ColumnKind::Function { references, .. } = &column.kind {
            for target in references {
                edges.push(Edge {
                    owner: column.entity_ref(),
                    kind: EdgeKind::FunctionColumnReference,
                    target: *target,
                });
            }
        }
    }
}

// ── Commit ────────────────────────────────────────────────────

/// Validate every staged edge, then move the table and its edges into the
/// trail. Returns the ids of the columns that were materialized.
fn commit(state: &mut TrailState, staged: StagedTable) -> Result<Vec<EntityId>> {
    for edge in &staged.edges {
        edge.kind.check(edge.owner, edge.target)?;
        for end in [edge.owner, edge.target] {
            let known = if end.kind.is_definitional() {
                state.schema.contains(&end)
            } else {
                staged.contains(&end) || state.arena.contains(&end)
            };
            if !known {
                return Err(LineageError::DanglingReference(end));
            }
        }
    }

    let columns = staged.columns.clone();
    for edge in state.arena.commit(staged) {
        match state.resolver.add_reference(edge.owner, edge.kind, edge.target) {
            Ok(()) => {}
            Err(LineageError::DuplicateEdge { .. }) => {
                debug!(owner = %edge.owner, kind = %edge.kind, target = %edge.target, "duplicate edge ignored");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(columns)
}
