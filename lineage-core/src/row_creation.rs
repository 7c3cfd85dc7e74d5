//! Row-creation approaches: turn materialized source tables into derived row
//! frames, each knowing exactly which source rows it was built from.
//!
//! ## Invariants
//!
//! - Output order is deterministic: source order for filter and enrichment,
//!   base order then match order for joins, first-seen order for groups.
//! - Null join keys never match.
//! - Columns named by a predicate, join key or grouping are checked against
//!   their source table before any row is produced.

use std::collections::HashMap;

use crate::arena::EntityArena;
use crate::definition::{JoinKind, JoinStep, RowCreationApproach};
use crate::error::{LineageError, Result};
use crate::evaluator::FunctionEvaluator;
use crate::expr::{ColumnParam, Expr};
use crate::model::Table;
use crate::reference::EntityRef;
use crate::schema::MetaDataTrail;
use crate::value::Scalar;

// ── Bound source data ─────────────────────────────────────────

/// One materialized cell: the value entity and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub value: EntityRef,
    pub payload: Scalar,
}

#[derive(Debug, Clone)]
pub struct BoundRow {
    pub row: EntityRef,
    cells: HashMap<String, Cell>,
}

impl BoundRow {
    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }
}

/// A materialized table of the current trail, addressable by column name.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub name: String,
    columns: Vec<String>,
    pub rows: Vec<BoundRow>,
}

impl SourceTable {
    pub fn bind(schema: &MetaDataTrail, arena: &EntityArena, table: &Table) -> Result<Self> {
        let populated = arena.populated_for_table(table.id).ok_or_else(|| {
            LineageError::InvariantViolation(format!(
                "table {} read before it was materialized",
                table.name
            ))
        })?;
        let column_name = |id| {
            schema
                .column_by_id(id)
                .map(|c| c.name.clone())
                .ok_or_else(|| {
                    LineageError::InvariantViolation(format!("column {id} is not in the snapshot"))
                })
        };

        let columns = arena
            .columns_of(populated.id)
            .iter()
            .map(|&id| column_name(id))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = Vec::new();
        for row in arena.rows_of(populated.id) {
            let mut cells = HashMap::new();
            for value in arena.values_of(row.id) {
                cells.insert(
                    column_name(value.column_id)?,
                    Cell {
                        value: value.entity_ref(),
                        payload: value.payload.clone(),
                    },
                );
            }
            rows.push(BoundRow {
                row: row.entity_ref(),
                cells,
            });
        }
        Ok(Self {
            name: table.name.clone(),
            columns,
            rows,
        })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

// ── Scopes ────────────────────────────────────────────────────

/// Result of looking a column up in a row binding.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Cell(&'a Cell),
    /// The table's slot was null-extended by a left-outer join.
    NullExtended,
}

/// One source row per participating table. `None` marks a null-extended slot.
#[derive(Debug, Clone)]
pub struct RowBinding<'a> {
    slots: Vec<(&'a SourceTable, Option<&'a BoundRow>)>,
}

impl<'a> RowBinding<'a> {
    pub fn single(table: &'a SourceTable, row: &'a BoundRow) -> Self {
        Self {
            slots: vec![(table, Some(row))],
        }
    }

    fn extended(&self, table: &'a SourceTable, row: Option<&'a BoundRow>) -> Self {
        let mut slots = self.slots.clone();
        slots.push((table, row));
        Self { slots }
    }

    pub fn lookup(&self, table: &str, column: &str) -> Result<Lookup<'a>> {
        let unresolved = || LineageError::UnresolvedSourceColumn {
            table: table.to_string(),
            column: column.to_string(),
        };
        let (source, row) = *self
            .slots
            .iter()
            .find(|(t, _)| t.name == table)
            .ok_or_else(unresolved)?;
        if !source.has_column(column) {
            return Err(unresolved());
        }
        match row {
            None => Ok(Lookup::NullExtended),
            Some(r) => r.cell(column).map(Lookup::Cell).ok_or_else(unresolved),
        }
    }

    pub fn source_rows(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.slots.iter().filter_map(|(_, r)| r.map(|r| r.row))
    }
}

/// Evaluation scope of one derived row.
#[derive(Debug, Clone)]
pub enum Scope<'a> {
    Row(RowBinding<'a>),
    /// One group-by partition. `key[i]` is the value of `group_by[i]`.
    Group {
        key: Vec<Scalar>,
        group_by: &'a [ColumnParam],
        members: Vec<RowBinding<'a>>,
    },
}

impl<'a> Scope<'a> {
    /// Rows that make up the partition: one for row scope, all members for a group.
    pub fn partition(&self) -> &[RowBinding<'a>] {
        match self {
            Scope::Row(binding) => std::slice::from_ref(binding),
            Scope::Group { members, .. } => members,
        }
    }

    /// Contributing source rows without duplicates, in first-seen order.
    pub fn source_rows(&self) -> Vec<EntityRef> {
        let mut out: Vec<EntityRef> = Vec::new();
        for binding in self.partition() {
            for r in binding.source_rows() {
                if !out.contains(&r) {
                    out.push(r);
                }
            }
        }
        out
    }
}

/// A derived row awaiting column evaluation.
#[derive(Debug, Clone)]
pub struct RowFrame<'a> {
    pub scope: Scope<'a>,
    pub source_rows: Vec<EntityRef>,
}

impl<'a> RowFrame<'a> {
    fn new(scope: Scope<'a>) -> Self {
        let source_rows = scope.source_rows();
        Self { scope, source_rows }
    }
}

// ── Approaches ────────────────────────────────────────────────

/// Produce the row frames of a derived table. `sources` are in the
/// approach's source-table order.
pub fn create_rows<'a>(
    approach: &'a RowCreationApproach,
    sources: &'a [SourceTable],
    evaluator: &FunctionEvaluator<'_>,
) -> Result<Vec<RowFrame<'a>>> {
    validate_columns(approach, sources)?;
    match approach {
        RowCreationApproach::Filter { source, predicate } => {
            filter(find(sources, source)?, predicate, evaluator)
        }
        RowCreationApproach::Enrichment { source } => {
            let table = find(sources, source)?;
            Ok(table
                .rows
                .iter()
                .map(|row| RowFrame::new(Scope::Row(RowBinding::single(table, row))))
                .collect())
        }
        RowCreationApproach::Join { base, steps } => join(find(sources, base)?, steps, sources),
        RowCreationApproach::Aggregate { source, group_by } => {
            aggregate(find(sources, source)?, group_by)
        }
    }
}

fn find<'a>(sources: &'a [SourceTable], name: &str) -> Result<&'a SourceTable> {
    sources
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| LineageError::UnknownTable(name.to_string()))
}

fn validate_columns(approach: &RowCreationApproach, sources: &[SourceTable]) -> Result<()> {
    for param in approach.source_columns() {
        let known = sources
            .iter()
            .any(|s| s.name == param.table && s.has_column(&param.column));
        if !known {
            return Err(LineageError::UnresolvedSourceColumn {
                table: param.table,
                column: param.column,
            });
        }
    }
    Ok(())
}

fn filter<'a>(
    table: &'a SourceTable,
    predicate: &Expr,
    evaluator: &FunctionEvaluator<'_>,
) -> Result<Vec<RowFrame<'a>>> {
    let mut frames = Vec::new();
    for row in &table.rows {
        let scope = Scope::Row(RowBinding::single(table, row));
        if evaluator.evaluate(predicate, &scope)?.value.truthy()? {
            frames.push(RowFrame::new(scope));
        }
    }
    Ok(frames)
}

fn join<'a>(
    base: &'a SourceTable,
    steps: &'a [JoinStep],
    sources: &'a [SourceTable],
) -> Result<Vec<RowFrame<'a>>> {
    let mut joined: Vec<&str> = vec![base.name.as_str()];
    let mut bindings: Vec<RowBinding<'a>> = base
        .rows
        .iter()
        .map(|row| RowBinding::single(base, row))
        .collect();

    for step in steps {
        if joined.contains(&step.table.as_str()) {
            return Err(LineageError::InvalidDefinition(format!(
                "table {} appears twice in one join",
                step.table
            )));
        }
        for key in &step.on {
            if !joined.contains(&key.left.table.as_str()) {
                return Err(LineageError::UnresolvedSourceColumn {
                    table: key.left.table.clone(),
                    column: key.left.column.clone(),
                });
            }
        }
        let right = find(sources, &step.table)?;

        // Hash the step table by key tuple; rows with a null key are never indexed.
        let mut index: HashMap<Vec<Scalar>, Vec<&'a BoundRow>> = HashMap::new();
        for row in &right.rows {
            let key: Option<Vec<Scalar>> = step
                .on
                .iter()
                .map(|k| row.cell(&k.right).map(|c| c.payload.clone()))
                .collect::<Option<_>>();
            if let Some(key) = key.filter(|k| !k.iter().any(Scalar::is_null)) {
                index.entry(key).or_default().push(row);
            }
        }

        let mut next = Vec::new();
        for binding in &bindings {
            let mut key = Vec::with_capacity(step.on.len());
            for k in &step.on {
                key.push(match binding.lookup(&k.left.table, &k.left.column)? {
                    Lookup::Cell(c) => c.payload.clone(),
                    Lookup::NullExtended => Scalar::Null,
                });
            }
            let matches = if key.iter().any(Scalar::is_null) {
                None
            } else {
                index.get(&key)
            };
            match (matches, step.kind) {
                (Some(rows), _) => {
                    next.extend(rows.iter().map(|r| binding.extended(right, Some(*r))));
                }
                (None, JoinKind::LeftOuter) => next.push(binding.extended(right, None)),
                (None, JoinKind::Inner) => {}
            }
        }
        bindings = next;
        joined.push(step.table.as_str());
    }

    Ok(bindings
        .into_iter()
        .map(|b| RowFrame::new(Scope::Row(b)))
        .collect())
}

fn aggregate<'a>(
    table: &'a SourceTable,
    group_by: &'a [ColumnParam],
) -> Result<Vec<RowFrame<'a>>> {
    let mut order: Vec<(Vec<Scalar>, Vec<RowBinding<'a>>)> = Vec::new();
    let mut slot: HashMap<Vec<Scalar>, usize> = HashMap::new();

    for row in &table.rows {
        let binding = RowBinding::single(table, row);
        let mut key = Vec::with_capacity(group_by.len());
        for param in group_by {
            key.push(match binding.lookup(&param.table, &param.column)? {
                Lookup::Cell(c) => c.payload.clone(),
                Lookup::NullExtended => Scalar::Null,
            });
        }
        match slot.get(&key) {
            Some(&i) => order[i].1.push(binding),
            None => {
                slot.insert(key.clone(), order.len());
                order.push((key, vec![binding]));
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|(key, members)| {
            RowFrame::new(Scope::Group {
                key,
                group_by,
                members,
            })
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builtins::BuiltinRegistry;
    use crate::definition::JoinKey;
    use crate::expr::BinaryOp;
    use crate::ids::EntityId;
    use crate::reference::EntityKind;

    /// Hand-built source table for approach tests.
    pub(crate) fn source(name: &str, columns: &[&str], rows: Vec<Vec<Scalar>>) -> SourceTable {
        let rows = rows
            .into_iter()
            .map(|payloads| BoundRow {
                row: EntityRef::new(EntityKind::DatabaseRow, EntityId::new()),
                cells: columns
                    .iter()
                    .zip(payloads)
                    .map(|(c, payload)| {
                        (
                            c.to_string(),
                            Cell {
                                value: EntityRef::new(
                                    EntityKind::DatabaseColumnValue,
                                    EntityId::new(),
                                ),
                                payload,
                            },
                        )
                    })
                    .collect(),
            })
            .collect();
        SourceTable {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    fn empty_schema() -> MetaDataTrail {
        MetaDataTrail::from_yaml_str("name: empty").unwrap()
    }

    #[test]
    fn filter_keeps_true_rows_in_order() {
        let src = source(
            "src",
            &["a"],
            vec![vec![Scalar::Int(1)], vec![Scalar::Int(2)], vec![Scalar::Int(3)]],
        );
        let sources = vec![src];
        let approach = RowCreationApproach::Filter {
            source: "src".into(),
            predicate: Expr::binary(BinaryOp::Gt, Expr::col("src", "a"), Expr::int(1)),
        };
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);

        let frames = create_rows(&approach, &sources, &evaluator).unwrap();
        let kept: Vec<_> = frames.iter().map(|f| f.source_rows.clone()).collect();
        assert_eq!(
            kept,
            vec![vec![sources[0].rows[1].row], vec![sources[0].rows[2].row]]
        );
    }

    #[test]
    fn null_predicate_drops_row() {
        let sources = vec![source("src", &["a"], vec![vec![Scalar::Null]])];
        let approach = RowCreationApproach::Filter {
            source: "src".into(),
            predicate: Expr::binary(BinaryOp::Gt, Expr::col("src", "a"), Expr::int(1)),
        };
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);
        assert!(create_rows(&approach, &sources, &evaluator).unwrap().is_empty());
    }

    #[test]
    fn predicate_on_missing_column_is_rejected_up_front() {
        // Empty table: no row would ever evaluate the predicate.
        let sources = vec![source("src", &["a"], vec![])];
        let approach = RowCreationApproach::Filter {
            source: "src".into(),
            predicate: Expr::binary(BinaryOp::Gt, Expr::col("src", "b"), Expr::int(1)),
        };
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);
        let err = create_rows(&approach, &sources, &evaluator).unwrap_err();
        assert!(matches!(
            err,
            LineageError::UnresolvedSourceColumn { ref column, .. } if column == "b"
        ));
    }

    fn join_approach(kind: JoinKind) -> RowCreationApproach {
        RowCreationApproach::Join {
            base: "loans".into(),
            steps: vec![JoinStep {
                table: "rates".into(),
                kind,
                on: vec![JoinKey {
                    left: ColumnParam::new("loans", "ccy"),
                    right: "ccy".into(),
                }],
            }],
        }
    }

    fn join_sources() -> Vec<SourceTable> {
        vec![
            source(
                "loans",
                &["ccy"],
                vec![
                    vec![Scalar::text("USD")],
                    vec![Scalar::text("GBP")],
                    vec![Scalar::Null],
                ],
            ),
            source(
                "rates",
                &["ccy", "rate"],
                vec![
                    vec![Scalar::text("USD"), Scalar::Int(1)],
                    vec![Scalar::Null, Scalar::Int(9)],
                    vec![Scalar::text("USD"), Scalar::Int(2)],
                ],
            ),
        ]
    }

    #[test]
    fn inner_join_drops_unmatched_and_null_keys() {
        let sources = join_sources();
        let approach = join_approach(JoinKind::Inner);
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);
        let frames = create_rows(&approach, &sources, &evaluator).unwrap();

        let usd = sources[0].rows[0].row;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].source_rows, vec![usd, sources[1].rows[0].row]);
        assert_eq!(frames[1].source_rows, vec![usd, sources[1].rows[2].row]);
    }

    #[test]
    fn left_outer_join_null_extends() {
        let sources = join_sources();
        let approach = join_approach(JoinKind::LeftOuter);
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);
        let frames = create_rows(&approach, &sources, &evaluator).unwrap();

        // USD matches twice; GBP and the null key are extended.
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2].source_rows, vec![sources[0].rows[1].row]);
        match &frames[3].scope {
            Scope::Row(b) => assert!(matches!(
                b.lookup("rates", "rate").unwrap(),
                Lookup::NullExtended
            )),
            other => panic!("expected row scope, got {other:?}"),
        }
    }

    #[test]
    fn group_by_first_seen_order() {
        let sources = vec![source(
            "loans",
            &["ccy", "amt"],
            vec![
                vec![Scalar::text("USD"), Scalar::Int(10)],
                vec![Scalar::text("EUR"), Scalar::Int(7)],
                vec![Scalar::text("USD"), Scalar::Int(5)],
            ],
        )];
        let approach = RowCreationApproach::Aggregate {
            source: "loans".into(),
            group_by: vec![ColumnParam::new("loans", "ccy")],
        };
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);
        let frames = create_rows(&approach, &sources, &evaluator).unwrap();

        let rows = &sources[0].rows;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].source_rows, vec![rows[0].row, rows[2].row]);
        assert_eq!(frames[1].source_rows, vec![rows[1].row]);
        match &frames[0].scope {
            Scope::Group { key, members, .. } => {
                assert_eq!(key, &vec![Scalar::text("USD")]);
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected group scope, got {other:?}"),
        }
    }

    #[test]
    fn empty_source_yields_no_rows() {
        let sources = vec![source("loans", &["ccy"], vec![])];
        let approach = RowCreationApproach::Aggregate {
            source: "loans".into(),
            group_by: vec![ColumnParam::new("loans", "ccy")],
        };
        let schema = empty_schema();
        let builtins = BuiltinRegistry::standard();
        let evaluator = FunctionEvaluator::new(&schema, &builtins);
        assert!(create_rows(&approach, &sources, &evaluator).unwrap().is_empty());
    }
}
