//! Trail-scoped store of materialized entities.
//!
//! Tables enter the arena whole: a [`StagedTable`] is assembled off to the
//! side and committed in one step, so a failed materialization leaves nothing
//! behind. Nothing in the arena is mutated after commit.

use std::collections::HashMap;

use crate::ids::EntityId;
use crate::model::{PopulatedTable, Row, Value};
use crate::reference::{Edge, EntityKind, EntityRef};

/// A fully built table awaiting commit.
#[derive(Debug, Clone)]
pub struct StagedTable {
    pub populated: PopulatedTable,
    /// Columns that received values, in declaration order. Columns omitted by
    /// the speculative skip policy are absent.
    pub columns: Vec<EntityId>,
    rows: Vec<Row>,
    values: Vec<Value>,
    pub edges: Vec<Edge>,
    /// Ids of staged rows and values, kept in step with `rows` and `values`.
    ids: HashMap<EntityId, EntityKind>,
}

impl StagedTable {
    pub fn new(populated: PopulatedTable) -> Self {
        Self {
            populated,
            columns: Vec::new(),
            rows: Vec::new(),
            values: Vec::new(),
            edges: Vec::new(),
            ids: HashMap::new(),
        }
    }

    pub fn push_row(&mut self, row: Row) {
        let r = row.entity_ref();
        self.ids.insert(r.id, r.kind);
        self.rows.push(row);
    }

    pub fn push_value(&mut self, value: Value) {
        let r = value.entity_ref();
        self.ids.insert(r.id, r.kind);
        self.values.push(value);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Whether `entity` is produced by this staged table. Constant time.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match entity.kind {
            EntityKind::PopulatedDatabaseTable | EntityKind::EvaluatedDerivedTable => {
                self.populated.entity_ref() == *entity
            }
            kind => self.ids.get(&entity.id) == Some(&kind),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityArena {
    populated: Vec<PopulatedTable>,
    rows: Vec<Row>,
    values: Vec<Value>,
    populated_index: HashMap<EntityId, usize>,
    populated_by_table: HashMap<EntityId, usize>,
    columns_by_populated: HashMap<EntityId, Vec<EntityId>>,
    row_index: HashMap<EntityId, usize>,
    rows_by_populated: HashMap<EntityId, Vec<usize>>,
    value_index: HashMap<EntityId, usize>,
    values_by_row: HashMap<EntityId, Vec<usize>>,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a staged table into the arena. Returns its edges for the resolver.
    pub fn commit(&mut self, staged: StagedTable) -> Vec<Edge> {
        let StagedTable {
            populated,
            columns,
            rows,
            values,
            edges,
            ..
        } = staged;

        let pid = populated.id;
        self.populated_index.insert(pid, self.populated.len());
        self.populated_by_table
            .insert(populated.table_id, self.populated.len());
        self.columns_by_populated.insert(pid, columns);
        self.populated.push(populated);

        let row_slots = self.rows_by_populated.entry(pid).or_default();
        for row in rows {
            self.row_index.insert(row.id, self.rows.len());
            row_slots.push(self.rows.len());
            self.rows.push(row);
        }
        for value in values {
            self.value_index.insert(value.id, self.values.len());
            self.values_by_row
                .entry(value.row_id)
                .or_default()
                .push(self.values.len());
            self.values.push(value);
        }
        edges
    }

    pub fn populated_for_table(&self, table_id: EntityId) -> Option<&PopulatedTable> {
        self.populated_by_table
            .get(&table_id)
            .map(|&i| &self.populated[i])
    }

    pub fn populated(&self, id: EntityId) -> Option<&PopulatedTable> {
        self.populated_index.get(&id).map(|&i| &self.populated[i])
    }

    pub fn populated_tables(&self) -> &[PopulatedTable] {
        &self.populated
    }

    /// Columns materialized for a populated table.
    pub fn columns_of(&self, populated_id: EntityId) -> &[EntityId] {
        self.columns_by_populated
            .get(&populated_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Rows of a populated table in row-number order.
    pub fn rows_of(&self, populated_id: EntityId) -> impl Iterator<Item = &Row> + '_ {
        self.rows_by_populated
            .get(&populated_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.rows[i])
    }

    pub fn row(&self, id: EntityId) -> Option<&Row> {
        self.row_index.get(&id).map(|&i| &self.rows[i])
    }

    pub fn value(&self, id: EntityId) -> Option<&Value> {
        self.value_index.get(&id).map(|&i| &self.values[i])
    }

    /// Values of a row in column order.
    pub fn values_of(&self, row_id: EntityId) -> impl Iterator<Item = &Value> + '_ {
        self.values_by_row
            .get(&row_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.values[i])
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Whether `entity` was materialized in this arena with the same variant.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match entity.kind {
            EntityKind::PopulatedDatabaseTable | EntityKind::EvaluatedDerivedTable => self
                .populated(entity.id)
                .is_some_and(|p| p.entity_ref() == *entity),
            EntityKind::DatabaseRow | EntityKind::DerivedTableRow => self
                .row(entity.id)
                .is_some_and(|r| r.entity_ref() == *entity),
            EntityKind::DatabaseColumnValue | EntityKind::EvaluatedFunction => self
                .value(entity.id)
                .is_some_and(|v| v.entity_ref() == *entity),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TrailId;
    use crate::model::{Column, Table};
    use crate::value::{DataType, Scalar};

    #[test]
    fn commit_indexes_everything() {
        let table = Table::database("loans");
        let amt = Column::field(&table, "amt", DataType::Integer).unwrap();
        let populated = PopulatedTable::new(TrailId::new(), &table);
        let mut staged = StagedTable::new(populated.clone());
        staged.columns.push(amt.id);
        for n in 0..2 {
            let row = Row::new(&populated, n);
            staged.push_value(Value::new(&populated, &row, &amt, Scalar::Int(n as i64)).unwrap());
            staged.push_row(row);
        }
        let first_row = staged.rows()[0].entity_ref();
        let first_value = staged.values()[0].entity_ref();
        assert!(staged.contains(&first_row));
        assert!(staged.contains(&first_value));
        assert!(!staged.contains(&EntityRef::new(EntityKind::DerivedTableRow, first_row.id)));
        assert!(!staged.contains(&EntityRef::new(EntityKind::DatabaseRow, EntityId::new())));

        let mut arena = EntityArena::new();
        let edges = arena.commit(staged);
        assert!(edges.is_empty());

        assert_eq!(arena.populated_for_table(table.id), Some(&populated));
        assert_eq!(arena.rows_of(populated.id).count(), 2);
        assert!(arena.contains(&first_row));
        let payloads: Vec<_> = arena
            .rows_of(populated.id)
            .flat_map(|r| arena.values_of(r.id))
            .map(|v| v.payload.clone())
            .collect();
        assert_eq!(payloads, vec![Scalar::Int(0), Scalar::Int(1)]);
        assert_eq!(arena.columns_of(populated.id), &[amt.id]);
    }

    #[test]
    fn contains_checks_variant() {
        let table = Table::database("loans");
        let populated = PopulatedTable::new(TrailId::new(), &table);
        let mut staged = StagedTable::new(populated.clone());
        let row = Row::new(&populated, 0);
        staged.push_row(row.clone());
        let mut arena = EntityArena::new();
        arena.commit(staged);

        assert!(!arena.contains(&EntityRef::new(EntityKind::DerivedTableRow, row.id)));
        assert!(!arena.contains(&EntityRef::new(EntityKind::DatabaseRow, EntityId::new())));
    }
}
