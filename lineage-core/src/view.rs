//! Read-only views over a trail's entities.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Column, PopulatedTable, Row, Table, TableCreationFunction, Value};
use crate::reference::EntityRef;
use crate::value::Scalar;

/// Concrete entity behind an [`EntityRef`], as returned by the trail's lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityView<'a> {
    Table(&'a Table),
    TableCreationFunction(&'a TableCreationFunction),
    Column(&'a Column),
    PopulatedTable(&'a PopulatedTable),
    Row(&'a Row),
    Value(&'a Value),
}

impl EntityView<'_> {
    pub fn entity_ref(&self) -> EntityRef {
        match self {
            Self::Table(t) => t.entity_ref(),
            Self::TableCreationFunction(c) => c.entity_ref(),
            Self::Column(c) => c.entity_ref(),
            Self::PopulatedTable(p) => p.entity_ref(),
            Self::Row(r) => r.entity_ref(),
            Self::Value(v) => v.entity_ref(),
        }
    }
}

/// One cell of a materialized table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellView {
    pub column: String,
    pub value: EntityRef,
    pub payload: Scalar,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowView {
    pub row: EntityRef,
    pub row_number: usize,
    pub cells: Vec<CellView>,
}

impl RowView {
    pub fn cell(&self, column: &str) -> Option<&CellView> {
        self.cells.iter().find(|c| c.column == column)
    }
}

/// A populated table: its rows and values by column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableView {
    pub table: String,
    pub populated: EntityRef,
    pub columns: Vec<String>,
    pub rows: Vec<RowView>,
}

impl TableView {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value_at(&self, row: usize, column: &str) -> Option<&CellView> {
        self.rows.get(row).and_then(|r| r.cell(column))
    }

    /// Payloads keyed by column name, one map per row.
    pub fn records(&self) -> Vec<BTreeMap<String, Scalar>> {
        self.rows
            .iter()
            .map(|r| {
                r.cells
                    .iter()
                    .map(|c| (c.column.clone(), c.payload.clone()))
                    .collect()
            })
            .collect()
    }

    /// Plain JSON result set: an array of column → value objects.
    pub fn to_json(&self) -> serde_json::Value {
        self.rows
            .iter()
            .map(|r| {
                r.cells
                    .iter()
                    .map(|c| (c.column.clone(), c.payload.to_json()))
                    .collect::<serde_json::Map<_, _>>()
                    .into()
            })
            .collect::<Vec<serde_json::Value>>()
            .into()
    }
}
