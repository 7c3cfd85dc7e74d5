//! Entity model: one tagged-variant type per family.
//!
//! Shared fields live on the struct, variant-specific data on the `kind` tag.
//! Constructors are the only mutation point and enforce ownership and the
//! Database↔Database / Derived↔Derived pairing between families.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::RowCreationApproach;
use crate::error::{LineageError, Result};
use crate::expr::Expr;
use crate::ids::{EntityId, TrailId};
use crate::reference::{EntityKind, EntityRef};
use crate::value::{DataType, Scalar};

// ── Tables ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: EntityId,
    pub name: String,
    pub kind: TableKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum TableKind {
    DatabaseTable,
    DerivedTable { creation: TableCreationFunction },
}

/// The single row-creation definition owned by a derived table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCreationFunction {
    pub id: EntityId,
    pub approach: RowCreationApproach,
    /// At least one.
    pub source_tables: Vec<EntityRef>,
    /// Columns resolvable at compile time; unresolved ones surface during evaluation.
    pub source_columns: Vec<EntityRef>,
}

impl TableCreationFunction {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(EntityKind::TableCreationFunction, self.id)
    }
}

impl Table {
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            kind: TableKind::DatabaseTable,
        }
    }

    pub fn derived(name: impl Into<String>, creation: TableCreationFunction) -> Result<Self> {
        let name = name.into();
        if creation.source_tables.is_empty() {
            return Err(LineageError::InvariantViolation(format!(
                "derived table {name} has no source tables"
            )));
        }
        Ok(Self {
            id: EntityId::new(),
            name,
            kind: TableKind::DerivedTable { creation },
        })
    }

    /// Pin a pre-allocated id, used when definitions reference each other.
    pub(crate) fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, TableKind::DerivedTable { .. })
    }

    pub fn creation(&self) -> Option<&TableCreationFunction> {
        match &self.kind {
            TableKind::DerivedTable { creation } => Some(creation),
            TableKind::DatabaseTable => None,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        let kind = match self.kind {
            TableKind::DatabaseTable => EntityKind::DatabaseTable,
            TableKind::DerivedTable { .. } => EntityKind::DerivedTable,
        };
        EntityRef::new(kind, self.id)
    }
}

// ── Columns ───────────────────────────────────────────────────

/// Source code of a function column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionText {
    pub text: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: EntityId,
    pub name: String,
    pub table_id: EntityId,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum ColumnKind {
    DatabaseField {
        data_type: DataType,
    },
    Function {
        text: FunctionText,
        expr: Expr,
        /// Columns the expression reads, resolved at compile time.
        references: Vec<EntityRef>,
    },
}

impl Column {
    pub fn field(table: &Table, name: impl Into<String>, data_type: DataType) -> Result<Self> {
        let name = name.into();
        if table.is_derived() {
            return Err(LineageError::InvariantViolation(format!(
                "database field {name} cannot belong to derived table {}",
                table.name
            )));
        }
        Ok(Self {
            id: EntityId::new(),
            name,
            table_id: table.id,
            kind: ColumnKind::DatabaseField { data_type },
        })
    }

    pub fn function(
        table: &Table,
        name: impl Into<String>,
        text: FunctionText,
        expr: Expr,
        references: Vec<EntityRef>,
    ) -> Result<Self> {
        let name = name.into();
        if !table.is_derived() {
            return Err(LineageError::InvariantViolation(format!(
                "function {name} cannot belong to database table {}",
                table.name
            )));
        }
        Ok(Self {
            id: EntityId::new(),
            name,
            table_id: table.id,
            kind: ColumnKind::Function {
                text,
                expr,
                references,
            },
        })
    }

    pub(crate) fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, ColumnKind::Function { .. })
    }

    pub fn expr(&self) -> Option<&Expr> {
        match &self.kind {
            ColumnKind::Function { expr, .. } => Some(expr),
            ColumnKind::DatabaseField { .. } => None,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        let kind = match self.kind {
            ColumnKind::DatabaseField { .. } => EntityKind::DatabaseField,
            ColumnKind::Function { .. } => EntityKind::Function,
        };
        EntityRef::new(kind, self.id)
    }
}

// ── Populated tables ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulatedKind {
    PopulatedDatabaseTable,
    EvaluatedDerivedTable,
}

/// A table materialized inside one trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulatedTable {
    pub id: EntityId,
    pub trail_id: TrailId,
    pub table_id: EntityId,
    pub kind: PopulatedKind,
    pub created_at: DateTime<Utc>,
}

impl PopulatedTable {
    pub fn new(trail_id: TrailId, table: &Table) -> Self {
        let kind = if table.is_derived() {
            PopulatedKind::EvaluatedDerivedTable
        } else {
            PopulatedKind::PopulatedDatabaseTable
        };
        Self {
            id: EntityId::new(),
            trail_id,
            table_id: table.id,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        let kind = match self.kind {
            PopulatedKind::PopulatedDatabaseTable => EntityKind::PopulatedDatabaseTable,
            PopulatedKind::EvaluatedDerivedTable => EntityKind::EvaluatedDerivedTable,
        };
        EntityRef::new(kind, self.id)
    }
}

// ── Rows ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    DatabaseRow,
    DerivedTableRow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: EntityId,
    pub populated_table_id: EntityId,
    /// Position within the populated table, from zero.
    pub row_number: usize,
    pub kind: RowKind,
}

impl Row {
    pub fn new(populated: &PopulatedTable, row_number: usize) -> Self {
        let kind = match populated.kind {
            PopulatedKind::PopulatedDatabaseTable => RowKind::DatabaseRow,
            PopulatedKind::EvaluatedDerivedTable => RowKind::DerivedTableRow,
        };
        Self {
            id: EntityId::new(),
            populated_table_id: populated.id,
            row_number,
            kind,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        let kind = match self.kind {
            RowKind::DatabaseRow => EntityKind::DatabaseRow,
            RowKind::DerivedTableRow => EntityKind::DerivedTableRow,
        };
        EntityRef::new(kind, self.id)
    }
}

// ── Values ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    DatabaseColumnValue,
    EvaluatedFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: EntityId,
    pub row_id: EntityId,
    pub column_id: EntityId,
    pub payload: Scalar,
    pub kind: ValueKind,
}

impl Value {
    /// Build a cell of `row` in `column`. Both must belong to `populated`.
    pub fn new(
        populated: &PopulatedTable,
        row: &Row,
        column: &Column,
        payload: Scalar,
    ) -> Result<Self> {
        if row.populated_table_id != populated.id {
            return Err(LineageError::InvariantViolation(format!(
                "row {} does not belong to populated table {}",
                row.id, populated.id
            )));
        }
        if column.table_id != populated.table_id {
            return Err(LineageError::InvariantViolation(format!(
                "column {} does not belong to the table of populated table {}",
                column.name, populated.id
            )));
        }
        let kind = match (&column.kind, row.kind) {
            (ColumnKind::DatabaseField { data_type }, RowKind::DatabaseRow) => {
                if !payload.conforms_to(*data_type) {
                    return Err(LineageError::TypeMismatch(format!(
                        "{payload} is not a valid {data_type} for field {}",
                        column.name
                    )));
                }
                ValueKind::DatabaseColumnValue
            }
            (ColumnKind::Function { .. }, RowKind::DerivedTableRow) => ValueKind::EvaluatedFunction,
            _ => {
                return Err(LineageError::InvariantViolation(format!(
                    "column {} and row {} are from different table variants",
                    column.name, row.id
                )))
            }
        };
        Ok(Self {
            id: EntityId::new(),
            row_id: row.id,
            column_id: column.id,
            payload,
            kind,
        })
    }

    pub fn entity_ref(&self) -> EntityRef {
        let kind = match self.kind {
            ValueKind::DatabaseColumnValue => EntityKind::DatabaseColumnValue,
            ValueKind::EvaluatedFunction => EntityKind::EvaluatedFunction,
        };
        EntityRef::new(kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived_table() -> Table {
        Table::derived(
            "big_loans",
            TableCreationFunction {
                id: EntityId::new(),
                approach: RowCreationApproach::Enrichment {
                    source: "loans".into(),
                },
                source_tables: vec![EntityRef::new(EntityKind::DatabaseTable, EntityId::new())],
                source_columns: vec![],
            },
        )
        .unwrap()
    }

    fn text(s: &str) -> FunctionText {
        FunctionText {
            text: s.into(),
            language: "expr".into(),
        }
    }

    #[test]
    fn derived_table_requires_a_source() {
        let err = Table::derived(
            "orphan",
            TableCreationFunction {
                id: EntityId::new(),
                approach: RowCreationApproach::Enrichment {
                    source: "x".into(),
                },
                source_tables: vec![],
                source_columns: vec![],
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "invariant_violation");
    }

    #[test]
    fn variants_pair_up_through_construction() {
        let table = Table::database("loans");
        let field = Column::field(&table, "amt", DataType::Integer).unwrap();
        let populated = PopulatedTable::new(TrailId::new(), &table);
        let row = Row::new(&populated, 0);
        let value = Value::new(&populated, &row, &field, Scalar::Int(5)).unwrap();

        assert_eq!(populated.entity_ref().kind, EntityKind::PopulatedDatabaseTable);
        assert_eq!(row.entity_ref().kind, EntityKind::DatabaseRow);
        assert_eq!(value.entity_ref().kind, EntityKind::DatabaseColumnValue);
    }

    #[test]
    fn field_payload_must_match_declared_type() {
        let table = Table::database("loans");
        let field = Column::field(&table, "amt", DataType::Integer).unwrap();
        let populated = PopulatedTable::new(TrailId::new(), &table);
        let row = Row::new(&populated, 0);
        assert!(Value::new(&populated, &row, &field, Scalar::text("x")).is_err());
        assert!(Value::new(&populated, &row, &field, Scalar::Null).is_ok());
    }

    #[test]
    fn value_rejects_foreign_column() {
        let loans = Table::database("loans");
        let other = Table::database("other");
        let foreign = Column::field(&other, "amt", DataType::Integer).unwrap();
        let populated = PopulatedTable::new(TrailId::new(), &loans);
        let row = Row::new(&populated, 0);
        let err = Value::new(&populated, &row, &foreign, Scalar::Int(1)).unwrap_err();
        assert_eq!(err.code(), "invariant_violation");
    }

    #[test]
    fn function_only_on_derived_tables() {
        let db = Table::database("loans");
        assert!(Column::function(&db, "f", text("1"), Expr::int(1), vec![]).is_err());

        let derived = derived_table();
        let f = Column::function(&derived, "f", text("1"), Expr::int(1), vec![]).unwrap();
        assert_eq!(f.entity_ref().kind, EntityKind::Function);
        assert!(Column::field(&derived, "x", DataType::Text).is_err());
    }

    #[test]
    fn evaluated_function_lives_on_derived_row() {
        let derived = derived_table();
        let f = Column::function(&derived, "f", text("1"), Expr::int(1), vec![]).unwrap();
        let populated = PopulatedTable::new(TrailId::new(), &derived);
        let row = Row::new(&populated, 3);
        let v = Value::new(&populated, &row, &f, Scalar::Int(1)).unwrap();
        assert_eq!(row.kind, RowKind::DerivedTableRow);
        assert_eq!(v.kind, ValueKind::EvaluatedFunction);
    }
}
