//! Transformation definitions as supplied by collaborators (YAML or JSON).
//!
//! These are plain data. `MetaDataTrail::compile` turns a `SchemaDefinition`
//! into the identified, immutable snapshot the engine evaluates against.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};
use crate::expr::{ColumnParam, Expr};
use crate::value::DataType;

/// Parse YAML where externally tagged enums are written as single-key maps
/// (`column: {...}`) rather than YAML tags (`!column {...}`).
pub(crate) fn from_yaml<T: DeserializeOwned>(s: &str) -> serde_yaml::Result<T> {
    serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(s))
}

fn default_language() -> String {
    "expr".to_string()
}

/// Root of a schema definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<DatabaseTableDef>,
    #[serde(default)]
    pub hierarchies: Vec<HierarchyDef>,
    #[serde(default)]
    pub derived_tables: Vec<DerivedTableDef>,
}

/// Physical source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseTableDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

/// Parent/child member hierarchy used by `MEMBER` tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyDef {
    pub name: String,
    pub edges: Vec<HierarchyEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub parent: String,
    pub child: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTableDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub creation: RowCreationApproach,
    pub columns: Vec<FunctionColumnDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionColumnDef {
    pub name: String,
    /// Human-readable source text, kept for audit.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    pub expr: Expr,
}

// ── Row creation ──────────────────────────────────────────────

/// Strategy producing a derived table's rows from its source tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "approach", rename_all = "snake_case")]
pub enum RowCreationApproach {
    /// Keep source rows whose predicate is true.
    Filter { source: String, predicate: Expr },
    /// One derived row per source row.
    Enrichment { source: String },
    /// Left-deep key-equality join of `base` with each step in order.
    Join { base: String, steps: Vec<JoinStep> },
    /// One derived row per distinct group-by key.
    Aggregate {
        source: String,
        group_by: Vec<ColumnParam>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinStep {
    pub table: String,
    /// Required: unmatched-row policy is never inferred.
    pub kind: JoinKind,
    pub on: Vec<JoinKey>,
}

/// `left` is a column of a table already in the join; `right` a column of the step table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinKey {
    pub left: ColumnParam,
    pub right: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

impl RowCreationApproach {
    /// Source tables in evaluation order.
    pub fn source_tables(&self) -> Vec<&str> {
        match self {
            Self::Filter { source, .. }
            | Self::Enrichment { source }
            | Self::Aggregate { source, .. } => vec![source.as_str()],
            Self::Join { base, steps } => std::iter::once(base.as_str())
                .chain(steps.iter().map(|s| s.table.as_str()))
                .collect(),
        }
    }

    /// Columns consulted by the approach itself (predicate, keys, grouping).
    pub fn source_columns(&self) -> Vec<ColumnParam> {
        match self {
            Self::Filter { predicate, .. } => {
                predicate.column_params().into_iter().cloned().collect()
            }
            Self::Enrichment { .. } => vec![],
            Self::Join { steps, .. } => steps
                .iter()
                .flat_map(|step| {
                    step.on.iter().flat_map(move |key| {
                        [
                            key.left.clone(),
                            ColumnParam::new(step.table.clone(), key.right.clone()),
                        ]
                    })
                })
                .collect(),
            Self::Aggregate { group_by, .. } => group_by.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Filter { .. } => "filter",
            Self::Enrichment { .. } => "enrichment",
            Self::Join { .. } => "join",
            Self::Aggregate { .. } => "aggregate",
        }
    }
}

impl SchemaDefinition {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        from_yaml(s)
            .map_err(|e| LineageError::InvalidDefinition(format!("schema definition: {e}")))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| LineageError::InvalidDefinition(format!("schema definition: {e}")))
    }

    /// Load by extension: `.json` is JSON, anything else YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema definition {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }
}
