//! Raw source rows supplied by collaborators.
//!
//! A document is a JSON object keyed by table name, each entry an array of
//! column-name → value records. Values are coerced by field type when the
//! table is populated, not here.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};

pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceData {
    tables: BTreeMap<String, Vec<Record>>,
}

impl SourceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form: `SourceData::new().with_table("loans", vec![...])`.
    pub fn with_table(mut self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.insert(name, records);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, records: Vec<Record>) {
        self.tables.insert(name.into(), records);
    }

    /// Records for `table`. A table with no supplied records is empty, not an error.
    pub fn records(&self, table: &str) -> &[Record] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| LineageError::InvalidDefinition(format!("source data: {e}")))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| LineageError::InvalidDefinition(format!("source data: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading source data {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

/// Build a record from a `json!({...})` object. Non-objects yield an empty record.
pub fn record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Record::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_table_is_empty() {
        let data = SourceData::new().with_table("loans", vec![record(json!({"amt": 1}))]);
        assert_eq!(data.records("loans").len(), 1);
        assert!(data.records("other").is_empty());
    }

    #[test]
    fn parses_document() {
        let data = SourceData::from_json_str(r#"{"src": [{"a": 1}, {"a": 2}]}"#).unwrap();
        assert_eq!(data.records("src")[1]["a"], json!(2));
        assert_eq!(data.table_names().collect::<Vec<_>>(), vec!["src"]);
    }

    #[test]
    fn rejects_non_record_rows() {
        let err = SourceData::from_json_str(r#"{"src": [1, 2]}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_definition");
    }
}
