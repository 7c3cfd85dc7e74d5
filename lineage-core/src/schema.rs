//! Compiled, immutable schema snapshot shared by every trail that runs against it.
//!
//! ## Invariants
//!
//! - Table names are unique across database and derived tables; column names
//!   are unique within a table.
//! - Every derived table's source tables exist in the same snapshot. Source
//!   *columns* are resolved where possible; unresolved ones surface when the
//!   table is materialized.
//! - Hierarchies are acyclic.
//! - The fingerprint is SHA-256 over the canonical JSON of the definition, so
//!   two snapshots compiled from the same document share a fingerprint but
//!   never an id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::definition::{HierarchyDef, SchemaDefinition};
use crate::error::{LineageError, Result};
use crate::expr::ColumnParam;
use crate::ids::{EntityId, MetaDataTrailId};
use crate::model::{Column, FunctionText, Table, TableCreationFunction};
use crate::reference::{EntityKind, EntityRef};

// ── Hierarchies ───────────────────────────────────────────────

/// Parent/child member graph for `MEMBER` tests.
#[derive(Debug, Clone, Serialize)]
pub struct Hierarchy {
    pub name: String,
    parents: BTreeMap<String, Vec<String>>,
}

impl Hierarchy {
    fn compile(def: &HierarchyDef) -> Result<Self> {
        let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for edge in &def.edges {
            let entry = parents.entry(edge.child.clone()).or_default();
            if !entry.contains(&edge.parent) {
                entry.push(edge.parent.clone());
            }
        }
        let hierarchy = Self {
            name: def.name.clone(),
            parents,
        };
        if let Some(member) = hierarchy.find_cycle() {
            return Err(LineageError::InvalidDefinition(format!(
                "hierarchy {} has a cycle through member {member}",
                def.name
            )));
        }
        Ok(hierarchy)
    }

    /// True when `value` equals `ancestor` or sits anywhere below it.
    pub fn is_member(&self, value: &str, ancestor: &str) -> bool {
        if value == ancestor {
            return true;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![value];
        while let Some(node) = stack.pop() {
            for parent in self.parents.get(node).into_iter().flatten() {
                if parent == ancestor {
                    return true;
                }
                if seen.insert(parent.as_str()) {
                    stack.push(parent.as_str());
                }
            }
        }
        false
    }

    fn find_cycle(&self) -> Option<&str> {
        // 1 = on path, 2 = done
        let mut marks: HashMap<&str, u8> = HashMap::new();
        for start in self.parents.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), 1);
            while let Some((node, idx)) = stack.pop() {
                let ups = self.parents.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if idx == ups.len() {
                    marks.insert(node, 2);
                    continue;
                }
                stack.push((node, idx + 1));
                let next = ups[idx].as_str();
                match marks.get(next) {
                    Some(1) => return Some(next),
                    Some(_) => {}
                    None => {
                        marks.insert(next, 1);
                        stack.push((next, 0));
                    }
                }
            }
        }
        None
    }
}

// ── Snapshot ──────────────────────────────────────────────────

/// Identified schema snapshot. Shared read-only (`Arc`) across trails.
#[derive(Debug, Clone)]
pub struct MetaDataTrail {
    id: MetaDataTrailId,
    name: String,
    fingerprint: String,
    created_at: DateTime<Utc>,
    tables: Vec<Table>,
    columns: Vec<Column>,
    hierarchies: HashMap<String, Hierarchy>,
    table_by_name: HashMap<String, usize>,
    table_by_id: HashMap<EntityId, usize>,
    creation_by_id: HashMap<EntityId, usize>,
    column_by_id: HashMap<EntityId, usize>,
    columns_by_table: HashMap<EntityId, Vec<usize>>,
    definitional: HashMap<EntityId, EntityKind>,
}

impl MetaDataTrail {
    pub fn compile(def: &SchemaDefinition) -> Result<Self> {
        let canonical = serde_json::to_vec(def).map_err(anyhow::Error::from)?;
        let fingerprint = hex::encode(Sha256::digest(&canonical));

        // Pass 1: allocate every table and column id so definitions may
        // reference each other regardless of document order.
        let mut table_refs: HashMap<&str, EntityRef> = HashMap::new();
        for t in &def.tables {
            let r = EntityRef::new(EntityKind::DatabaseTable, EntityId::new());
            if table_refs.insert(t.name.as_str(), r).is_some() {
                return Err(duplicate_table(&t.name));
            }
        }
        for t in &def.derived_tables {
            let r = EntityRef::new(EntityKind::DerivedTable, EntityId::new());
            if table_refs.insert(t.name.as_str(), r).is_some() {
                return Err(duplicate_table(&t.name));
            }
        }

        let mut column_refs: HashMap<(String, String), EntityRef> = HashMap::new();
        let field_names = def.tables.iter().flat_map(|t| {
            t.fields
                .iter()
                .map(move |f| (t.name.as_str(), f.name.as_str(), EntityKind::DatabaseField))
        });
        let function_names = def.derived_tables.iter().flat_map(|t| {
            t.columns
                .iter()
                .map(move |c| (t.name.as_str(), c.name.as_str(), EntityKind::Function))
        });
        for (table, column, kind) in field_names.chain(function_names) {
            let r = EntityRef::new(kind, EntityId::new());
            if column_refs
                .insert((table.to_string(), column.to_string()), r)
                .is_some()
            {
                return Err(LineageError::InvalidDefinition(format!(
                    "duplicate column {table}.{column}"
                )));
            }
        }
        let resolve_column = |p: &ColumnParam| -> Option<EntityRef> {
            column_refs
                .get(&(p.table.clone(), p.column.clone()))
                .copied()
        };

        // Pass 2: build entities through their validating constructors.
        let mut tables = Vec::new();
        let mut columns = Vec::new();
        for t in &def.tables {
            let table = Table::database(&t.name).with_id(table_refs[t.name.as_str()].id);
            for f in &t.fields {
                let id = column_refs[&(t.name.clone(), f.name.clone())].id;
                columns.push(Column::field(&table, &f.name, f.data_type)?.with_id(id));
            }
            tables.push(table);
        }

        for t in &def.derived_tables {
            let mut source_tables = Vec::new();
            for source in t.creation.source_tables() {
                let r = table_refs.get(source).copied().ok_or_else(|| {
                    LineageError::InvalidDefinition(format!(
                        "derived table {} reads unknown table {source}",
                        t.name
                    ))
                })?;
                if !source_tables.contains(&r) {
                    source_tables.push(r);
                }
            }
            let mut source_columns = Vec::new();
            for r in t.creation.source_columns().iter().filter_map(resolve_column) {
                if !source_columns.contains(&r) {
                    source_columns.push(r);
                }
            }

            let creation = TableCreationFunction {
                id: EntityId::new(),
                approach: t.creation.clone(),
                source_tables,
                source_columns,
            };
            let table =
                Table::derived(&t.name, creation)?.with_id(table_refs[t.name.as_str()].id);

            for c in &t.columns {
                let id = column_refs[&(t.name.clone(), c.name.clone())].id;
                let references = c
                    .expr
                    .column_params()
                    .into_iter()
                    .filter_map(resolve_column)
                    .collect();
                let text = FunctionText {
                    text: c.text.clone().unwrap_or_else(|| c.name.clone()),
                    language: c.language.clone(),
                };
                columns.push(
                    Column::function(&table, &c.name, text, c.expr.clone(), references)?
                        .with_id(id),
                );
            }
            tables.push(table);
        }

        let mut hierarchies = HashMap::new();
        for h in &def.hierarchies {
            if hierarchies
                .insert(h.name.clone(), Hierarchy::compile(h)?)
                .is_some()
            {
                return Err(LineageError::InvalidDefinition(format!(
                    "duplicate hierarchy {}",
                    h.name
                )));
            }
        }

        let mut snapshot = Self {
            id: MetaDataTrailId::new(),
            name: def.name.clone(),
            fingerprint,
            created_at: Utc::now(),
            tables,
            columns,
            hierarchies,
            table_by_name: HashMap::new(),
            table_by_id: HashMap::new(),
            creation_by_id: HashMap::new(),
            column_by_id: HashMap::new(),
            columns_by_table: HashMap::new(),
            definitional: HashMap::new(),
        };
        snapshot.index();
        tracing::debug!(
            schema = %snapshot.name,
            fingerprint = %snapshot.fingerprint,
            tables = snapshot.tables.len(),
            columns = snapshot.columns.len(),
            "compiled schema snapshot"
        );
        Ok(snapshot)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Self::compile(&SchemaDefinition::from_yaml_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::compile(&SchemaDefinition::load(path)?)
    }

    fn index(&mut self) {
        for (i, t) in self.tables.iter().enumerate() {
            self.table_by_name.insert(t.name.clone(), i);
            self.table_by_id.insert(t.id, i);
            self.definitional.insert(t.id, t.entity_ref().kind);
            if let Some(creation) = t.creation() {
                self.creation_by_id.insert(creation.id, i);
                self.definitional
                    .insert(creation.id, EntityKind::TableCreationFunction);
            }
        }
        for (i, c) in self.columns.iter().enumerate() {
            self.column_by_id.insert(c.id, i);
            self.columns_by_table.entry(c.table_id).or_default().push(i);
            self.definitional.insert(c.id, c.entity_ref().kind);
        }
    }

    pub fn id(&self) -> MetaDataTrailId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.table_by_name
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| LineageError::UnknownTable(name.to_string()))
    }

    pub fn table_by_id(&self, id: EntityId) -> Option<&Table> {
        self.table_by_id.get(&id).map(|&i| &self.tables[i])
    }

    pub fn table_creation(&self, id: EntityId) -> Option<&TableCreationFunction> {
        self.creation_by_id
            .get(&id)
            .and_then(|&i| self.tables[i].creation())
    }

    /// Columns of a table in declaration order.
    pub fn columns_of(&self, table_id: EntityId) -> Vec<&Column> {
        self.columns_by_table
            .get(&table_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.columns[i])
            .collect()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&Column> {
        let t = self.table(table).ok()?;
        self.columns_of(t.id).into_iter().find(|c| c.name == column)
    }

    pub fn column_by_id(&self, id: EntityId) -> Option<&Column> {
        self.column_by_id.get(&id).map(|&i| &self.columns[i])
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    pub fn hierarchy(&self, name: &str) -> Result<&Hierarchy> {
        self.hierarchies
            .get(name)
            .ok_or_else(|| LineageError::UnknownHierarchy(name.to_string()))
    }

    /// Whether `entity` is a definitional entity of this snapshot.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.definitional.get(&entity.id) == Some(&entity.kind)
    }
}

fn duplicate_table(name: &str) -> LineageError {
    LineageError::InvalidDefinition(format!("duplicate table {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
name: finrep
tables:
  - name: loans
    fields:
      - { name: ccy, type: text }
      - { name: amt, type: integer }
hierarchies:
  - name: geo
    edges:
      - { parent: EU, child: IE }
      - { parent: IE, child: DUB }
derived_tables:
  - name: summary
    creation: { approach: enrichment, source: by_ccy }
    columns:
      - name: ccy
        expr: { column: { table: by_ccy, column: ccy } }
  - name: by_ccy
    creation:
      approach: aggregate
      source: loans
      group_by: [{ table: loans, column: ccy }]
    columns:
      - name: ccy
        expr: { column: { table: loans, column: ccy } }
"#;

    #[test]
    fn compiles_forward_references() {
        let snap = MetaDataTrail::from_yaml_str(DOC).unwrap();
        let summary = snap.table("summary").unwrap();
        let by_ccy = snap.table("by_ccy").unwrap();
        let creation = summary.creation().unwrap();
        assert_eq!(creation.source_tables, vec![by_ccy.entity_ref()]);

        let ccy = snap.column("summary", "ccy").unwrap();
        match &ccy.kind {
            crate::model::ColumnKind::Function { references, .. } => {
                assert_eq!(
                    references,
                    &vec![snap.column("by_ccy", "ccy").unwrap().entity_ref()]
                );
            }
            other => panic!("expected function column, got {other:?}"),
        }
        assert!(snap.contains(&creation.entity_ref()));
        assert!(snap.contains(&ccy.entity_ref()));
    }

    #[test]
    fn fingerprint_is_stable_per_document() {
        let a = MetaDataTrail::from_yaml_str(DOC).unwrap();
        let b = MetaDataTrail::from_yaml_str(DOC).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn unknown_source_table_is_rejected() {
        let doc = r#"
name: bad
derived_tables:
  - name: x
    creation: { approach: enrichment, source: nowhere }
    columns: []
"#;
        let err = MetaDataTrail::from_yaml_str(doc).unwrap_err();
        assert_eq!(err.code(), "invalid_definition");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let doc = r#"
name: bad
tables:
  - { name: t, fields: [{ name: a, type: text }, { name: a, type: text }] }
"#;
        assert!(MetaDataTrail::from_yaml_str(doc).is_err());
    }

    #[test]
    fn hierarchy_membership_is_transitive() {
        let snap = MetaDataTrail::from_yaml_str(DOC).unwrap();
        let geo = snap.hierarchy("geo").unwrap();
        assert!(geo.is_member("DUB", "EU"));
        assert!(geo.is_member("IE", "IE"));
        assert!(!geo.is_member("EU", "IE"));
        assert!(snap.hierarchy("nope").is_err());
    }

    #[test]
    fn cyclic_hierarchy_is_rejected() {
        let doc = r#"
name: bad
hierarchies:
  - name: h
    edges: [{ parent: a, child: b }, { parent: b, child: a }]
"#;
        let err = MetaDataTrail::from_yaml_str(doc).unwrap_err();
        assert_eq!(err.code(), "invalid_definition");
    }
}
