//! Engine error taxonomy.

use thiserror::Error;

use crate::ids::EntityId;
use crate::reference::{EdgeKind, EntityRef};

pub type Result<T> = std::result::Result<T, LineageError>;

#[derive(Debug, Error)]
pub enum LineageError {
    /// A predicate, key or function references a column the source table does not have.
    #[error("unresolved source column {table}.{column}")]
    UnresolvedSourceColumn { table: String, column: String },

    /// A speculative (cube, column) parameter is not in the schema snapshot yet.
    #[error("unresolved speculative reference {cube}.{column}")]
    UnresolvedSpeculativeReference { cube: String, column: String },

    /// The lineage graph (or a derivation dependency graph) contains a cycle.
    #[error("cyclic lineage: {}", format_path(.path))]
    CyclicLineage { path: Vec<EntityRef> },

    #[error("duplicate edge {kind} from {owner} to {target}")]
    DuplicateEdge {
        owner: EntityId,
        kind: EdgeKind,
        target: EntityRef,
    },

    #[error("edge {kind} cannot be owned by {owner}")]
    InvalidEdgeOwner { kind: EdgeKind, owner: EntityRef },

    #[error("edge {kind} from {owner} cannot point at {target}")]
    InvalidEdgeTarget {
        kind: EdgeKind,
        owner: EntityRef,
        target: EntityRef,
    },

    /// Edge target is not an entity of this trail or of its metadata snapshot.
    #[error("dangling reference: {0} does not belong to this trail")]
    DanglingReference(EntityRef),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown hierarchy: {0}")]
    UnknownHierarchy(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("numeric overflow in {0}")]
    NumericOverflow(String),

    #[error("division by zero")]
    DivisionByZero,

    /// A parameterised expression produced a value without consulting any source value.
    #[error("incomplete lineage: expression with {parameters} parameter(s) recorded no sources")]
    IncompleteLineage { parameters: usize },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Entity construction rejected an ownership or variant-pairing violation.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A dependency failed earlier in the same trail; it is not re-attempted.
    #[error("dependency {0} failed earlier in this trail")]
    DependencyFailed(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LineageError {
    /// Errors the caller may recover from without abandoning the trail.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedSpeculativeReference { .. } | Self::DuplicateEdge { .. }
        )
    }

    /// Stable machine-readable code, used in failure records and audit logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvedSourceColumn { .. } => "unresolved_source_column",
            Self::UnresolvedSpeculativeReference { .. } => "unresolved_speculative_reference",
            Self::CyclicLineage { .. } => "cyclic_lineage",
            Self::DuplicateEdge { .. } => "duplicate_edge",
            Self::InvalidEdgeOwner { .. } => "invalid_edge_owner",
            Self::InvalidEdgeTarget { .. } => "invalid_edge_target",
            Self::DanglingReference(_) => "dangling_reference",
            Self::UnknownTable(_) => "unknown_table",
            Self::UnknownFunction(_) => "unknown_function",
            Self::UnknownHierarchy(_) => "unknown_hierarchy",
            Self::TypeMismatch(_) => "type_mismatch",
            Self::NumericOverflow(_) => "numeric_overflow",
            Self::DivisionByZero => "division_by_zero",
            Self::IncompleteLineage { .. } => "incomplete_lineage",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::DependencyFailed(_) => "dependency_failed",
            Self::Internal(_) => "internal",
        }
    }
}

fn format_path(path: &[EntityRef]) -> String {
    path.iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::EntityKind;

    #[test]
    fn speculative_and_duplicate_are_recoverable() {
        let speculative = LineageError::UnresolvedSpeculativeReference {
            cube: "F_05_01".into(),
            column: "AMNT".into(),
        };
        assert!(speculative.is_recoverable());

        let dup = LineageError::DuplicateEdge {
            owner: EntityId::new(),
            kind: EdgeKind::DerivedRowSourceReference,
            target: EntityRef::new(EntityKind::DatabaseRow, EntityId::new()),
        };
        assert!(dup.is_recoverable());
    }

    #[test]
    fn hard_errors_are_not_recoverable() {
        let err = LineageError::UnresolvedSourceColumn {
            table: "loans".into(),
            column: "amt".into(),
        };
        assert!(!err.is_recoverable());
        assert!(!LineageError::CyclicLineage { path: vec![] }.is_recoverable());
        assert!(!LineageError::Internal(anyhow::anyhow!("boom")).is_recoverable());
    }

    #[test]
    fn display_unresolved_source_column() {
        let err = LineageError::UnresolvedSourceColumn {
            table: "loans".into(),
            column: "amt".into(),
        };
        assert_eq!(err.to_string(), "unresolved source column loans.amt");
        assert_eq!(err.code(), "unresolved_source_column");
    }

    #[test]
    fn display_cycle_path() {
        let a = EntityRef::new(EntityKind::DerivedTableRow, EntityId::new());
        let b = EntityRef::new(EntityKind::DerivedTableRow, EntityId::new());
        let err = LineageError::CyclicLineage {
            path: vec![a, b, a],
        };
        assert_eq!(err.to_string(), format!("cyclic lineage: {a} -> {b} -> {a}"));
    }
}
