//! lineage-core: derivation and lineage engine.
//!
//! Converts source tables into derived reporting tables while recording, for
//! every derived value, which source values, columns, rows and tables fed it.
//!
//! # Architecture
//!
//! ```text
//! SchemaDefinition (YAML/JSON)
//!       │ compile
//!       ▼
//! MetaDataTrail ──Arc──► LineageEngine::start_trail(data)
//!                               │
//!                               ▼
//!                           TrailRun
//!        ┌──────────────────────┼──────────────────────┐
//!        ▼                      ▼                      ▼
//!   Orchestrator ──► row_creation ──► FunctionEvaluator
//!        │                                             │
//!        └──── StagedTable ── commit ──► EntityArena + ReferenceResolver
//! ```
//!
//! - `model`: tagged entity families (tables, columns, rows, values)
//! - `reference`: typed lineage edges, direct and transitive resolution
//! - `row_creation`: filter, join, enrichment and group-by approaches
//! - `evaluator`: expression evaluation with per-value lineage
//! - `orchestrator`: trail-scoped at-most-once initialization
//! - `repository`: persistence port and in-memory store

pub mod arena;
pub mod builtins;
pub mod config;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod expr;
pub mod ids;
pub mod lineage;
pub mod model;
pub mod orchestrator;
pub mod reference;
pub mod repository;
pub mod row_creation;
pub mod run;
pub mod schema;
pub mod source;
pub mod trail;
pub mod value;
pub mod view;

pub use builtins::{BuiltinRegistry, ScalarFn};
pub use config::{EngineConfig, SpeculativePolicy};
pub use definition::{RowCreationApproach, SchemaDefinition};
pub use error::{LineageError, Result};
pub use expr::{AggregateFn, BinaryOp, ColumnParam, Expr, UnaryOp};
pub use ids::{EntityId, MetaDataTrailId, TrailId};
pub use lineage::{LineageGraph, LineageReport, TrailSummary};
pub use orchestrator::FailureRecord;
pub use reference::{Edge, EdgeKind, EntityKind, EntityRef, LineageNode, ReferenceResolver};
pub use repository::{DirTrailRepository, MemoryTrailRepository, TrailRepository, TrailSnapshot};
pub use run::{LineageEngine, TrailOutcome, TrailRun};
pub use schema::MetaDataTrail;
pub use source::{record, SourceData};
pub use trail::{Trail, TrailStatus};
pub use value::{DataType, Scalar};
pub use view::{EntityView, TableView};
