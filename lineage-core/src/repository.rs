//! Persistence port for finished trails.
//!
//! The engine never writes to storage itself; callers hand a [`TrailSnapshot`]
//! to a [`TrailRepository`]. Completed trails are immutable: re-computation
//! produces a new trail, it never rewrites an old one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::TrailId;
use crate::model::{PopulatedTable, Row, Value};
use crate::orchestrator::FailureRecord;
use crate::reference::{Edge, ReferenceResolver};
use crate::trail::{Trail, TrailStatus};

/// Everything one trail materialized, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailSnapshot {
    pub trail: Trail,
    pub populated_tables: Vec<PopulatedTable>,
    pub rows: Vec<Row>,
    pub values: Vec<Value>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
}

impl TrailSnapshot {
    /// Rebuild the edge store, e.g. to query lineage of a persisted trail.
    pub fn resolver(&self) -> crate::error::Result<ReferenceResolver> {
        ReferenceResolver::from_edges(self.edges.iter().copied())
    }
}

#[async_trait]
pub trait TrailRepository: Send + Sync {
    async fn save(&self, snapshot: &TrailSnapshot) -> Result<()>;
    async fn load(&self, id: TrailId) -> Result<Option<TrailSnapshot>>;
    /// Trail metadata, oldest first, optionally filtered by status.
    async fn list(&self, status: Option<TrailStatus>) -> Result<Vec<Trail>>;
    /// Delete a whole trail. Returns whether it existed.
    async fn delete(&self, id: TrailId) -> Result<bool>;
}

// ── MemoryTrailRepository ──

/// In-memory TrailRepository for tests and the CLI.
///
/// Enforces append-only lineage: a completed trail cannot be overwritten.
/// Running or failed trails may be replaced and any trail may be deleted.
pub struct MemoryTrailRepository {
    inner: RwLock<HashMap<TrailId, TrailSnapshot>>,
}

impl MemoryTrailRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTrailRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrailRepository for MemoryTrailRepository {
    async fn save(&self, snapshot: &TrailSnapshot) -> Result<()> {
        let id = snapshot.trail.id;
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;

        if let Some(existing) = store.get(&id) {
            if existing.trail.status == TrailStatus::Completed {
                return Err(anyhow!("Cannot overwrite completed trail {}", id));
            }
        }

        store.insert(id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: TrailId) -> Result<Option<TrailSnapshot>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.get(&id).cloned())
    }

    async fn list(&self, status: Option<TrailStatus>) -> Result<Vec<Trail>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut trails: Vec<Trail> = store
            .values()
            .map(|s| &s.trail)
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        trails.sort_by_key(|t| (t.created_at, t.id));
        Ok(trails)
    }

    async fn delete(&self, id: TrailId) -> Result<bool> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.remove(&id).is_some())
    }
}

// ── DirTrailRepository ──

/// TrailRepository keeping one `<trail id>.json` file per trail in a directory.
///
/// Same overwrite rule as [`MemoryTrailRepository`]. Files that do not parse
/// as snapshots are skipped by `list`.
pub struct DirTrailRepository {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl DirTrailRepository {
    /// Open `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating trail store {}", dir.display()))?;
        Ok(Self {
            dir,
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a trail is stored in, whether or not it exists yet.
    pub fn path_of(&self, id: TrailId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read(path: &Path) -> Result<TrailSnapshot> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading trail {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing trail {}", path.display()))
    }
}

#[async_trait]
impl TrailRepository for DirTrailRepository {
    async fn save(&self, snapshot: &TrailSnapshot) -> Result<()> {
        let id = snapshot.trail.id;
        let _guard = self.writer.lock().map_err(|e| anyhow!("Lock: {}", e))?;

        let path = self.path_of(id);
        if path.exists() && Self::read(&path)?.trail.status == TrailStatus::Completed {
            return Err(anyhow!("Cannot overwrite completed trail {}", id));
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, id: TrailId) -> Result<Option<TrailSnapshot>> {
        let path = self.path_of(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    async fn list(&self, status: Option<TrailStatus>) -> Result<Vec<Trail>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("listing trail store {}", self.dir.display()))?;
        let mut trails = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(snapshot) if status.map_or(true, |s| snapshot.trail.status == s) => {
                    trails.push(snapshot.trail)
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable trail: {err:#}")
                }
            }
        }
        trails.sort_by_key(|t| (t.created_at, t.id));
        Ok(trails)
    }

    async fn delete(&self, id: TrailId) -> Result<bool> {
        let _guard = self.writer.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        match std::fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting trail {id}")),
        }
    }
}
