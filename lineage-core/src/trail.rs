//! Execution-run identity and status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MetaDataTrailId, TrailId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrailStatus {
    Running,
    Completed,
    /// The trail's ultimate target could not be materialized.
    Failed,
}

impl TrailStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution run. Owns everything materialized during it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trail {
    pub id: TrailId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Caller-supplied execution context (reporting date, entity, run reason).
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub metadata_trail_id: MetaDataTrailId,
    pub metadata_fingerprint: String,
    pub status: TrailStatus,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trail {
    pub fn new(
        name: impl Into<String>,
        context: BTreeMap<String, serde_json::Value>,
        metadata_trail_id: MetaDataTrailId,
        metadata_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            id: TrailId::new(),
            name: name.into(),
            created_at: Utc::now(),
            context,
            metadata_trail_id,
            metadata_fingerprint: metadata_fingerprint.into(),
            status: TrailStatus::Running,
            finished_at: None,
        }
    }

    /// Move to a terminal status. Terminal trails stay as they are.
    pub fn finish(&mut self, status: TrailStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_one_way() {
        let mut trail = Trail::new("q4", BTreeMap::new(), MetaDataTrailId::new(), "abc");
        assert_eq!(trail.status, TrailStatus::Running);
        trail.finish(TrailStatus::Failed);
        let at = trail.finished_at;
        trail.finish(TrailStatus::Completed);
        assert_eq!(trail.status, TrailStatus::Failed);
        assert_eq!(trail.finished_at, at);
    }

    #[test]
    fn status_strings() {
        assert_eq!(TrailStatus::Completed.to_string(), "completed");
        assert_eq!("failed".parse::<TrailStatus>().unwrap(), TrailStatus::Failed);
    }
}
