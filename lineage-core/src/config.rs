//! Engine configuration.
//!
//! Loaded from YAML, then overridden by `LINEAGE_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `LINEAGE_MAX_LINEAGE_DEPTH` | `max_lineage_depth` (`none` clears it) |
//! | `LINEAGE_SPECULATIVE_POLICY` | `speculative_policy` (`abort`, `skip`, `default:<value>`) |
//! | `LINEAGE_STRICT_SOURCE_COLUMNS` | `strict_source_columns` |
//! | `LINEAGE_RECORD_DEFINITION_EDGES` | `record_definition_edges` |

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::definition::from_yaml;
use crate::error::{LineageError, Result};
use crate::value::Scalar;

/// What to do when a speculative parameter is missing from the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum SpeculativePolicy {
    /// Fail the owning derived table.
    #[default]
    Abort,
    /// Omit the column from the derived table.
    Skip,
    /// Substitute a literal, recording no source edges.
    Default(Scalar),
}

impl SpeculativePolicy {
    /// `abort`, `skip`, or `default:<value>`. The value is read as a JSON
    /// scalar payload (`{"int":0}`) when it parses as one, otherwise as text.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            _ => match s.strip_prefix("default:") {
                Some(raw) => {
                    let value = serde_json::from_str::<Scalar>(raw)
                        .unwrap_or_else(|_| Scalar::text(raw));
                    Ok(Self::Default(value))
                }
                None => Err(LineageError::InvalidDefinition(format!(
                    "unknown speculative policy {s:?}"
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Depth bound for transitive lineage queries. `None` walks to the leaves.
    pub max_lineage_depth: Option<usize>,
    pub speculative_policy: SpeculativePolicy,
    /// Reject source records carrying columns the table does not declare.
    pub strict_source_columns: bool,
    /// Write table-creation and function-column edges into each trail.
    pub record_definition_edges: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_lineage_depth: None,
            speculative_policy: SpeculativePolicy::Abort,
            strict_source_columns: false,
            record_definition_edges: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        from_yaml(s).map_err(|e| LineageError::InvalidDefinition(format!("engine config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `LINEAGE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("LINEAGE_MAX_LINEAGE_DEPTH") {
            self.max_lineage_depth = match v.trim() {
                "" | "none" => None,
                n => Some(n.parse().map_err(|_| invalid_override("LINEAGE_MAX_LINEAGE_DEPTH", n))?),
            };
        }
        if let Some(v) = lookup("LINEAGE_SPECULATIVE_POLICY") {
            self.speculative_policy = SpeculativePolicy::parse(&v)?;
        }
        if let Some(v) = lookup("LINEAGE_STRICT_SOURCE_COLUMNS") {
            self.strict_source_columns = parse_bool("LINEAGE_STRICT_SOURCE_COLUMNS", &v)?;
        }
        if let Some(v) = lookup("LINEAGE_RECORD_DEFINITION_EDGES") {
            self.record_definition_edges = parse_bool("LINEAGE_RECORD_DEFINITION_EDGES", &v)?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid_override(key, other)),
    }
}

fn invalid_override(key: &str, value: &str) -> LineageError {
    LineageError::InvalidDefinition(format!("{key}: cannot parse {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_with_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
max_lineage_depth: 4
speculative_policy: { mode: default, value: { int: 0 } }
"#,
        )
        .unwrap();
        assert_eq!(config.max_lineage_depth, Some(4));
        assert_eq!(
            config.speculative_policy,
            SpeculativePolicy::Default(Scalar::Int(0))
        );
        assert!(config.record_definition_edges);
        assert!(!config.strict_source_columns);
    }

    #[test]
    fn unit_policy_in_yaml() {
        let config = EngineConfig::from_yaml_str("speculative_policy: { mode: skip }").unwrap();
        assert_eq!(config.speculative_policy, SpeculativePolicy::Skip);
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LINEAGE_MAX_LINEAGE_DEPTH", "none"),
            ("LINEAGE_SPECULATIVE_POLICY", "default:{\"int\":7}"),
            ("LINEAGE_STRICT_SOURCE_COLUMNS", "yes"),
        ]);
        let mut config = EngineConfig {
            max_lineage_depth: Some(2),
            ..EngineConfig::default()
        };
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_lineage_depth, None);
        assert_eq!(
            config.speculative_policy,
            SpeculativePolicy::Default(Scalar::Int(7))
        );
        assert!(config.strict_source_columns);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "LINEAGE_RECORD_DEFINITION_EDGES").then(|| "maybe".into()))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_definition");
    }

    #[test]
    fn policy_parse() {
        assert_eq!(SpeculativePolicy::parse("skip").unwrap(), SpeculativePolicy::Skip);
        assert_eq!(
            SpeculativePolicy::parse("default:n/a").unwrap(),
            SpeculativePolicy::Default(Scalar::text("n/a"))
        );
        assert!(SpeculativePolicy::parse("retry").is_err());
    }
}
