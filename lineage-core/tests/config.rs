//! Engine configuration loading.

use std::collections::HashMap;
use std::io::Write;

use pretty_assertions::assert_eq;

use lineage_core::{EngineConfig, Scalar, SpeculativePolicy};

#[test]
fn loads_yaml_and_applies_overrides() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "max_lineage_depth: 4\nspeculative_policy:\n  mode: default\n  value: {{ int: 0 }}\n"
    )
    .unwrap();

    let mut config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.max_lineage_depth, Some(4));
    assert_eq!(config.speculative_policy, SpeculativePolicy::Default(Scalar::Int(0)));
    assert!(config.record_definition_edges);
    assert!(!config.strict_source_columns);

    let env = HashMap::from([
        ("LINEAGE_MAX_LINEAGE_DEPTH", "none"),
        ("LINEAGE_SPECULATIVE_POLICY", "skip"),
        ("LINEAGE_STRICT_SOURCE_COLUMNS", "true"),
    ]);
    config
        .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
        .unwrap();
    assert_eq!(
        config,
        EngineConfig {
            max_lineage_depth: None,
            speculative_policy: SpeculativePolicy::Skip,
            strict_source_columns: true,
            record_definition_edges: true,
        }
    );
}

#[test]
fn fixture_config_parses() {
    let config = EngineConfig::from_yaml_str(include_str!("../../fixtures/engine.yaml")).unwrap();
    assert_eq!(config.max_lineage_depth, Some(8));
    assert_eq!(config.speculative_policy, SpeculativePolicy::Abort);
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.code(), "internal");
}

#[test]
fn bad_override_is_rejected() {
    let mut config = EngineConfig::default();
    let err = config
        .apply_overrides(|key| (key == "LINEAGE_MAX_LINEAGE_DEPTH").then(|| "deep".to_string()))
        .unwrap_err();
    assert_eq!(err.code(), "invalid_definition");
}
