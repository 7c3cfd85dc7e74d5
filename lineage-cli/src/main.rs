//! Lineage engine command line.
//!
//! # Usage
//!
//! ```bash
//! # Materialize a derived table and print it as JSON
//! lineage run --schema fixtures/finrep.yaml --data fixtures/loans.json --target usd_loans
//!
//! # Same, plus the lineage of row 0 and each of its values
//! lineage run --schema fixtures/finrep.yaml --data fixtures/loans.json \
//!     --target totals_by_ccy --explain-row 0
//!
//! # Keep the finished trail as <store>/<trail id>.json
//! lineage run --schema fixtures/finrep.yaml --data fixtures/loans.json \
//!     --target totals_by_ccy --store target/trails
//!
//! # Print the snapshot fingerprint of a definition
//! lineage fingerprint --schema fixtures/finrep.yaml
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lineage_core::{
    DirTrailRepository, EngineConfig, LineageEngine, MetaDataTrail, SourceData, TrailRepository,
    TrailStatus,
};

#[derive(Parser)]
#[command(name = "lineage")]
#[command(version)]
#[command(about = "Materialize derived tables and report their lineage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one trail up to a target table
    Run {
        /// Schema definition (YAML, or JSON by extension)
        #[arg(long, env = "LINEAGE_SCHEMA")]
        schema: PathBuf,

        /// Source data: JSON object of table name to record array
        #[arg(long)]
        data: PathBuf,

        /// Table to materialize
        #[arg(long)]
        target: String,

        /// Engine config (YAML); LINEAGE_* variables override it
        #[arg(long, env = "LINEAGE_CONFIG")]
        config: Option<PathBuf>,

        /// Also report the lineage of this row of the target
        #[arg(long)]
        explain_row: Option<usize>,

        /// Include the full lineage graph of the trail
        #[arg(long)]
        graph: bool,

        /// Directory to save the finished trail snapshot into
        #[arg(long, env = "LINEAGE_STORE")]
        store: Option<PathBuf>,
    },

    /// Print the fingerprint of a schema definition
    Fingerprint {
        #[arg(long, env = "LINEAGE_SCHEMA")]
        schema: PathBuf,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lineage_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            schema,
            data,
            target,
            config,
            explain_row,
            graph,
            store,
        } => {
            let opts = RunOptions {
                explain_row,
                graph,
                store,
            };
            cmd_run(schema, data, target, config, opts).await
        }
        Commands::Fingerprint { schema } => cmd_fingerprint(schema),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(&path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_overrides(|key| std::env::var(key).ok())
        .context("applying LINEAGE_* overrides")?;
    Ok(config)
}

/// Output switches of `lineage run`.
struct RunOptions {
    explain_row: Option<usize>,
    graph: bool,
    store: Option<PathBuf>,
}

async fn cmd_run(
    schema_path: PathBuf,
    data_path: PathBuf,
    target: String,
    config_path: Option<PathBuf>,
    opts: RunOptions,
) -> Result<()> {
    let config = load_config(config_path)?;
    info!(policy = ?config.speculative_policy, "engine config loaded");
    let schema = MetaDataTrail::load(&schema_path)
        .with_context(|| format!("compiling schema {}", schema_path.display()))?;
    info!(
        schema = schema.name(),
        fingerprint = schema.fingerprint(),
        "schema compiled"
    );
    let data = SourceData::load(&data_path)
        .with_context(|| format!("loading source data {}", data_path.display()))?;
    // Open before running so a bad store path fails fast.
    let store = opts.store.map(DirTrailRepository::open).transpose()?;

    let engine = LineageEngine::new(Arc::new(schema), config);
    let context = BTreeMap::from([
        ("schema".to_string(), json!(schema_path.display().to_string())),
        ("data".to_string(), json!(data_path.display().to_string())),
    ]);
    let mut run = engine.start_trail(format!("cli:{target}"), context, data);
    let outcome = run.execute(&target);

    let mut output = json!({
        "trail": outcome.trail_id,
        "target": outcome.target,
        "status": outcome.status,
        "failures": outcome.failures,
    });

    if outcome.status == TrailStatus::Completed {
        let view = run
            .table_view(&target)
            .with_context(|| format!("reading materialized table {target}"))?;
        output["rows"] = view.to_json();

        if let Some(n) = opts.explain_row {
            let row = view
                .rows
                .iter()
                .find(|r| r.row_number == n)
                .with_context(|| format!("{target} has no row {n}"))?;
            let mut values = serde_json::Map::new();
            for cell in &row.cells {
                let report = run
                    .lineage(cell.value)
                    .with_context(|| format!("lineage of {target}.{}", cell.column))?;
                values.insert(cell.column.clone(), serde_json::to_value(report)?);
            }
            output["explain"] = json!({
                "row": run.lineage(row.row).context("row lineage")?,
                "values": values,
            });
        }
    }

    output["summary"] = serde_json::to_value(run.summary())?;
    if opts.graph {
        output["graph"] = serde_json::to_value(run.lineage_graph())?;
    }

    info!(
        trail = %outcome.trail_id,
        status = %outcome.status,
        failures = outcome.failures.len(),
        "trail finished"
    );
    if let Some(store) = store {
        let snapshot = run.finish();
        store.save(&snapshot).await?;
        let path = store.path_of(snapshot.trail.id);
        info!(path = %path.display(), "trail snapshot saved");
        output["snapshot"] = json!(path.display().to_string());
    }

    println!("{}", serde_json::to_string_pretty(&output)?);

    if outcome.status == TrailStatus::Failed {
        anyhow::bail!("trail {} failed to materialize {}", outcome.trail_id, target);
    }
    Ok(())
}

fn cmd_fingerprint(schema_path: PathBuf) -> Result<()> {
    let schema = MetaDataTrail::load(&schema_path)
        .with_context(|| format!("compiling schema {}", schema_path.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "name": schema.name(),
            "snapshot": schema.id(),
            "fingerprint": schema.fingerprint(),
            "tables": schema.tables().len(),
        }))?
    );
    Ok(())
}
