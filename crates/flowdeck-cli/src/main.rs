//! CLI entry point for Flowdeck.
//!
//! Provides the `flowdeck` command:
//!
//! - `flowdeck run <file>` — execute a workflow document (JSON or YAML)
//!   against inputs given as `-i key=value` pairs.
//! - `flowdeck validate <file>` — parse and validate without executing.
//!
//! The authored-prose parser lives outside this repository; the CLI
//! consumes the parsed document shape directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

use flowdeck_core::{Workflow, WorkflowStatus};
use flowdeck_engine::WorkflowEngine;
use flowdeck_registry::SdkRegistry;
use flowdeck_registry::discovery::{ManifestInitializer, load_manifests};
use flowdeck_sources::EventSourceManager;
use flowdeck_vault::SecretManager;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "flowdeck", version, about = "Declarative workflow runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow document.
    Run {
        /// Path to the workflow document (.json, .yaml, .yml).
        file: PathBuf,
        /// Initial inputs as key=value pairs; values parse as JSON when
        /// possible, otherwise as strings.
        #[arg(short = 'i', long = "input")]
        inputs: Vec<String>,
        /// Directory of integration manifests to register before running.
        #[arg(long, default_value = "integrations")]
        integrations_dir: PathBuf,
        /// Print the full final variable scope as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Parse and validate a workflow document without executing it.
    Validate {
        /// Path to the workflow document.
        file: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (silently ignore if missing).
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            inputs,
            integrations_dir,
            json,
        } => cmd_run(&file, &inputs, &integrations_dir, json).await,
        Commands::Validate { file } => cmd_validate(&file),
    }
}

/// Honor `FLOWDECK_LOG` (falling back to `RUST_LOG`, then `info`).
fn init_tracing() {
    let filter = std::env::var("FLOWDECK_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn cmd_run(
    file: &Path,
    raw_inputs: &[String],
    integrations_dir: &Path,
    json_output: bool,
) -> Result<()> {
    let workflow = load_workflow(file)?;
    let inputs = parse_inputs(raw_inputs)?;

    let registry = Arc::new(SdkRegistry::new(SecretManager::new()));

    for manifest in load_manifests(integrations_dir)? {
        let initializer =
            ManifestInitializer::new(manifest, Some(registry.limiter().clone()));
        registry.register_initializer(Arc::new(initializer));
    }

    // Daemon-mode workflows (and any workflow declaring sources) get the
    // event-source manager wired into the `event` built-in.
    let sources = Arc::new(EventSourceManager::new());
    registry.attach_event_bridge(Arc::clone(&sources) as _);
    for source in &workflow.sources {
        sources
            .add(source.clone())
            .await
            .with_context(|| format!("failed to start event source `{}`", source.id))?;
    }

    let engine = WorkflowEngine::new(Arc::clone(&registry));
    let result = engine.execute(&workflow, inputs).await?;

    sources.stop_all().await;
    registry.clear().await;

    print!("{}", result.summary());
    if json_output {
        println!("{}", serde_json::to_string_pretty(&result.variables)?);
    }

    if result.status != WorkflowStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let workflow = load_workflow(file)?;
    workflow.validate().context("workflow validation failed")?;
    info!(
        workflow = %workflow.metadata.name,
        steps = workflow.steps.len(),
        tools = workflow.tools.len(),
        "workflow is valid"
    );
    println!("ok: `{}` is valid", workflow.metadata.name);
    Ok(())
}

// ---------------------------------------------------------------------------
// Document and input loading
// ---------------------------------------------------------------------------

fn load_workflow(file: &Path) -> Result<Workflow> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let workflow: Workflow = match file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
    {
        "json" => serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON workflow in {}", file.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML workflow in {}", file.display()))?,
        other => bail!("unsupported workflow format `.{other}` (expected .json, .yaml, .yml)"),
    };

    Ok(workflow)
}

/// Parse `key=value` inputs.  Values that parse as JSON keep their type;
/// everything else is a string.
fn parse_inputs(raw: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("input `{entry}` is not of the form key=value");
        };
        let value = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
