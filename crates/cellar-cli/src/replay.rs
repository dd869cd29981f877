//! Replay command implementation for Cellar CLI.
//!
//! A script is a JSON object holding the document's initial nodes and the
//! events to apply afterwards:
//!
//! ```json
//! {
//!   "nodes": [
//!     {"id": "i1", "type": "range-input", "name": "x", "value": 5},
//!     {"id": "c1", "type": "cell", "source_code": "y = x * 2"}
//!   ],
//!   "events": [
//!     {"event": "value_updated", "id": "i1", "value": 7}
//!   ]
//! }
//! ```
//!
//! The engine settles after the initial nodes and after every event; the
//! state of every cell is printed each time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use cellar_core::{
    CellEngine, ContextRegistry, DocumentEvent, DocumentNode, EngineConfig, ErrorRecord,
    FunctionContext, ProcessContext,
};
use serde::{Deserialize, Serialize};

/// A document replay script.
#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub config: Option<EngineConfig>,
    #[serde(default)]
    pub nodes: Vec<DocumentNode>,
    #[serde(default)]
    pub events: Vec<DocumentEvent>,
}

/// State of one cell at the end of a step.
#[derive(Debug, Serialize)]
struct CellReport {
    id: String,
    output: Option<serde_json::Value>,
    errors: Vec<ErrorRecord>,
}

#[derive(Debug, Serialize)]
struct StepReport {
    step: String,
    cells: Vec<CellReport>,
}

/// Execute a replay script.
pub async fn execute(
    script_path: &str,
    idle_wait_ms: Option<u64>,
    context_specs: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read script {script_path}"))?;
    let script: Script = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse script {script_path}"))?;

    let mut config = script.config.unwrap_or_default();
    if let Some(ms) = idle_wait_ms {
        config = config.with_idle_wait(Duration::from_millis(ms));
    }

    let contexts = build_contexts(context_specs, &config.native_language).await?;
    let mut engine = CellEngine::new(config, contexts, script.nodes);

    engine.run_until_idle().await;
    print_step(&engine, "initial", json)?;

    for (index, event) in script.events.into_iter().enumerate() {
        engine.handle(event);
        engine.run_until_idle().await;
        print_step(&engine, &format!("event {}", index + 1), json)?;
    }

    engine.dispose();
    Ok(())
}

/// Subprocess runtimes in command-line order, then the built-in functions
/// under the native language name unless a subprocess took it.
async fn build_contexts(specs: &[String], native_language: &str) -> anyhow::Result<ContextRegistry> {
    let mut contexts = ContextRegistry::new();
    for spec in specs {
        let (name, program) = parse_context_spec(spec)?;
        let context = ProcessContext::spawn(program, &[])
            .await
            .with_context(|| format!("Failed to start context '{name}'"))?;
        contexts.insert(name, Arc::new(context));
    }
    if contexts.get(native_language).is_none() {
        contexts.insert(native_language, Arc::new(FunctionContext::with_builtins()));
    }
    Ok(contexts)
}

fn parse_context_spec(spec: &str) -> anyhow::Result<(&str, &str)> {
    match spec.split_once('=') {
        Some((name, program)) if !name.is_empty() && !program.is_empty() => Ok((name, program)),
        _ => Err(anyhow!("Expected --context NAME=PROGRAM, got '{spec}'")),
    }
}

fn report(engine: &CellEngine, step: &str) -> StepReport {
    StepReport {
        step: step.to_string(),
        cells: engine
            .cells()
            .map(|cell| CellReport {
                id: cell.id().to_string(),
                output: cell.output().map(|value| value.to_json()),
                errors: cell.errors().to_vec(),
            })
            .collect(),
    }
}

fn print_step(engine: &CellEngine, step: &str, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(&report(engine, step))?);
        return Ok(());
    }

    println!("== {step} ==");
    for cell in engine.cells() {
        match cell.output() {
            Some(value) => println!("{} = {}", cell.id(), value),
            None => println!("{} (no value)", cell.id()),
        }
        for error in cell.errors() {
            println!("  ! {error}");
        }
    }
    Ok(())
}
