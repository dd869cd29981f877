//! Cellar CLI - replay documents through the reactive cell engine.

mod inspect;
mod replay;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cellar")]
#[command(about = "Reactive cell engine for live documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a document script and print cell states after each step
    Replay {
        /// Path to the script (.json)
        script: String,

        /// Debounce window for update passes, in milliseconds
        #[arg(long)]
        idle_wait_ms: Option<u64>,

        /// Add a subprocess runtime as `name=program` (repeatable)
        #[arg(long = "context", value_name = "NAME=PROGRAM")]
        contexts: Vec<String>,

        /// Print one JSON object per step instead of text
        #[arg(long)]
        json: bool,
    },

    /// Parse a cell expression and show its output name and inputs
    Inspect {
        /// Expression text, e.g. `y = add(x, 1)`
        expression: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            script,
            idle_wait_ms,
            contexts,
            json,
        } => {
            replay::execute(&script, idle_wait_ms, &contexts, json).await?;
        }

        Commands::Inspect { expression } => inspect::execute(&expression)?,
    }

    Ok(())
}
