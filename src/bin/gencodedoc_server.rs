//! # gencodedoc server
//!
//! Serves the snapshot engine's tools over line-delimited JSON-RPC on
//! stdio. Logging goes to stderr so stdout stays a clean protocol
//! channel.
//!
//! ## Usage
//! ```bash
//! # Serve with an explicit default project
//! gencodedoc-server --project-path ./my_project
//!
//! # Or pick the default project up from the environment
//! PROJECT_PATH=./my_project gencodedoc-server
//! ```

use anyhow::Result;
use clap::Parser;
use gencodedoc::RequestRouter;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Snapshot engine server over stdio
#[derive(Parser)]
#[command(name = "gencodedoc-server")]
#[command(version)]
#[command(about = "Project-local versioning engine over line-delimited JSON-RPC")]
struct Cli {
    /// Default project path when a request omits project_path
    #[arg(short, long, env = "PROJECT_PATH")]
    project_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(
        default_project = ?cli.project_path,
        "starting gencodedoc server"
    );

    let router = RequestRouter::new(cli.project_path);
    router.serve(BufReader::new(io::stdin().lock()), io::stdout().lock())?;

    Ok(())
}
