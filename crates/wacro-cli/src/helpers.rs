//! Shared helper functions used across CLI subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use wacro_sandbox::WorkerProgram;

/// Name of the forwarder binary installed next to `wacro`.
pub const FORWARDER_BIN: &str = "wacro-forwarder";

/// Hidden subcommand the isolated backend starts workers with.
pub const WORKER_SUBCOMMAND: &str = "isolate-worker";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Output always goes to stderr; stdout carries protocol frames.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Modules and companion binaries
// ---------------------------------------------------------------------------

/// Read a module and derive its display name from the file stem.
pub fn read_module(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read module {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_owned());
    Ok((name, bytes))
}

/// This executable re-entered through the hidden worker subcommand.
pub fn worker_program() -> Option<WorkerProgram> {
    match std::env::current_exe() {
        Ok(exe) => Some(WorkerProgram::new(exe).with_arg(WORKER_SUBCOMMAND)),
        Err(e) => {
            tracing::warn!(error = %e, "cannot locate own executable, isolated backend disabled");
            None
        }
    }
}

/// Forwarder to link for `route`: the configured one, else the sibling binary.
pub fn resolve_forwarder(configured: Option<PathBuf>) -> Result<PathBuf> {
    let path = match configured {
        Some(path) => path,
        None => std::env::current_exe()
            .context("cannot locate own executable")?
            .with_file_name(FORWARDER_BIN),
    };
    if !path.is_file() {
        anyhow::bail!("forwarder {} not found", path.display());
    }
    Ok(path)
}
