//! CLI argument definitions for wacro.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use wacro_sandbox::BackendPreference;

/// wacro -- sandboxed WebAssembly compiler plugins.
#[derive(Parser)]
#[command(
    name = "wacro",
    version,
    about = "wacro -- run compiler plugins as sandboxed WebAssembly modules",
    long_about = "Hosts WebAssembly macro plugins behind the length-prefixed plugin protocol, \
                  either directly over stdio or for every plugin of a toolchain invocation."
)]
pub struct Cli {
    /// Configuration file (defaults to ./wacro.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve one module over stdin/stdout as a plugin executable.
    Serve {
        /// Path to the WebAssembly module.
        #[arg(long, short)]
        module: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Load a module, send it one request and print the response.
    Check {
        /// Path to the WebAssembly module.
        #[arg(long, short)]
        module: PathBuf,

        /// Request payload; defaults to a capability query.
        #[arg(long)]
        request: Option<String>,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Run a toolchain, serving every `.wasm` plugin it names in-process.
    Route {
        /// Forwarder stub the toolchain will spawn for each plugin.
        #[arg(long)]
        forwarder: Option<PathBuf>,

        #[command(flatten)]
        limits: LimitArgs,

        /// Toolchain program followed by its arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        toolchain: Vec<OsString>,
    },

    /// Bridge worker spawned by the isolated backend.
    #[command(hide = true)]
    IsolateWorker,
}

/// Sandbox limits accepted by every module-running subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct LimitArgs {
    /// Backend to run the module on: auto, vm or isolated.
    #[arg(long)]
    pub backend: Option<BackendPreference>,

    /// Fuel granted to each guest call.
    #[arg(long)]
    pub fuel: Option<u64>,

    /// Wall-clock budget per guest call, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}
