//! Runtime configuration.
//!
//! Settings come from three layers, later ones winning: the TOML file
//! (`--config` or `./wacro.toml`), `WACRO_*` environment variables, then
//! command-line flags.
//!
//! ```toml
//! log_level = "warn"
//!
//! [sandbox]
//! backend = "vm"
//! max_fuel = 10000000
//! max_execution_ms = 5000
//!
//! [router]
//! forwarder = "/usr/local/bin/wacro-forwarder"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use wacro_sandbox::SandboxConfig;

use crate::cli::LimitArgs;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "wacro.toml";

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

/// Everything the `wacro` binary can be configured with.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WacroConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Limits and backend choice for guest modules.
    pub sandbox: SandboxConfig,
    /// Toolchain routing.
    pub router: RouterSection,
}

impl Default for WacroConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".into(),
            sandbox: SandboxConfig::default(),
            router: RouterSection::default(),
        }
    }
}

/// The `[router]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Forwarder stub linked once per plugin slot.
    ///
    /// Defaults to `wacro-forwarder` next to the running executable.
    pub forwarder: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl WacroConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    /// Load the file layer.
    ///
    /// An explicit path must exist; the implicit `./wacro.toml` is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let implicit = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !implicit.is_file() {
                    return Ok(Self::default());
                }
                implicit
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Apply `WACRO_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("WACRO_LOG") {
            self.log_level = level;
        }
        if let Some(backend) = lookup("WACRO_BACKEND") {
            self.sandbox.backend = backend.parse().context("WACRO_BACKEND")?;
        }
        if let Some(fuel) = lookup("WACRO_FUEL") {
            self.sandbox.max_fuel = Some(fuel.trim().parse().context("WACRO_FUEL")?);
        }
        if let Some(ms) = lookup("WACRO_TIMEOUT_MS") {
            self.sandbox.max_execution_ms = Some(ms.trim().parse().context("WACRO_TIMEOUT_MS")?);
        }
        if let Some(path) = lookup("WACRO_FORWARDER") {
            self.router.forwarder = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Apply per-command flags.
    pub fn apply_limits(&mut self, limits: &LimitArgs) {
        if let Some(backend) = limits.backend {
            self.sandbox.backend = backend;
        }
        if let Some(fuel) = limits.fuel {
            self.sandbox.max_fuel = Some(fuel);
        }
        if let Some(ms) = limits.timeout_ms {
            self.sandbox.max_execution_ms = Some(ms);
        }
    }
}
