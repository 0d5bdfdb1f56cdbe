//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls the resource limits applied to every guest
//! module instance, the ABI export names the runner binds to, and which
//! backend the runner selection prefers.  Defaults come from the
//! [`Default`] implementation; a builder-style API customises individual
//! fields fluently.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::abi::AbiNames;
use crate::error::SandboxError;

/// Which backend the runner selection should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Use the isolated backend when the capability probe allows it,
    /// otherwise the in-process VM.
    #[default]
    Auto,
    /// Always use the in-process VM.
    Vm,
    /// Always use the process-isolated backend; fail if unavailable.
    Isolated,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Vm => "vm",
            Self::Isolated => "isolated",
        })
    }
}

impl FromStr for BackendPreference {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "vm" => Ok(Self::Vm),
            "isolated" => Ok(Self::Isolated),
            other => Err(SandboxError::Config(format!(
                "unknown backend '{other}' (expected auto, vm or isolated)"
            ))),
        }
    }
}

/// Resource limits and ABI bindings for the Wasm sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum linear memory a guest may grow to, in bytes.
    ///
    /// Default: **256 MiB**.
    pub max_memory: usize,

    /// Wall-clock budget for a single guest call, in milliseconds.
    ///
    /// `None` leaves calls unbounded.  Default: **None**.
    pub max_execution_ms: Option<u64>,

    /// Fuel (abstract instruction count) granted before every guest call.
    ///
    /// `None` disables fuel metering.  Default: **None**.
    pub max_fuel: Option<u64>,

    /// Export names the guest module must provide.
    pub abi: AbiNames,

    /// Backend preference used by runner selection.
    pub backend: BackendPreference,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 256 * 1024 * 1024,
            max_execution_ms: None,
            max_fuel: None,
            abi: AbiNames::default(),
            backend: BackendPreference::Auto,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum memory limit (in bytes).
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the per-call wall-clock limit (in milliseconds).
    pub fn with_max_execution_ms(mut self, ms: u64) -> Self {
        self.max_execution_ms = Some(ms);
        self
    }

    /// Set the per-call fuel budget.
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    /// Override the ABI export names.
    pub fn with_abi(mut self, abi: AbiNames) -> Self {
        self.abi = abi;
        self
    }

    /// Set the backend preference.
    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }
}
