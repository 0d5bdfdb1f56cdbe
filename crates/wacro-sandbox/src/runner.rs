//! Backend-agnostic runner interface and selection.
//!
//! Callers hold a `Box<dyn MacroRunner>` and never learn which backend
//! answers.  [`probe_backends`] checks what this host can offer,
//! [`select_backend`] resolves the configured preference once at startup
//! and [`load_runner`] brings the chosen backend up.

use std::fmt;

use async_trait::async_trait;

use crate::config::{BackendPreference, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::isolate::{IsolatedRunner, WorkerProgram};
use crate::vm::VmRunner;

/// The concrete backend behind a [`MacroRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// In-process virtual machine.
    Vm,
    /// Separate worker process.
    Isolated,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vm => "vm",
            Self::Isolated => "isolated",
        })
    }
}

/// One loaded guest module answering text requests.
///
/// `handle` may suspend; the in-process backend never does.  Requests on
/// one runner are strictly sequential, which `&mut self` enforces.
#[async_trait]
pub trait MacroRunner: Send {
    /// Which backend this is.
    fn kind(&self) -> RunnerKind;

    /// Display name of the loaded module.
    fn name(&self) -> &str;

    /// Run one request through the guest.
    ///
    /// Any error is fatal for the request; the runner never substitutes a
    /// default response.
    async fn handle(&mut self, request: &str) -> Result<String>;
}

/// What this host can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// A worker program for the isolated backend is present.
    pub isolated: bool,
}

/// Check which backends are usable.
pub fn probe_backends(worker: Option<&WorkerProgram>) -> Capabilities {
    let isolated = worker.is_some_and(WorkerProgram::is_available);
    tracing::debug!(isolated, "backend capability probe");
    Capabilities { isolated }
}

/// Resolve a preference against the probed capabilities.
pub fn select_backend(preference: BackendPreference, caps: &Capabilities) -> Result<RunnerKind> {
    match preference {
        BackendPreference::Vm => Ok(RunnerKind::Vm),
        BackendPreference::Isolated if caps.isolated => Ok(RunnerKind::Isolated),
        BackendPreference::Isolated => Err(SandboxError::Config(
            "isolated backend requested but no worker program is available".into(),
        )),
        BackendPreference::Auto if caps.isolated => Ok(RunnerKind::Isolated),
        BackendPreference::Auto => Ok(RunnerKind::Vm),
    }
}

/// Probe, select and load in one step.
pub async fn load_runner(
    name: &str,
    wasm: &[u8],
    config: SandboxConfig,
    worker: Option<&WorkerProgram>,
) -> Result<Box<dyn MacroRunner>> {
    let caps = probe_backends(worker);
    let kind = select_backend(config.backend, &caps)?;
    tracing::info!(module = name, backend = %kind, "loading runner");

    match (kind, worker) {
        (RunnerKind::Isolated, Some(worker)) => {
            Ok(Box::new(IsolatedRunner::spawn(worker, name, wasm, &config).await?))
        }
        _ => Ok(Box::new(VmRunner::load(name, wasm, config)?)),
    }
}
