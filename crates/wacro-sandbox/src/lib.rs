//! wacro WebAssembly sandbox.
//!
//! Runs untrusted macro-plugin modules behind a one-call contract:
//! `handle(request text) -> response text`.
//!
//! - **[`abi`]** -- the guest memory contract, [`GuestAddr`] and the
//!   bounds-checked call sequence.
//! - **[`module`]** -- compilation plus export/import validation.
//! - **[`vm`]** -- [`VmRunner`], the in-process wasmtime backend.
//! - **[`isolate`]** -- [`IsolatedRunner`], the worker-process backend,
//!   and the worker loop it drives.
//! - **[`runner`]** -- the [`MacroRunner`] trait and backend selection.
//! - **[`config`]** -- [`SandboxConfig`] limits and ABI names.
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode.

pub mod abi;
pub mod config;
pub mod error;
pub mod isolate;
pub mod module;
pub mod runner;
pub mod vm;

pub use abi::{ABI_VERSION, AbiNames, GuestAbi, GuestAddr, call_guest};
pub use config::{BackendPreference, SandboxConfig};
pub use error::{Result, SandboxError};
pub use isolate::{IsolatedRunner, WorkerProgram, serve_worker};
pub use module::{ModuleInfo, inspect};
pub use runner::{Capabilities, MacroRunner, RunnerKind, load_runner, probe_backends, select_backend};
pub use vm::VmRunner;
