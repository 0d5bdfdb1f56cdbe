//! Toolchain launcher.
//!
//! The compiler toolchain insists on spawning one executable per macro
//! plugin.  To keep every guest inside this process, the launcher:
//!
//! 1. finds each `-load-plugin-executable <path>.wasm[#Symbol]` argument
//!    ([`ToolchainInvocation::parse`]),
//! 2. links the forwarder stub under `1..=N` in a scratch directory
//!    ([`LinkFarm`]) and points each plugin argument at its link,
//! 3. starts the toolchain with slot `i`'s pipe pair on descriptors
//!    `3 + 2i` / `4 + 2i`, and
//! 4. serves every slot through the [`Router`] until the toolchain is done.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tempfile::TempDir;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use wacro_proto::SlotFds;
use wacro_proto::slot::link_name;
use wacro_sandbox::{SandboxConfig, VmRunner};

use crate::error::{HostError, Result};
use crate::router::{Router, SlotHandler};

/// Flag introducing a plugin executable on the toolchain command line.
pub const PLUGIN_FLAG: &str = "-load-plugin-executable";

/// Marker identifying a plugin path as a sandbox module.
const MODULE_MARKER: &str = ".wasm";

// ---------------------------------------------------------------------------
// Argument rewriting
// ---------------------------------------------------------------------------

/// One sandboxed plugin found on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginArg {
    /// Index into [`ToolchainInvocation::args`] of the path argument.
    pub arg_index: usize,
    /// Module file to load.
    pub module: PathBuf,
    /// Text after `#`, passed through unchanged.
    pub suffix: Option<String>,
}

/// A toolchain command line with its sandboxed plugins identified.
#[derive(Debug, Clone)]
pub struct ToolchainInvocation {
    program: OsString,
    args: Vec<OsString>,
    plugins: Vec<PluginArg>,
}

impl ToolchainInvocation {
    /// Split `argv` (program first) and locate plugin arguments.
    pub fn parse<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .ok_or_else(|| HostError::Toolchain("no toolchain program given".into()))?;
        let args: Vec<OsString> = argv.collect();

        let mut plugins = Vec::new();
        for (i, pair) in args.windows(2).enumerate() {
            if pair[0] != PLUGIN_FLAG {
                continue;
            }
            let Some(value) = pair[1].to_str() else {
                continue;
            };
            if !value.contains(MODULE_MARKER) {
                continue;
            }
            let (module, suffix) = match value.split_once('#') {
                Some((module, suffix)) => (module, Some(suffix.to_owned())),
                None => (value, None),
            };
            plugins.push(PluginArg {
                arg_index: i + 1,
                module: PathBuf::from(module),
                suffix,
            });
        }

        Ok(Self {
            program,
            args,
            plugins,
        })
    }

    /// The toolchain executable.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments as given.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Sandboxed plugins in slot order.
    pub fn plugins(&self) -> &[PluginArg] {
        &self.plugins
    }

    /// Arguments with every plugin path replaced by its forwarder link.
    pub fn rewritten_args(&self, links: &LinkFarm) -> Vec<OsString> {
        let mut args = self.args.clone();
        for (slot, plugin) in self.plugins.iter().enumerate() {
            let mut value = links.link_path(slot).into_os_string();
            if let Some(suffix) = &plugin.suffix {
                value.push("#");
                value.push(suffix);
            }
            args[plugin.arg_index] = value;
        }
        args
    }

    /// Load every plugin module into its own in-process runner.
    pub fn load_plugins(&self, config: &SandboxConfig) -> Result<Vec<VmRunner>> {
        self.plugins
            .iter()
            .enumerate()
            .map(|(slot, plugin)| -> Result<VmRunner> {
                let vm = VmRunner::from_file(&plugin.module, config.clone())
                    .map_err(|source| HostError::SlotCall { slot, source })?;
                tracing::info!(slot, module = %plugin.module.display(), "plugin loaded");
                Ok(vm)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Link farm
// ---------------------------------------------------------------------------

/// Scratch directory holding the forwarder under one name per slot.
///
/// Links are hard links so that `argv[0]` keeps the slot name; when the
/// scratch directory is on another filesystem the binary is copied instead.
/// The directory is removed on drop.
#[derive(Debug)]
pub struct LinkFarm {
    dir: TempDir,
    count: usize,
}

impl LinkFarm {
    /// Link `forwarder` as `1..=count`.
    pub fn create(forwarder: &Path, count: usize) -> Result<Self> {
        if !forwarder.is_file() {
            return Err(HostError::Toolchain(format!(
                "forwarder binary not found at {}",
                forwarder.display()
            )));
        }
        let dir = tempfile::Builder::new().prefix("wacro-links-").tempdir()?;

        for slot in 0..count {
            let dest = dir.path().join(link_name(slot));
            if let Err(e) = std::fs::hard_link(forwarder, &dest) {
                tracing::warn!(error = %e, dest = %dest.display(), "hard link failed, copying forwarder");
                std::fs::copy(forwarder, &dest)?;
            }
        }
        tracing::debug!(dir = %dir.path().display(), count, "forwarder links ready");
        Ok(Self { dir, count })
    }

    /// Directory holding the links.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether there are no links.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Path of the link for `slot`.
    pub fn link_path(&self, slot: usize) -> PathBuf {
        self.dir.path().join(link_name(slot))
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Router-side ends of one slot's pipes.
#[derive(Debug)]
pub struct SlotPipes {
    /// Requests written by the forwarder.
    pub requests: pipe::Receiver,
    /// Responses read by the forwarder.
    pub responses: pipe::Sender,
}

/// A running toolchain and the router ends of its slot pipes.
#[derive(Debug)]
pub struct SpawnedToolchain {
    /// The toolchain process.
    pub child: Child,
    /// One entry per plugin, in slot order.
    pub slots: Vec<SlotPipes>,
}

/// Start the toolchain with every slot's pipes on their fixed descriptors.
///
/// Must be called from within a tokio runtime.
pub fn spawn_toolchain(invocation: &ToolchainInvocation, links: &LinkFarm) -> Result<SpawnedToolchain> {
    let count = invocation.plugins().len();
    let floor = SlotFds::first_free(count);

    let mut child_ends = Vec::with_capacity(count);
    let mut router_ends = Vec::with_capacity(count);
    for _ in 0..count {
        let (request_read, request_write) = io::pipe()?;
        let (response_read, response_write) = io::pipe()?;
        // keep the child's copies clear of the target range so no dup2
        // clobbers a source that is still needed
        child_ends.push((
            raise_fd(OwnedFd::from(request_write), floor)?,
            raise_fd(OwnedFd::from(response_read), floor)?,
        ));
        router_ends.push((OwnedFd::from(request_read), OwnedFd::from(response_write)));
    }

    let plan: Vec<(RawFd, RawFd)> = child_ends
        .iter()
        .enumerate()
        .flat_map(|(slot, (request, response))| {
            let fds = SlotFds::for_slot(slot);
            [
                (request.as_raw_fd(), fds.request),
                (response.as_raw_fd(), fds.response),
            ]
        })
        .collect();

    let mut cmd = Command::new(invocation.program());
    cmd.args(invocation.rewritten_args(links))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    // SAFETY: the closure only calls dup2, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            for &(source, target) in &plan {
                if libc::dup2(source, target) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        HostError::Toolchain(format!(
            "failed to start {}: {e}",
            invocation.program().to_string_lossy()
        ))
    })?;
    // the child holds its own copies now
    drop(child_ends);

    let slots = router_ends
        .into_iter()
        .map(|(requests, responses)| -> Result<SlotPipes> {
            Ok(SlotPipes {
                requests: pipe::Receiver::from_owned_fd(requests)?,
                responses: pipe::Sender::from_owned_fd(responses)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        program = %invocation.program().to_string_lossy(),
        pid = child.id().unwrap_or_default(),
        slots = count,
        "toolchain started"
    );
    Ok(SpawnedToolchain { child, slots })
}

/// Run the toolchain with one handler per plugin and wait for it to exit.
///
/// A router failure kills the toolchain and is returned as the error.
pub async fn route_toolchain<H>(
    invocation: &ToolchainInvocation,
    links: &LinkFarm,
    handlers: Vec<H>,
) -> Result<ExitStatus>
where
    H: SlotHandler + 'static,
{
    if handlers.len() != invocation.plugins().len() {
        return Err(HostError::Toolchain(format!(
            "{} handler(s) for {} plugin(s)",
            handlers.len(),
            invocation.plugins().len()
        )));
    }

    let SpawnedToolchain { mut child, slots } = spawn_toolchain(invocation, links)?;
    let mut router = Router::new();
    for (pipes, handler) in slots.into_iter().zip(handlers) {
        router.add_slot(pipes.requests, pipes.responses, handler);
    }

    if let Err(e) = router.run().await {
        tracing::error!(error = %e, "router failed, stopping toolchain");
        if let Err(kill) = child.start_kill() {
            tracing::warn!(error = %kill, "could not signal toolchain");
        }
        let _ = child.wait().await;
        return Err(e);
    }

    let status = child.wait().await?;
    tracing::info!(%status, "toolchain exited");
    Ok(status)
}

/// Duplicate `fd` to the lowest free descriptor `>= floor` (close-on-exec).
fn raise_fd(fd: OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() >= floor {
        return Ok(fd);
    }
    // SAFETY: `fd` is a valid open descriptor for the duration of the call.
    let raised = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if raised == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}
