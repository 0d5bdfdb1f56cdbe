//! Process-isolated backend.
//!
//! [`IsolatedRunner`] keeps the guest in a separate worker process with a
//! cleared environment and talks to it over a framed bridge on the
//! worker's stdin/stdout.  Every bridge message is a JSON document in its
//! own frame, with one exception: the frame following `load` carries the
//! raw module bytes.
//!
//! ```text
//! host                                  worker
//!  | -- {"load":{"name","config"}} ----> |
//!  | -- <module bytes> ----------------> |
//!  | <--------------- {"ready":{info}} -- |   or {"failed":{..,"load":true}}
//!  | -- {"handle":{"request"}} --------> |
//!  | <----- {"response":{"response"}} -- |   or {"failed":{..,"load":false}}
//! ```
//!
//! The worker ([`serve_worker`]) runs the in-process VM and exits after
//! reporting any failure, so one failed call ends the bridge.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use wacro_proto::{DEFAULT_MAX_PAYLOAD, FrameReader, FrameWriter};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::module::ModuleInfo;
use crate::runner::{MacroRunner, RunnerKind};
use crate::vm::VmRunner;

/// Host to worker messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Load a module; the next frame holds its bytes.
    Load {
        /// Display name for logs.
        name: String,
        /// Limits and ABI names to load with.
        config: SandboxConfig,
    },
    /// Run one request through the loaded module.
    Handle {
        /// Request text.
        request: String,
    },
}

/// Worker to host messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeReply {
    /// The module is loaded and initialised.
    Ready {
        /// Metadata gathered while compiling.
        info: ModuleInfo,
    },
    /// Response to a `handle` request.
    Response {
        /// Response text.
        response: String,
    },
    /// The worker failed and is about to exit.
    Failed {
        /// Rendered error.
        message: String,
        /// Whether the failure happened while loading.
        load: bool,
    },
}

// ---------------------------------------------------------------------------
// Worker program
// ---------------------------------------------------------------------------

/// Command line that starts a worker speaking the bridge protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerProgram {
    /// A worker started as `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether the executable exists.
    pub fn is_available(&self) -> bool {
        self.program.is_file()
    }
}

// ---------------------------------------------------------------------------
// IsolatedRunner
// ---------------------------------------------------------------------------

/// A guest module running in a worker process.
#[derive(Debug)]
pub struct IsolatedRunner {
    info: ModuleInfo,
    child: Child,
    reader: FrameReader<ChildStdout>,
    writer: FrameWriter<ChildStdin>,
}

impl IsolatedRunner {
    /// Start a worker and load `wasm` into it.
    pub async fn spawn(
        worker: &WorkerProgram,
        name: &str,
        wasm: &[u8],
        config: &SandboxConfig,
    ) -> Result<Self> {
        let mut child = Command::new(&worker.program)
            .args(&worker.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::WorkerLoad(format!(
                    "failed to start {}: {e}",
                    worker.program.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Bridge("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Bridge("worker stdout unavailable".into()))?;
        let mut reader = FrameReader::new(stdout).with_max_payload(DEFAULT_MAX_PAYLOAD);
        let mut writer = FrameWriter::new(stdin);

        let load = BridgeRequest::Load {
            name: name.to_owned(),
            config: config.clone(),
        };
        writer.send_frame(&to_json(&load)?).await?;
        writer.send_frame(wasm).await?;

        let info = match read_reply(&mut reader).await? {
            Some(BridgeReply::Ready { info }) => info,
            Some(BridgeReply::Failed { message, .. }) => return Err(SandboxError::WorkerLoad(message)),
            Some(other) => {
                return Err(SandboxError::Bridge(format!(
                    "unexpected reply during load: {other:?}"
                )));
            }
            None => {
                return Err(SandboxError::WorkerLoad(
                    "worker exited before acknowledging the module".into(),
                ));
            }
        };

        tracing::info!(
            module = name,
            pid = child.id().unwrap_or_default(),
            "isolated runner ready"
        );
        Ok(Self {
            info,
            child,
            reader,
            writer,
        })
    }

    /// Metadata reported by the worker.
    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    /// Close the bridge and wait for the worker to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        let status = self.child.wait().await?;
        tracing::debug!(module = %self.info.name, %status, "isolated worker exited");
        Ok(())
    }

    /// Send one message and wait for the reply.
    ///
    /// This is the only point where `handle` suspends.
    async fn bridge(&mut self, message: &BridgeRequest) -> Result<BridgeReply> {
        self.writer.send_frame(&to_json(message)?).await?;
        read_reply(&mut self.reader)
            .await?
            .ok_or_else(|| SandboxError::Bridge("worker closed the bridge".into()))
    }
}

#[async_trait]
impl MacroRunner for IsolatedRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Isolated
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    async fn handle(&mut self, request: &str) -> Result<String> {
        let message = BridgeRequest::Handle {
            request: request.to_owned(),
        };
        match self.bridge(&message).await? {
            BridgeReply::Response { response } => Ok(response),
            BridgeReply::Failed { message, .. } => Err(SandboxError::Bridge(message)),
            BridgeReply::Ready { .. } => Err(SandboxError::Bridge(
                "worker sent a second ready message".into(),
            )),
        }
    }
}

async fn read_reply(reader: &mut FrameReader<ChildStdout>) -> Result<Option<BridgeReply>> {
    match reader.next_frame().await? {
        Some(frame) => from_json(&frame).map(Some),
        None => Ok(None),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SandboxError::Bridge(format!("encode failed: {e}")))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| SandboxError::Bridge(format!("malformed bridge message: {e}")))
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// Serve the bridge protocol until `input` reaches end-of-stream.
///
/// Blocking; meant to own the worker process's stdin/stdout.  Returns an
/// error after reporting a failure to the host.
pub fn serve_worker<R: Read, W: Write>(input: R, output: W) -> Result<()> {
    let mut reader = FrameReader::new(input).with_max_payload(DEFAULT_MAX_PAYLOAD);
    let mut writer = FrameWriter::new(output);

    let Some(head) = reader.read_frame()? else {
        return Ok(());
    };
    let (name, config) = match from_json(&head)? {
        BridgeRequest::Load { name, config } => (name, config),
        BridgeRequest::Handle { .. } => {
            return Err(SandboxError::Bridge("expected a load message first".into()));
        }
    };
    let wasm = reader
        .read_frame()?
        .ok_or_else(|| SandboxError::Bridge("module bytes missing after load".into()))?;

    let mut vm = match VmRunner::load(&name, &wasm, config) {
        Ok(vm) => vm,
        Err(e) => {
            reply(&mut writer, &BridgeReply::Failed {
                message: e.to_string(),
                load: true,
            })?;
            return Err(e);
        }
    };
    reply(&mut writer, &BridgeReply::Ready {
        info: vm.info().clone(),
    })?;

    while let Some(frame) = reader.read_frame()? {
        let request = match from_json(&frame)? {
            BridgeRequest::Handle { request } => request,
            BridgeRequest::Load { .. } => {
                return Err(SandboxError::Bridge("module is already loaded".into()));
            }
        };
        match vm.call_text(&request) {
            Ok(response) => reply(&mut writer, &BridgeReply::Response { response })?,
            Err(e) => {
                reply(&mut writer, &BridgeReply::Failed {
                    message: e.to_string(),
                    load: false,
                })?;
                return Err(e);
            }
        }
    }
    tracing::debug!(module = %name, "bridge closed by host");
    Ok(())
}

fn reply<W: Write>(writer: &mut FrameWriter<W>, message: &BridgeReply) -> Result<()> {
    writer.write_frame(&to_json(message)?)?;
    Ok(())
}
