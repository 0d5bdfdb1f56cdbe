//! `wacro` binary.
//!
//! stdout is reserved for protocol frames in `serve` and for the bridge in
//! `isolate-worker`; all diagnostics go to stderr through `tracing`.

mod cli;
mod config;
mod helpers;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use wacro_host::HostConnection;
use wacro_sandbox::load_runner;

use cli::{Cli, Commands, LimitArgs};
use config::WacroConfig;

/// Request sent by `check` when none is given.
const CAPABILITY_PROBE: &str = r#"{"getCapability":{"capability":{"protocolVersion":1}}}"#;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            helpers::init_tracing("warn");
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    helpers::init_tracing(&config.log_level);

    let result = match cli.command {
        Commands::Serve { module, limits } => {
            config.apply_limits(&limits);
            cmd_serve(config, module).await
        }
        Commands::Check {
            module,
            request,
            limits,
        } => {
            config.apply_limits(&limits);
            cmd_check(config, module, request).await
        }
        Commands::Route {
            forwarder,
            limits,
            toolchain,
        } => cmd_route(config, forwarder, &limits, toolchain).await,
        Commands::IsolateWorker => cmd_isolate_worker(),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<WacroConfig> {
    let mut config = WacroConfig::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_serve(config: WacroConfig, module: PathBuf) -> Result<ExitCode> {
    let (name, wasm) = helpers::read_module(&module)?;
    let worker = helpers::worker_program();
    let mut runner = load_runner(&name, &wasm, config.sandbox, worker.as_ref())
        .await
        .with_context(|| format!("failed to load {}", module.display()))?;

    let served = HostConnection::stdio()
        .run(&mut *runner)
        .await
        .context("plugin connection failed")?;
    info!(module = %name, served, "serve finished");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_check(config: WacroConfig, module: PathBuf, request: Option<String>) -> Result<ExitCode> {
    let (name, wasm) = helpers::read_module(&module)?;
    let worker = helpers::worker_program();
    let mut runner = load_runner(&name, &wasm, config.sandbox, worker.as_ref())
        .await
        .with_context(|| format!("failed to load {}", module.display()))?;

    let request = request.as_deref().unwrap_or(CAPABILITY_PROBE);
    let response = runner.handle(request).await.context("request failed")?;
    info!(module = %name, backend = %runner.kind(), "check passed");
    println!("{response}");
    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
async fn cmd_route(
    mut config: WacroConfig,
    forwarder: Option<PathBuf>,
    limits: &LimitArgs,
    toolchain: Vec<std::ffi::OsString>,
) -> Result<ExitCode> {
    use wacro_host::{LinkFarm, ToolchainInvocation, route_toolchain};

    config.apply_limits(limits);
    let invocation = ToolchainInvocation::parse(toolchain)?;
    if invocation.plugins().is_empty() {
        warn!("toolchain invocation names no .wasm plugins");
    }

    let forwarder = helpers::resolve_forwarder(forwarder.or(config.router.forwarder))?;
    let links = LinkFarm::create(&forwarder, invocation.plugins().len())?;
    let handlers: Vec<_> = invocation
        .load_plugins(&config.sandbox)?
        .into_iter()
        .map(|mut vm| move |request: &[u8]| vm.call_bytes(request))
        .collect();
    info!(plugins = handlers.len(), links = %links.dir().display(), "routing toolchain");

    let status = route_toolchain(&invocation, &links, handlers).await?;
    match status.code() {
        Some(code) => Ok(ExitCode::from(u8::try_from(code).unwrap_or(1))),
        None => {
            warn!(%status, "toolchain terminated by signal");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(not(unix))]
async fn cmd_route(
    _config: WacroConfig,
    _forwarder: Option<PathBuf>,
    _limits: &LimitArgs,
    _toolchain: Vec<std::ffi::OsString>,
) -> Result<ExitCode> {
    anyhow::bail!("toolchain routing needs unix descriptor inheritance")
}

fn cmd_isolate_worker() -> Result<ExitCode> {
    wacro_sandbox::serve_worker(std::io::stdin().lock(), std::io::stdout().lock())?;
    Ok(ExitCode::SUCCESS)
}
