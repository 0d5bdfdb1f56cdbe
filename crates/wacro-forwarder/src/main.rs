//! `wacro-forwarder` binary.
//!
//! Writes nothing of its own to any stream: stdout belongs to the
//! toolchain's frame protocol and the stub has nobody to report to.

use std::process::ExitCode;

use wacro_forwarder::{ForwarderError, open_inherited, relay, slot_fds};

fn main() -> ExitCode {
    match run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn run() -> Result<u64, ForwarderError> {
    let argv0 = std::env::args_os().next().unwrap_or_default();
    let fds = slot_fds(&argv0)?;
    let to_router = open_inherited(fds.request)?;
    let from_router = open_inherited(fds.response)?;

    relay(
        std::io::stdin().lock(),
        std::io::stdout().lock(),
        to_router,
        from_router,
    )
}
