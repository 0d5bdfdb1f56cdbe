//! wacro host.
//!
//! - **[`connection`]** -- [`HostConnection`], the framed request loop that
//!   serves one [`MacroRunner`](wacro_sandbox::MacroRunner) over a stream
//!   pair (normally stdin/stdout).
//! - **[`router`]** -- [`Router`], which serves many sandbox functions over
//!   independent pipe pairs at once.
//! - **[`toolchain`]** -- rewrites a toolchain command line so each
//!   sandboxed plugin is reached through the forwarder stub, then starts it
//!   with the router attached (unix only).
//! - **[`error`]** -- [`HostError`].

pub mod connection;
pub mod error;
pub mod router;
#[cfg(unix)]
pub mod toolchain;

pub use connection::{ConnectionState, HostConnection};
pub use error::{HostError, Result};
pub use router::{Router, SlotHandler};
#[cfg(unix)]
pub use toolchain::{LinkFarm, PluginArg, ToolchainInvocation, route_toolchain, spawn_toolchain};
