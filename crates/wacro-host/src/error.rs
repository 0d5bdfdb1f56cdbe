//! Host error types.
//!
//! Everything the connection loop, the router and the toolchain launcher can
//! fail with surfaces as [`HostError`].  None of these are retried: the
//! caller is expected to stop the connection and exit non-zero.

use wacro_proto::ProtoError;
use wacro_sandbox::SandboxError;

/// Unified error type for the wacro host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    // -- Stream errors ------------------------------------------------------
    /// A frame could not be decoded or written.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// A request payload was not UTF-8 text.
    #[error("request payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    // -- Runner errors ------------------------------------------------------
    /// The sandbox runner failed to load or to answer.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    // -- Router errors ------------------------------------------------------
    /// A slot's pipes violated the frame protocol.
    #[error("slot {slot}: {source}")]
    SlotProtocol {
        /// Zero-based slot index.
        slot: usize,
        /// The underlying framing failure.
        source: ProtoError,
    },

    /// A slot's sandbox function failed.
    #[error("slot {slot}: {source}")]
    SlotCall {
        /// Zero-based slot index.
        slot: usize,
        /// The underlying sandbox failure.
        source: SandboxError,
    },

    // -- Toolchain errors ---------------------------------------------------
    /// The toolchain invocation could not be prepared or launched.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// An I/O error outside of framing (links, pipes, process spawn).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// The slot this error belongs to, if any.
    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::SlotProtocol { slot, .. } | Self::SlotCall { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the host crate.
pub type Result<T> = std::result::Result<T, HostError>;
