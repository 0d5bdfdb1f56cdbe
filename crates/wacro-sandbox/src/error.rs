//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`].  The
//! variants fall into two fatal families: *load errors* (the module cannot
//! be brought up, see [`SandboxError::is_load_error`]) and *call errors*
//! (a single `handle` failed mid-flight).  Neither is ever retried.

/// Unified error type for the WebAssembly sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Wasm module failed to compile (e.g. invalid bytecode).
    #[error("module failed to compile: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated or initialised.
    #[error("module failed to instantiate: {0}")]
    Instantiation(String),

    /// A required ABI export is absent.
    #[error("module does not export required `{name}`")]
    MissingExport {
        /// The export name that was looked up.
        name: String,
    },

    /// A required ABI export exists but has the wrong shape.
    #[error("export `{name}` has the wrong signature: {reason}")]
    ExportSignature {
        /// The export name.
        name: String,
        /// What did not match.
        reason: String,
    },

    /// The module imports something the sandbox refuses to stub.
    #[error("unsupported import `{module}::{name}`: only functions can be stubbed")]
    UnsupportedImport {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
    },

    /// The module's ABI version marker names an unsupported version.
    #[error("unsupported wacro ABI version {found} (expected {expected})")]
    AbiVersion {
        /// Version found in the module.
        found: u32,
        /// Version this host speaks.
        expected: u32,
    },

    /// A guest call returned something the ABI does not allow.
    #[error("guest call failed: {0}")]
    Execution(String),

    /// A Wasm trap was raised during a guest call.
    #[error("guest trapped: {0}")]
    Trap(String),

    /// The guest exhausted its per-call fuel budget.
    #[error("fuel exhausted (budget: {budget})")]
    FuelExhausted {
        /// The configured budget.
        budget: u64,
    },

    /// The guest call exceeded its wall-clock budget.
    #[error("guest call exceeded its {limit_ms}ms deadline")]
    Timeout {
        /// The configured limit in milliseconds.
        limit_ms: u64,
    },

    /// A guest address range fell outside linear memory.
    #[error("guest access out of bounds: {len} bytes at {addr:#x} (memory is {memory_size} bytes)")]
    OutOfBounds {
        /// Start address of the access.
        addr: u32,
        /// Length of the access.
        len: u64,
        /// Current linear memory size.
        memory_size: usize,
    },

    /// The request does not fit the 32-bit guest address space.
    #[error("request of {len} bytes does not fit in guest memory")]
    RequestTooLarge {
        /// Request length in bytes.
        len: usize,
    },

    /// The guest allocator returned a null address.
    #[error("guest allocator failed to provide {size} bytes")]
    AllocationFailed {
        /// Requested size.
        size: u32,
    },

    /// The guest answered with fewer bytes than a frame may carry.
    #[error("guest response of {len} bytes is shorter than the {min}-byte frame minimum", min = wacro_proto::MIN_PAYLOAD_LEN)]
    ResponseTooShort {
        /// Response length in bytes.
        len: usize,
    },

    /// The guest response was not valid UTF-8.
    #[error("guest response is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The isolated worker failed to load the module.
    #[error("isolated worker failed to load module: {0}")]
    WorkerLoad(String),

    /// The bridge to the isolated worker failed or the worker reported a
    /// call failure.
    #[error("isolated bridge error: {0}")]
    Bridge(String),

    /// The requested backend or configuration cannot be honoured.
    #[error("sandbox configuration error: {0}")]
    Config(String),

    /// Framing failure on the isolated bridge.
    #[error("bridge protocol error: {0}")]
    Proto(#[from] wacro_proto::ProtoError),

    /// An I/O error occurred (e.g. reading a `.wasm` file from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether this error happened while bringing a module up (as opposed
    /// to during a call).
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Compilation(_)
                | Self::Instantiation(_)
                | Self::MissingExport { .. }
                | Self::ExportSignature { .. }
                | Self::UnsupportedImport { .. }
                | Self::AbiVersion { .. }
                | Self::WorkerLoad(_)
        )
    }
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
