//! Protocol error types.
//!
//! Every failure to read a well-formed frame surfaces as a [`ProtoError`].
//! Protocol errors are always fatal to the stream they occurred on; a clean
//! end-of-stream at a frame boundary is *not* an error and is reported as
//! `Ok(None)` by the readers instead.

/// Unified error type for the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The stream ended after 1..=7 header bytes.
    #[error("truncated frame header: got {read} of 8 bytes")]
    TruncatedHeader {
        /// Number of header bytes read before end-of-stream.
        read: usize,
    },

    /// The header declared a payload shorter than the protocol minimum.
    #[error("invalid payload size: {size} (minimum is {min})", min = crate::frame::MIN_PAYLOAD_LEN)]
    InvalidPayloadSize {
        /// The declared payload length.
        size: u64,
    },

    /// The stream ended before the declared payload was complete.
    #[error("truncated frame payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload {
        /// Declared payload length.
        expected: u64,
        /// Bytes actually available before end-of-stream.
        actual: u64,
    },

    /// The header declared a payload larger than the reader accepts.
    #[error("payload too large: {size} > {limit}")]
    PayloadTooLarge {
        /// The declared payload length.
        size: u64,
        /// The configured reader limit.
        limit: u64,
    },

    /// Underlying stream I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the proto crate.
pub type Result<T> = std::result::Result<T, ProtoError>;
