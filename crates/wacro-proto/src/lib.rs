//! wacro wire protocol.
//!
//! - **[`frame`]** -- 8-byte little-endian length-prefixed frames with
//!   blocking readers/writers, plus async ones behind the `async` feature.
//! - **[`slot`]** -- descriptor numbering shared by the router and the
//!   forwarder stub.
//! - **[`error`]** -- [`ProtoError`] enumerates every protocol violation.

pub mod error;
pub mod frame;
pub mod slot;

pub use error::{ProtoError, Result};
pub use frame::{
    DEFAULT_MAX_PAYLOAD, FrameReader, FrameWriter, HEADER_LEN, MIN_PAYLOAD_LEN, decode_header,
    encode,
};
pub use slot::SlotFds;
