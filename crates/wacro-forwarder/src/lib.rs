//! Forwarder stub.
//!
//! The toolchain spawns this binary as if it were a plugin executable.  It
//! learns its slot from the file name it was started under (`1`, `2`, ...),
//! then shuttles frames, strictly alternating:
//!
//! ```text
//! stdin  --frame-->  fd 3+2i   (router reads)
//! stdout <--frame--  fd 4+2i   (router writes)
//! ```
//!
//! Payloads are never inspected.  The relay stops when either side closes.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};

use wacro_proto::slot::slot_from_invocation;
use wacro_proto::{DEFAULT_MAX_PAYLOAD, FrameReader, FrameWriter, ProtoError, SlotFds};

/// Why the stub stopped early.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    /// The invocation name does not encode a slot.
    #[error("cannot derive a slot from invocation name {0:?}")]
    NotASlot(std::ffi::OsString),

    /// A slot descriptor was not inherited from the router.
    #[error("slot descriptor {fd} is not open: {source}")]
    MissingFd {
        /// The descriptor number.
        fd: RawFd,
        /// The error reported for it.
        source: io::Error,
    },

    /// Framing failed on one of the four streams.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Slot descriptors for a stub started as `argv0`.
pub fn slot_fds(argv0: &OsStr) -> Result<SlotFds, ForwarderError> {
    slot_from_invocation(argv0)
        .map(SlotFds::for_slot)
        .ok_or_else(|| ForwarderError::NotASlot(argv0.to_owned()))
}

/// Take ownership of an inherited descriptor.
pub fn open_inherited(fd: RawFd) -> Result<File, ForwarderError> {
    // SAFETY: F_GETFD only queries descriptor flags.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(ForwarderError::MissingFd {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: the descriptor is open and this process never opened it
    // itself, so nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Relay frames until either side reaches end-of-stream.
///
/// Returns the number of completed request/response exchanges.
pub fn relay<I, O, Q, P>(
    stdin: I,
    stdout: O,
    to_router: Q,
    from_router: P,
) -> Result<u64, ForwarderError>
where
    I: Read,
    O: Write,
    Q: Write,
    P: Read,
{
    let mut requests = FrameReader::new(stdin).with_max_payload(DEFAULT_MAX_PAYLOAD);
    let mut responses = FrameReader::new(from_router).with_max_payload(DEFAULT_MAX_PAYLOAD);
    let mut router = FrameWriter::new(to_router);
    let mut toolchain = FrameWriter::new(stdout);

    let mut exchanges = 0;
    loop {
        let Some(request) = requests.read_frame()? else {
            return Ok(exchanges);
        };
        router.write_frame(&request)?;

        let Some(response) = responses.read_frame()? else {
            return Ok(exchanges);
        };
        toolchain.write_frame(&response)?;
        exchanges += 1;
    }
}
