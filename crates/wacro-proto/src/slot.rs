//! Slot file-descriptor layout.
//!
//! The router hands every forwarder stub a dedicated pipe pair at fixed
//! descriptor numbers so that a single stub binary can serve any slot:
//!
//! | Slot | Request fd (stub writes) | Response fd (stub reads) |
//! |------|--------------------------|--------------------------|
//! | 0    | 3                        | 4                        |
//! | 1    | 5                        | 6                        |
//! | i    | 3 + 2i                   | 4 + 2i                   |
//!
//! Stubs are linked under 1-based names (`1`, `2`, ...) and recover their
//! slot index from `argv[0]`.

use std::ffi::OsStr;
use std::path::Path;

/// First descriptor number used by slot 0.
pub const FIRST_SLOT_FD: i32 = 3;

/// Descriptor pair owned by one slot, as seen by the forwarder stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFds {
    /// Descriptor the stub writes requests to (router reads).
    pub request: i32,
    /// Descriptor the stub reads responses from (router writes).
    pub response: i32,
}

impl SlotFds {
    /// Descriptor numbers for slot `index`.
    pub fn for_slot(index: usize) -> Self {
        let request = FIRST_SLOT_FD + 2 * index as i32;
        Self {
            request,
            response: request + 1,
        }
    }

    /// Lowest descriptor number guaranteed free of any slot assignment when
    /// `slots` slots are in use.
    pub fn first_free(slots: usize) -> i32 {
        FIRST_SLOT_FD + 2 * slots as i32
    }
}

/// File name a stub is linked under for slot `index`.
pub fn link_name(index: usize) -> String {
    (index + 1).to_string()
}

/// Recover the slot index from a stub's invocation name.
///
/// Only the final path component is considered; it must be a positive
/// decimal integer.
pub fn slot_from_invocation(argv0: &OsStr) -> Option<usize> {
    let name = Path::new(argv0).file_name()?.to_str()?;
    let number: usize = name.parse().ok()?;
    number.checked_sub(1)
}
