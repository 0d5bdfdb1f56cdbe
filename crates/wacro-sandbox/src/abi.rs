//! Guest memory ABI.
//!
//! A loadable guest module exports three functions and its linear memory:
//!
//! | Export | Signature | Contract |
//! |--------|-----------|----------|
//! | `wacro_malloc` | `(size: u32) -> addr` | caller owns `[addr, addr+size)` until released |
//! | `wacro_free` | `(addr)` | returns a region to the guest allocator |
//! | `wacro_parse` | `(addr, size) -> addr` | consumes the input region, returns an owned `[len: u32 LE][len bytes]` region |
//! | `memory` | linear memory | the only memory the host touches |
//!
//! [`call_guest`] runs the six-step call sequence against any [`GuestAbi`]
//! implementation.  Guest addresses are [`GuestAddr`] values and are only
//! ever resolved through [`guest_slice`] / [`guest_slice_mut`], which
//! bounds-check against the current memory size.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// ABI version this host speaks.
pub const ABI_VERSION: u32 = 1;

/// Name of the optional custom section carrying the guest's ABI version.
pub const ABI_VERSION_SECTION: &str = "wacro_abi";

/// Size of the length prefix on response regions.
pub const RESPONSE_PREFIX_LEN: u32 = 4;

// ---------------------------------------------------------------------------
// GuestAddr
// ---------------------------------------------------------------------------

/// An offset into a guest's linear memory.
///
/// Deliberately not convertible to a host pointer; resolve it with
/// [`guest_slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddr(u32);

impl GuestAddr {
    /// The null guest address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw 32-bit guest offset.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit offset.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `self + by`, failing if the result leaves the 32-bit address space.
    pub fn offset(self, by: u32) -> Result<Self> {
        self.0
            .checked_add(by)
            .map(Self)
            .ok_or(SandboxError::OutOfBounds {
                addr: self.0,
                len: u64::from(by),
                memory_size: u32::MAX as usize,
            })
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Resolve `[addr, addr+len)` inside `memory`.
pub fn guest_slice(memory: &[u8], addr: GuestAddr, len: usize) -> Result<&[u8]> {
    let range = checked_range(memory.len(), addr, len)?;
    Ok(&memory[range])
}

/// Resolve `[addr, addr+len)` inside `memory` for writing.
pub fn guest_slice_mut(memory: &mut [u8], addr: GuestAddr, len: usize) -> Result<&mut [u8]> {
    let range = checked_range(memory.len(), addr, len)?;
    Ok(&mut memory[range])
}

fn checked_range(memory_size: usize, addr: GuestAddr, len: usize) -> Result<std::ops::Range<usize>> {
    let start = addr.get() as usize;
    match start.checked_add(len) {
        Some(end) if end <= memory_size => Ok(start..end),
        _ => Err(SandboxError::OutOfBounds {
            addr: addr.get(),
            len: len as u64,
            memory_size,
        }),
    }
}

// ---------------------------------------------------------------------------
// Export names
// ---------------------------------------------------------------------------

/// Export names a guest module must provide.
///
/// Names are a versioned contract: a mismatch is a load error, and the
/// runner never falls back to alternate spellings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbiNames {
    /// Allocation export, `(u32) -> u32`.
    pub allocate: String,
    /// Release export, `(u32) -> ()`.
    pub release: String,
    /// Processing export, `(u32, u32) -> u32`.
    pub process: String,
    /// Linear memory export.
    pub memory: String,
    /// Initialisation exports, tried in order; the first one present is
    /// called once after instantiation.
    pub init: Vec<String>,
}

impl Default for AbiNames {
    fn default() -> Self {
        Self {
            allocate: "wacro_malloc".to_owned(),
            release: "wacro_free".to_owned(),
            process: "wacro_parse".to_owned(),
            memory: "memory".to_owned(),
            init: vec!["_start".to_owned(), "_initialize".to_owned()],
        }
    }
}

// ---------------------------------------------------------------------------
// Call sequence
// ---------------------------------------------------------------------------

/// Host-side view of a guest that satisfies the ABI.
pub trait GuestAbi {
    /// Call the guest allocator.
    fn allocate(&mut self, size: u32) -> Result<GuestAddr>;

    /// Return a region to the guest allocator.
    fn release(&mut self, addr: GuestAddr) -> Result<()>;

    /// Hand `[addr, addr+size)` to the guest and get the response region.
    fn process(&mut self, addr: GuestAddr, size: u32) -> Result<GuestAddr>;

    /// Copy `len` bytes out of linear memory.
    fn read_bytes(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>>;

    /// Copy `bytes` into linear memory at `addr`.
    fn write_bytes(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<()>;
}

/// Run one request through the guest and return the raw response bytes.
///
/// 1. allocate `len(request)`
/// 2. copy the request in
/// 3. `process` (the guest now owns the input region)
/// 4. read the 4-byte LE length at the returned address
/// 5. read that many bytes after it
/// 6. release the response region
pub fn call_guest<A: GuestAbi + ?Sized>(abi: &mut A, request: &[u8]) -> Result<Vec<u8>> {
    let size = u32::try_from(request.len())
        .map_err(|_| SandboxError::RequestTooLarge { len: request.len() })?;

    let input = abi.allocate(size)?;
    if input.is_null() {
        return Err(SandboxError::AllocationFailed { size });
    }
    abi.write_bytes(input, request)?;
    tracing::trace!(addr = %input, size, "request copied into guest memory");

    let output = abi.process(input, size)?;
    if output.is_null() {
        return Err(SandboxError::Execution(
            "guest returned a null response region".into(),
        ));
    }

    let response = read_length_prefixed(abi, output)?;
    tracing::trace!(addr = %output, len = response.len(), "response read from guest memory");

    abi.release(output)?;
    Ok(response)
}

/// Read a `[len: u32 LE][len bytes]` region.
pub fn read_length_prefixed<A: GuestAbi + ?Sized>(abi: &A, addr: GuestAddr) -> Result<Vec<u8>> {
    let prefix = abi.read_bytes(addr, RESPONSE_PREFIX_LEN)?;
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    abi.read_bytes(addr.offset(RESPONSE_PREFIX_LEN)?, len)
}

// ---------------------------------------------------------------------------
// ABI version marker
// ---------------------------------------------------------------------------

const WASM_MAGIC: [u8; 4] = *b"\0asm";
const CUSTOM_SECTION_ID: u8 = 0;

/// Whether `bytes` is a binary module (as opposed to text format).
pub fn is_binary_module(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes[..4] == WASM_MAGIC
}

/// Find the `wacro_abi` custom section and decode its version.
///
/// Returns `Ok(None)` when the module carries no marker.
pub fn abi_version(bytes: &[u8]) -> Result<Option<u32>> {
    if !is_binary_module(bytes) {
        return Ok(None);
    }
    let malformed = || SandboxError::Compilation("malformed section table".into());

    let mut pos = 8;
    while pos < bytes.len() {
        let id = bytes[pos];
        pos += 1;
        let size = read_uleb32(bytes, &mut pos).ok_or_else(malformed)? as usize;
        let end = pos.checked_add(size).filter(|&e| e <= bytes.len()).ok_or_else(malformed)?;

        if id == CUSTOM_SECTION_ID {
            let mut cursor = pos;
            let name_len = read_uleb32(bytes, &mut cursor).ok_or_else(malformed)? as usize;
            let name_end = cursor
                .checked_add(name_len)
                .filter(|&e| e <= end)
                .ok_or_else(malformed)?;
            if &bytes[cursor..name_end] == ABI_VERSION_SECTION.as_bytes() {
                let payload = &bytes[name_end..end];
                if payload.len() < 4 {
                    return Err(SandboxError::Compilation(format!(
                        "`{ABI_VERSION_SECTION}` section is {} bytes, expected 4",
                        payload.len()
                    )));
                }
                let version = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                return Ok(Some(version));
            }
        }
        pos = end;
    }
    Ok(None)
}

/// Reject modules whose ABI marker names another version.
pub fn check_abi_version(bytes: &[u8]) -> Result<()> {
    match abi_version(bytes)? {
        Some(found) if found != ABI_VERSION => Err(SandboxError::AbiVersion {
            found,
            expected: ABI_VERSION,
        }),
        _ => Ok(()),
    }
}

fn read_uleb32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let mut result: u32 = 0;
    for shift in (0..35).step_by(7) {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        result |= u32::from(byte & 0x7f).checked_shl(shift)?;
        if byte & 0x80 == 0 {
            return Some(result);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory guest with a bump allocator whose `process` uppercases.
    struct FakeGuest {
        memory: Vec<u8>,
        next: u32,
        released: Vec<GuestAddr>,
    }

    impl FakeGuest {
        fn new() -> Self {
            Self {
                memory: vec![0; 4096],
                next: 64,
                released: Vec::new(),
            }
        }
    }

    impl GuestAbi for FakeGuest {
        fn allocate(&mut self, size: u32) -> Result<GuestAddr> {
            let addr = GuestAddr::new(self.next);
            self.next += size.max(1);
            Ok(addr)
        }

        fn release(&mut self, addr: GuestAddr) -> Result<()> {
            self.released.push(addr);
            Ok(())
        }

        fn process(&mut self, addr: GuestAddr, size: u32) -> Result<GuestAddr> {
            let input = self.read_bytes(addr, size)?.to_ascii_uppercase();
            let out = self.allocate(size + 4)?;
            self.write_bytes(out, &size.to_le_bytes())?;
            self.write_bytes(out.offset(4)?, &input)?;
            Ok(out)
        }

        fn read_bytes(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>> {
            guest_slice(&self.memory, addr, len as usize).map(<[u8]>::to_vec)
        }

        fn write_bytes(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<()> {
            guest_slice_mut(&mut self.memory, addr, bytes.len())?.copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn call_sequence_reads_prefixed_response_and_releases_it() {
        let mut guest = FakeGuest::new();
        let response = call_guest(&mut guest, b"{\"a\":1}").unwrap();
        assert_eq!(response, b"{\"A\":1}");
        // input at 64 (7 bytes), output at 71
        assert_eq!(guest.released, vec![GuestAddr::new(71)]);
    }

    #[test]
    fn null_allocation_is_an_error() {
        struct NullAlloc(FakeGuest);
        impl GuestAbi for NullAlloc {
            fn allocate(&mut self, _: u32) -> Result<GuestAddr> {
                Ok(GuestAddr::NULL)
            }
            fn release(&mut self, addr: GuestAddr) -> Result<()> {
                self.0.release(addr)
            }
            fn process(&mut self, addr: GuestAddr, size: u32) -> Result<GuestAddr> {
                self.0.process(addr, size)
            }
            fn read_bytes(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>> {
                self.0.read_bytes(addr, len)
            }
            fn write_bytes(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<()> {
                self.0.write_bytes(addr, bytes)
            }
        }

        let err = call_guest(&mut NullAlloc(FakeGuest::new()), b"{}").unwrap_err();
        assert!(matches!(err, SandboxError::AllocationFailed { size: 2 }));
    }

    #[test]
    fn slice_access_is_bounds_checked() {
        let memory = vec![0u8; 16];
        assert!(guest_slice(&memory, GuestAddr::new(8), 8).is_ok());
        let err = guest_slice(&memory, GuestAddr::new(8), 9).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::OutOfBounds {
                addr: 8,
                len: 9,
                memory_size: 16
            }
        ));
        assert!(guest_slice(&memory, GuestAddr::new(u32::MAX), 2).is_err());
    }

    #[test]
    fn offset_overflow_is_rejected() {
        assert!(GuestAddr::new(u32::MAX - 1).offset(4).is_err());
        assert_eq!(GuestAddr::new(8).offset(4).unwrap(), GuestAddr::new(12));
    }

    fn module_with_custom_section(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut section = vec![name.len() as u8];
        section.extend_from_slice(name.as_bytes());
        section.extend_from_slice(payload);

        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.push(CUSTOM_SECTION_ID);
        bytes.push(section.len() as u8);
        bytes.extend(section);
        bytes
    }

    #[test]
    fn abi_version_found_in_custom_section() {
        let bytes = module_with_custom_section(ABI_VERSION_SECTION, &1u32.to_le_bytes());
        assert_eq!(abi_version(&bytes).unwrap(), Some(1));
        assert!(check_abi_version(&bytes).is_ok());
    }

    #[test]
    fn other_custom_sections_are_ignored() {
        let bytes = module_with_custom_section("name", &[0, 1, 2]);
        assert_eq!(abi_version(&bytes).unwrap(), None);
    }

    #[test]
    fn unsupported_abi_version_rejected() {
        let bytes = module_with_custom_section(ABI_VERSION_SECTION, &2u32.to_le_bytes());
        let err = check_abi_version(&bytes).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::AbiVersion {
                found: 2,
                expected: 1
            }
        ));
    }

    #[test]
    fn text_modules_are_not_inspected() {
        assert_eq!(abi_version(b"(module)").unwrap(), None);
    }

    #[test]
    fn multi_byte_leb128() {
        let bytes = [0xe5, 0x8e, 0x26];
        let mut pos = 0;
        assert_eq!(read_uleb32(&bytes, &mut pos), Some(624_485));
        assert_eq!(pos, 3);
    }
}
