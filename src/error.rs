//! Machine-matchable error categories.
//!
//! Most of the crate reports failures through `anyhow` with context chains,
//! but the two families a caller may need to dispatch on keep their own
//! types: syscalls that failed *inside the target* (carrying the target's
//! errno) and relocation failures (which decide whether a patch unwinds).

use thiserror::Error;

/// A syscall executed remotely in the target returned an error.
///
/// The errno is the target's, extracted from the kernel return value in the
/// ABI return register; it is unrelated to our own `errno`.
#[derive(Debug, Error)]
#[error("remote syscall {nr} failed in target with errno {errno}")]
pub struct RemoteError {
    pub nr: i64,
    pub errno: i32,
}

impl RemoteError {
    pub fn errno(&self) -> nix::errno::Errno {
        nix::errno::Errno::from_raw(self.errno)
    }
}

/// Relocation of a patch object against the target failed.
///
/// Any of these is fatal to the patch being loaded; the loader unwinds the
/// staged image and no call site is touched.
#[derive(Debug, Error)]
pub enum RelocationError {
    #[error("undefined symbol `{0}` not found in target")]
    Unresolved(String),
    #[error("unsupported relocation type {r_type} at {place:#x}")]
    Unsupported { r_type: u32, place: u64 },
    #[error("relocation type {r_type} at {place:#x} overflows: value {value:#x}")]
    Overflow { r_type: u32, place: u64, value: u64 },
    #[error("relocation against section with no file backing at {place:#x}")]
    NoBits { place: u64 },
}

/// A branch could not be encoded for the requested addresses.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("branch from {ip:#x} to {dst:#x} exceeds direct reach")]
    OutOfReach { ip: u64, dst: u64 },
    #[error("branch address {addr:#x} is not instruction-aligned")]
    Misaligned { addr: u64 },
}
