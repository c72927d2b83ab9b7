//! Userspace live patching for running Linux processes.
//!
//! The crate attaches to a target with ptrace, drives syscalls inside the
//! target's own address space, models its memory map, resolves its symbols,
//! and links relocatable ELF patch objects over live functions. The
//! `ultask` binary is a thin CLI over this library.

pub mod arch;
pub mod error;
pub mod patch;
mod prelude;
pub mod registry;
pub mod symbols;
pub mod target;

pub use patch::{Patch, PatchState, remove_patch};
pub use target::{OpenFlags, Task};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
