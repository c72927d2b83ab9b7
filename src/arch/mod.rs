//! Architecture-specific binary encodings.
//!
//! Everything in the per-ISA submodules that only computes bytes (branch
//! encoders, jump-table entries, relocation values) is compiled on every
//! host so it can be unit-tested anywhere. The pieces tied to the host ABI
//! (`user_regs_struct` layout, syscall argument registers) are gated on
//! `target_arch` and surfaced through the `native` alias.

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64 as native;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as native;

/// A computed relocation store, already in its final width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaValue {
    Word32(u32),
    Word64(u64),
}

impl RelaValue {
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            RelaValue::Word32(v) => v.to_le_bytes().to_vec(),
            RelaValue::Word64(v) => v.to_le_bytes().to_vec(),
        }
    }
}
