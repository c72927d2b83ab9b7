//! aarch64 encodings: `B`/`BL` imm26 branches, the `LDR x16` jump-table
//! entry, `svc #0`, and the RELA forms a patch object may carry. A64
//! instructions are fixed-width little-endian words, so relocation stores
//! here are read-modify-write of a single instruction.

use crate::error::{EncodeError, RelocationError};

use super::RelaValue;

/// Call-site replacement width: one instruction.
pub const MCOUNT_INSN_SIZE: usize = 4;

/// `svc #0`
pub const SYSCALL_INSN: &[u8] = &[0x01, 0x00, 0x00, 0xd4];

/// `ldr x16, 8; br x16; .quad dst`
pub const JUMP_TABLE_ENTRY_SIZE: usize = 16;

/// imm26 branches reach +-128 MiB.
pub const BRANCH_REACH: u64 = 1 << 27;

fn imm26(ip: u64, dst: u64) -> Result<u32, EncodeError> {
    if ip % 4 != 0 {
        return Err(EncodeError::Misaligned { addr: ip });
    }
    if dst % 4 != 0 {
        return Err(EncodeError::Misaligned { addr: dst });
    }
    let rel = (dst as i64).wrapping_sub(ip as i64);
    if !(-(1 << 27)..1 << 27).contains(&rel) {
        return Err(EncodeError::OutOfReach { ip, dst });
    }
    Ok(((rel >> 2) as u32) & 0x03ff_ffff)
}

/// `bl` reaching `dst` from `ip`.
pub fn encode_call(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    Ok((0x9400_0000 | imm26(ip, dst)?).to_le_bytes())
}

/// Unconditional `b`.
pub fn encode_jmp(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    Ok((0x1400_0000 | imm26(ip, dst)?).to_le_bytes())
}

/// `nop`
pub fn encode_nop() -> [u8; MCOUNT_INSN_SIZE] {
    0xd503_201fu32.to_le_bytes()
}

/// PC-independent far jump through x16, the AAPCS64 intra-procedure-call
/// scratch register: `ldr x16, #8; br x16` followed by the absolute target.
pub fn encode_jump_table_entry(dst: u64) -> [u8; JUMP_TABLE_ENTRY_SIZE] {
    let mut entry = [0u8; JUMP_TABLE_ENTRY_SIZE];
    entry[..4].copy_from_slice(&0x5800_0050u32.to_le_bytes()); // ldr x16, #8
    entry[4..8].copy_from_slice(&0xd61f_0200u32.to_le_bytes()); // br x16
    entry[8..].copy_from_slice(&dst.to_le_bytes());
    entry
}

/// Compute the store for one RELA entry. `insn` is the current instruction
/// word at `place`, needed for the field-insert forms.
pub fn resolve_rela(
    r_type: u32,
    place: u64,
    sym: u64,
    addend: i64,
    insn: u32,
) -> Result<RelaValue, RelocationError> {
    use object::elf;

    let value = sym.wrapping_add_signed(addend);
    match r_type {
        elf::R_AARCH64_ABS64 => Ok(RelaValue::Word64(value)),
        elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => {
            let rel = (value as i64).wrapping_sub(place as i64);
            if !(-(1 << 27)..1 << 27).contains(&rel) || rel % 4 != 0 {
                return Err(RelocationError::Overflow {
                    r_type,
                    place,
                    value,
                });
            }
            let imm = ((rel >> 2) as u32) & 0x03ff_ffff;
            Ok(RelaValue::Word32((insn & !0x03ff_ffff) | imm))
        }
        elf::R_AARCH64_ADR_PREL_PG_HI21 => {
            let rel = ((value & !0xfff) as i64).wrapping_sub((place & !0xfff) as i64);
            if !(-(1i64 << 32)..1i64 << 32).contains(&rel) {
                return Err(RelocationError::Overflow {
                    r_type,
                    place,
                    value,
                });
            }
            let imm = ((rel >> 12) as u32) & 0x1f_ffff;
            let immlo = imm & 0x3;
            let immhi = imm >> 2;
            let insn = insn & !((0x3 << 29) | (0x7_ffff << 5));
            Ok(RelaValue::Word32(insn | (immlo << 29) | (immhi << 5)))
        }
        elf::R_AARCH64_ADD_ABS_LO12_NC => {
            let imm = (value & 0xfff) as u32;
            Ok(RelaValue::Word32((insn & !(0xfff << 10)) | (imm << 10)))
        }
        _ => Err(RelocationError::Unsupported { r_type, place }),
    }
}

#[cfg(target_arch = "aarch64")]
mod abi {
    /// Stage a syscall: pc at the spliced `svc`, number in x8, arguments in
    /// x0..x5 per the AAPCS64 syscall convention. Every other register keeps
    /// the saved caller value.
    pub fn stage_syscall_regs(
        regs: &mut libc::user_regs_struct,
        ip: u64,
        nr: i64,
        args: &[u64; 6],
    ) {
        regs.pc = ip;
        regs.regs[8] = nr as u64;
        regs.regs[..6].copy_from_slice(args);
    }

    pub fn syscall_ret(regs: &libc::user_regs_struct) -> i64 {
        regs.regs[0] as i64
    }
}

#[cfg(target_arch = "aarch64")]
pub use abi::*;
