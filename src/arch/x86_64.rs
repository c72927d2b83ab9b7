//! x86-64 encodings: `E8`/`E9` rel32 branches, the 14-byte absolute
//! jump-table entry, the two-byte `syscall` instruction, and the RELA forms
//! a patch object may carry.

use crate::error::{EncodeError, RelocationError};

use super::RelaValue;

/// Call-site replacement width. Matches the 5-byte `call` emitted by
/// `-mfentry`/`mcount` instrumentation.
pub const MCOUNT_INSN_SIZE: usize = 5;

/// `syscall`
pub const SYSCALL_INSN: &[u8] = &[0x0f, 0x05];

/// `jmp *0(%rip)` followed by the absolute destination.
pub const JUMP_TABLE_ENTRY_SIZE: usize = 14;

/// Farthest a rel32 branch can land from its successor instruction.
pub const BRANCH_REACH: u64 = i32::MAX as u64;

fn rel32(ip: u64, dst: u64) -> Result<i32, EncodeError> {
    let rel = (dst as i64)
        .wrapping_sub(ip as i64)
        .wrapping_sub(MCOUNT_INSN_SIZE as i64);
    i32::try_from(rel).map_err(|_| EncodeError::OutOfReach { ip, dst })
}

fn branch(opcode: u8, ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    let rel = rel32(ip, dst)?.to_le_bytes();
    Ok([opcode, rel[0], rel[1], rel[2], rel[3]])
}

/// `call rel32` reaching `dst` from a call instruction located at `ip`.
pub fn encode_call(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    branch(0xe8, ip, dst)
}

/// `jmp rel32`.
pub fn encode_jmp(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    branch(0xe9, ip, dst)
}

/// Single 5-byte nop (`nopl 0(%rax,%rax,1)`), the same form the kernel uses
/// to quiesce fentry call sites.
pub fn encode_nop() -> [u8; MCOUNT_INSN_SIZE] {
    [0x0f, 0x1f, 0x44, 0x00, 0x00]
}

/// Position-independent far jump: `ff 25 00 00 00 00` loads the target from
/// the 8 bytes immediately following the instruction.
pub fn encode_jump_table_entry(dst: u64) -> [u8; JUMP_TABLE_ENTRY_SIZE] {
    let mut entry = [0u8; JUMP_TABLE_ENTRY_SIZE];
    entry[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    entry[6..].copy_from_slice(&dst.to_le_bytes());
    entry
}

/// Compute the store for one RELA entry. `place` is the runtime address of
/// the relocation site, `sym` the resolved symbol address. The instruction
/// word argument is unused on x86-64 (stores are whole immediates).
pub fn resolve_rela(
    r_type: u32,
    place: u64,
    sym: u64,
    addend: i64,
    _insn: u32,
) -> Result<RelaValue, RelocationError> {
    use object::elf;

    let value = sym.wrapping_add_signed(addend);
    match r_type {
        elf::R_X86_64_64 => Ok(RelaValue::Word64(value)),
        elf::R_X86_64_32 => {
            if value > u32::MAX as u64 {
                return Err(RelocationError::Overflow {
                    r_type,
                    place,
                    value,
                });
            }
            Ok(RelaValue::Word32(value as u32))
        }
        elf::R_X86_64_32S => {
            let signed = value as i64;
            if i32::try_from(signed).is_err() {
                return Err(RelocationError::Overflow {
                    r_type,
                    place,
                    value,
                });
            }
            Ok(RelaValue::Word32(signed as u32))
        }
        elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
            let rel = (value as i64).wrapping_sub(place as i64);
            let rel = i32::try_from(rel).map_err(|_| RelocationError::Overflow {
                r_type,
                place,
                value,
            })?;
            Ok(RelaValue::Word32(rel as u32))
        }
        _ => Err(RelocationError::Unsupported { r_type, place }),
    }
}

#[cfg(target_arch = "x86_64")]
mod abi {
    /// Stage a syscall: point the instruction pointer at the spliced
    /// `syscall` and fill the System V syscall argument registers. Every
    /// other register keeps the saved caller value.
    pub fn stage_syscall_regs(
        regs: &mut libc::user_regs_struct,
        ip: u64,
        nr: i64,
        args: &[u64; 6],
    ) {
        regs.rip = ip;
        regs.rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
    }

    pub fn syscall_ret(regs: &libc::user_regs_struct) -> i64 {
        regs.rax as i64
    }
}

#[cfg(target_arch = "x86_64")]
pub use abi::*;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn call_encodes_backward_branch() {
        // call from 0x1000 to 0x800: rel = 0x800 - 0x1000 - 5
        let bytes = encode_call(0x1000, 0x800).unwrap();
        assert_eq!(bytes[0], 0xe8);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), -0x805);
    }

    #[test]
    fn jmp_encodes_forward_branch() {
        let bytes = encode_jmp(0x401000, 0x401020).unwrap();
        assert_eq!(bytes, [0xe9, 0x1b, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn branch_beyond_2g_is_rejected() {
        let err = encode_jmp(0x1000, 0x1000 + (1 << 32)).unwrap_err();
        assert!(matches!(err, EncodeError::OutOfReach { .. }));
        // Just inside reach still encodes.
        encode_jmp(0x1000, 0x1000 + BRANCH_REACH - 0x10).unwrap();
    }

    #[test]
    fn jump_table_entry_embeds_absolute_target() {
        let entry = encode_jump_table_entry(0xdead_beef_cafe_f00d);
        assert_eq!(&entry[..6], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            u64::from_le_bytes(entry[6..].try_into().unwrap()),
            0xdead_beef_cafe_f00d
        );
    }

    #[rstest]
    #[case(object::elf::R_X86_64_64, 0x7f00_0000_1000, 0, RelaValue::Word64(0x7f00_0000_1000))]
    #[case(object::elf::R_X86_64_32, 0x1234, 4, RelaValue::Word32(0x1238))]
    #[case(object::elf::R_X86_64_32S, 0x1000, -8, RelaValue::Word32(0xff8))]
    fn absolute_relocations(
        #[case] r_type: u32,
        #[case] sym: u64,
        #[case] addend: i64,
        #[case] expected: RelaValue,
    ) {
        assert_eq!(resolve_rela(r_type, 0x2000, sym, addend, 0).unwrap(), expected);
    }

    #[test]
    fn pc32_is_place_relative() {
        let got = resolve_rela(object::elf::R_X86_64_PC32, 0x2000, 0x3000, -4, 0).unwrap();
        assert_eq!(got, RelaValue::Word32(0xffc));
        let got = resolve_rela(object::elf::R_X86_64_PLT32, 0x3000, 0x2000, -4, 0).unwrap();
        assert_eq!(got, RelaValue::Word32((-0x1004i32) as u32));
    }

    #[test]
    fn wide_values_overflow_narrow_forms() {
        for r_type in [
            object::elf::R_X86_64_32,
            object::elf::R_X86_64_32S,
            object::elf::R_X86_64_PC32,
        ] {
            let err = resolve_rela(r_type, 0, 1 << 40, 0, 0).unwrap_err();
            assert!(matches!(err, RelocationError::Overflow { .. }), "{r_type}");
        }
    }

    #[test]
    fn unknown_relocation_type_is_unsupported() {
        let err = resolve_rela(object::elf::R_X86_64_TPOFF64, 0x1000, 0, 0, 0).unwrap_err();
        assert!(matches!(err, RelocationError::Unsupported { .. }));
    }
}
