//! In-memory ELF metadata attached to leader VMAs.
//!
//! The first page of a file-backed leader is probed for the ELF magic; on a
//! hit the Ehdr and the program header table are copied out of the target.
//! `load_offset` relates on-disk virtual addresses to runtime addresses:
//! `runtime = load_offset + p_vaddr` for any loaded segment.

use std::mem;

use object::Endianness;
use object::elf::{
    ET_DYN, FileHeader64, PT_DYNAMIC, PT_INTERP, PT_LOAD, ProgramHeader64,
};
use object::pod;

use crate::prelude::*;
use crate::target::memory::TargetMemory;

/// Library names treated as shared libraries even when their ELF carries a
/// `PT_INTERP` (historical glibc components are directly executable).
const SHARED_LIB_PREFIXES: &[&str] = &["libc", "libssp", "libpthread", "libdl"];

#[derive(Debug, Clone)]
pub struct VmaElf {
    endian: Endianness,
    ehdr: FileHeader64<Endianness>,
    phdrs: Vec<ProgramHeader64<Endianness>>,
    /// `vma.start - min(PT_LOAD p_vaddr)`.
    pub load_offset: u64,
    pub is_shared_lib: bool,
}

impl VmaElf {
    /// Probe `vma_start` in the target for a 64-bit little-endian ELF and
    /// copy its headers out. Returns `Ok(None)` when the mapping does not
    /// begin with an ELF image we handle.
    pub fn read_from(
        memory: &TargetMemory,
        vma_start: u64,
        file_name: &str,
    ) -> Result<Option<VmaElf>> {
        let mut ehdr: FileHeader64<Endianness> = unsafe { mem::zeroed() };
        memory.read(vma_start, pod::bytes_of_mut(&mut ehdr))?;

        if ehdr.e_ident.magic != *b"\x7fELF" {
            return Ok(None);
        }
        if ehdr.e_ident.class != object::elf::ELFCLASS64
            || ehdr.e_ident.data != object::elf::ELFDATA2LSB
        {
            debug!("{file_name}: not a 64-bit LSB ELF, skipping");
            return Ok(None);
        }
        let endian = Endianness::Little;

        let phnum = ehdr.e_phnum.get(endian) as usize;
        let phoff = ehdr.e_phoff.get(endian);
        if phnum == 0 || phnum > 128 {
            debug!("{file_name}: implausible e_phnum {phnum}, skipping");
            return Ok(None);
        }
        // The program headers of a loaded image sit in its first pages, so
        // base + e_phoff addresses them.
        let zero: ProgramHeader64<Endianness> = unsafe { mem::zeroed() };
        let mut phdrs = vec![zero; phnum];
        memory.read(vma_start + phoff, pod::bytes_of_slice_mut(&mut phdrs))?;

        let min_load = phdrs
            .iter()
            .filter(|p| p.p_type.get(endian) == PT_LOAD)
            .map(|p| p.p_vaddr.get(endian))
            .min()
            .with_context(|| format!("{file_name}: ELF image has no PT_LOAD"))?;
        let load_offset = vma_start.wrapping_sub(min_load);

        let has_interp = phdrs.iter().any(|p| p.p_type.get(endian) == PT_INTERP);
        let base_name = file_name.rsplit('/').next().unwrap_or(file_name);
        let is_shared_lib = ehdr.e_type.get(endian) == ET_DYN
            && (!has_interp || SHARED_LIB_PREFIXES.iter().any(|p| base_name.starts_with(p)));

        Ok(Some(VmaElf {
            endian,
            ehdr,
            phdrs,
            load_offset,
            is_shared_lib,
        }))
    }

    /// Bare metadata for table-level tests that never touch a live target.
    #[cfg(test)]
    pub(crate) fn fake(e_type: u16, load_offset: u64, is_shared_lib: bool) -> VmaElf {
        let mut ehdr: FileHeader64<Endianness> = unsafe { mem::zeroed() };
        ehdr.e_type.set(Endianness::Little, e_type);
        VmaElf {
            endian: Endianness::Little,
            ehdr,
            phdrs: Vec::new(),
            load_offset,
            is_shared_lib,
        }
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn e_type(&self) -> u16 {
        self.ehdr.e_type.get(self.endian)
    }

    pub fn phdrs(&self) -> &[ProgramHeader64<Endianness>] {
        &self.phdrs
    }

    /// The `PT_DYNAMIC` program header, if the image has one.
    pub fn dynamic(&self) -> Option<&ProgramHeader64<Endianness>> {
        self.phdrs
            .iter()
            .find(|p| p.p_type.get(self.endian) == PT_DYNAMIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phdr(p_type: u32, vaddr: u64) -> ProgramHeader64<Endianness> {
        let mut p: ProgramHeader64<Endianness> = unsafe { mem::zeroed() };
        p.p_type.set(Endianness::Little, p_type);
        p.p_vaddr.set(Endianness::Little, vaddr);
        p
    }

    fn elf(e_type: u16, phdrs: Vec<ProgramHeader64<Endianness>>) -> VmaElf {
        let mut ehdr: FileHeader64<Endianness> = unsafe { mem::zeroed() };
        ehdr.e_type.set(Endianness::Little, e_type);
        let endian = Endianness::Little;
        let min_load = phdrs
            .iter()
            .filter(|p| p.p_type.get(endian) == PT_LOAD)
            .map(|p| p.p_vaddr.get(endian))
            .min()
            .unwrap_or(0);
        VmaElf {
            endian,
            ehdr,
            load_offset: 0x7f00_0000_0000u64.wrapping_sub(min_load),
            is_shared_lib: false,
            phdrs,
        }
    }

    #[test]
    fn load_offset_is_anchored_to_lowest_load_segment() {
        let e = elf(
            ET_DYN,
            vec![phdr(PT_LOAD, 0x1000), phdr(PT_LOAD, 0x40000)],
        );
        assert_eq!(e.load_offset, 0x7f00_0000_0000 - 0x1000);
    }

    #[test]
    fn dynamic_header_is_found() {
        let e = elf(
            ET_DYN,
            vec![phdr(PT_LOAD, 0), phdr(PT_DYNAMIC, 0x2e000)],
        );
        assert_eq!(
            e.dynamic().unwrap().p_vaddr.get(Endianness::Little),
            0x2e000
        );
        let plain = elf(ET_DYN, vec![phdr(PT_LOAD, 0)]);
        assert!(plain.dynamic().is_none());
    }
}
