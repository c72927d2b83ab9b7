//! Symbol loading and runtime address resolution.
//!
//! Symbols come from two places: the target's own executable is read from
//! disk with `object`, while every other mapped ELF is walked *in the
//! target's memory* via `PT_DYNAMIC` (`DT_SYMTAB`/`DT_STRTAB`), since the
//! backing file may be deleted, prelinked, or simply not what is mapped.
//!
//! A symbol's `st_value` is translated to a runtime address against the
//! leader VMA of its image; shared libraries map their segments at distinct
//! offsets, so the sibling whose file-offset window covers the value anchors
//! the translation.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;

use object::elf::{Dyn64, SHN_UNDEF, Sym64};
use object::{Endianness, Object, ObjectSymbol, pod};

use crate::prelude::*;
use crate::target::memory::TargetMemory;
use crate::target::vma::{VmaIndex, VmaKind, VmaTable};

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// `st_value` as stored in the image.
    pub value: u64,
    pub size: u64,
    /// `STB_*`
    pub binding: u8,
    /// `STT_*`
    pub kind: u8,
    /// Start address of the leader VMA of the owning image. An address, not
    /// a table index: indices are invalidated whenever a remote mmap/munmap
    /// forces the VMA table to be rebuilt, while a mapped image's base stays
    /// put for the lifetime of the attachment.
    pub leader: u64,
}

/// Name-keyed symbol index of one target. First writer wins on duplicate
/// names, matching ELF lookup order across the link map.
#[derive(Debug, Default)]
pub struct SymbolIndex {
    map: HashMap<String, Symbol>,
}

impl SymbolIndex {
    pub fn insert(&mut self, sym: Symbol) {
        match self.map.entry(sym.name.clone()) {
            Entry::Occupied(_) => {
                trace!("duplicate symbol `{}`, keeping first definition", sym.name);
            }
            Entry::Vacant(slot) => {
                slot.insert(sym);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.map.values()
    }
}

/// Load every defined symbol of the target's own executable from disk.
/// `leader` is the start address of the executable's leader VMA.
pub fn load_self_symbols(index: &mut SymbolIndex, exe: &Path, leader: u64) -> Result<usize> {
    let data = std::fs::read(exe).with_context(|| format!("read {}", exe.display()))?;
    let obj = object::File::parse(&*data).with_context(|| format!("parse {}", exe.display()))?;

    let mut loaded = 0;
    for sym in obj.symbols().chain(obj.dynamic_symbols()) {
        if sym.is_undefined() {
            continue;
        }
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        index.insert(Symbol {
            name: name.to_string(),
            value: sym.address(),
            size: sym.size(),
            binding: if sym.is_weak() {
                object::elf::STB_WEAK
            } else if sym.is_global() {
                object::elf::STB_GLOBAL
            } else {
                object::elf::STB_LOCAL
            },
            kind: match sym.kind() {
                object::SymbolKind::Text => object::elf::STT_FUNC,
                object::SymbolKind::Data => object::elf::STT_OBJECT,
                object::SymbolKind::Tls => object::elf::STT_TLS,
                object::SymbolKind::File => object::elf::STT_FILE,
                object::SymbolKind::Section => object::elf::STT_SECTION,
                _ => object::elf::STT_NOTYPE,
            },
            leader,
        });
        loaded += 1;
    }
    debug!("loaded {loaded} symbols from {}", exe.display());
    Ok(loaded)
}

/// Load the dynamic symbols of the ELF mapped at `leader` by walking its
/// `PT_DYNAMIC` inside the target. Images without a dynamic segment (or
/// without a symbol table in it) contribute nothing.
pub fn load_dynamic_symbols(
    index: &mut SymbolIndex,
    memory: &TargetMemory,
    table: &VmaTable,
    leader: VmaIndex,
) -> Result<usize> {
    let vma = table.get(leader);
    let leader_start = vma.start;
    let Some(elf) = &vma.elf else { return Ok(0) };
    let Some(dynamic) = elf.dynamic() else {
        trace!("{}: no PT_DYNAMIC", vma.name.display());
        return Ok(0);
    };
    let endian = elf.endian();
    let name = vma.name.display();

    let dyn_addr = elf.load_offset + dynamic.p_vaddr.get(endian);
    let count = (dynamic.p_memsz.get(endian) as usize) / size_of::<Dyn64<Endianness>>();
    let zero: Dyn64<Endianness> = unsafe { std::mem::zeroed() };
    let mut dyns = vec![zero; count];
    memory.read(dyn_addr, pod::bytes_of_slice_mut(&mut dyns))?;

    let mut symtab = None;
    let mut strtab = None;
    let mut strsz = None;
    let mut syment = None;
    for d in &dyns {
        match d.d_tag.get(endian) as i64 {
            t if t == object::elf::DT_NULL as i64 => break,
            t if t == object::elf::DT_SYMTAB as i64 => symtab = Some(d.d_val.get(endian)),
            t if t == object::elf::DT_STRTAB as i64 => strtab = Some(d.d_val.get(endian)),
            t if t == object::elf::DT_STRSZ as i64 => strsz = Some(d.d_val.get(endian)),
            t if t == object::elf::DT_SYMENT as i64 => syment = Some(d.d_val.get(endian)),
            _ => {}
        }
    }
    let (Some(mut symtab), Some(mut strtab), Some(strsz), Some(syment)) =
        (symtab, strtab, strsz, syment)
    else {
        trace!("{name}: dynamic segment lacks a symbol table");
        return Ok(0);
    };

    if syment != size_of::<Sym64<Endianness>>() as u64 {
        bail!("{name}: DT_SYMENT is {syment}, expected {}", size_of::<Sym64<Endianness>>());
    }

    // The vdso's dynamic entries are image-relative; everything the dynamic
    // linker has processed holds absolute runtime addresses.
    if vma.kind == VmaKind::Vdso {
        symtab += elf.load_offset;
        strtab += elf.load_offset;
    }
    if strtab <= symtab {
        bail!("{name}: unexpected dynamic layout (DT_STRTAB {strtab:#x} <= DT_SYMTAB {symtab:#x})");
    }

    // The string table conventionally follows the symbol table, which both
    // bounds the symbol count and lets one contiguous read fetch everything.
    let nsyms = ((strtab - symtab) / syment) as usize;
    let total = (strtab - symtab + strsz) as usize;
    let mut words = vec![0u64; total.div_ceil(8)];
    {
        let bytes = pod::bytes_of_slice_mut(&mut words);
        memory.read(symtab, &mut bytes[..total])?;
    }
    let bytes = &pod::bytes_of_slice(&words)[..total];
    let (syms, _) = pod::slice_from_bytes::<Sym64<Endianness>>(bytes, nsyms)
        .map_err(|()| anyhow!("{name}: misaligned symbol table"))?;
    let strings = &bytes[(strtab - symtab) as usize..];

    let mut loaded = 0;
    for sym in syms {
        if sym.st_shndx.get(endian) == SHN_UNDEF {
            continue;
        }
        let Some(sym_name) = str_at(strings, sym.st_name.get(endian) as usize) else {
            continue;
        };
        if sym_name.is_empty() {
            continue;
        }
        index.insert(Symbol {
            name: sym_name.to_string(),
            value: sym.st_value.get(endian),
            size: sym.st_size.get(endian),
            binding: sym.st_info >> 4,
            kind: sym.st_info & 0xf,
            leader: leader_start,
        });
        loaded += 1;
    }
    debug!("loaded {loaded} dynamic symbols from {name}");
    Ok(loaded)
}

fn str_at(strings: &[u8], offset: usize) -> Option<&str> {
    let tail = strings.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

/// Translate a symbol's `st_value` to the address it occupies in the
/// running target.
pub fn runtime_addr(table: &VmaTable, sym: &Symbol) -> Result<u64> {
    let leader_index = table
        .find_vma(sym.leader)
        .with_context(|| format!("leader VMA at {:#x} for `{}` is gone", sym.leader, sym.name))?;
    let leader = table.get(leader_index);
    let Some(elf) = &leader.elf else {
        return Ok(sym.value);
    };

    if elf.is_shared_lib {
        // Multi-segment libraries: each sibling maps a window of the file;
        // anchor to the one whose offset range covers the value.
        let group = table.group_of(leader_index);
        for (i, &vi) in group.iter().enumerate() {
            let v = table.get(vi);
            let next_offset = group.get(i + 1).map(|&n| table.get(n).offset);
            if v.offset <= sym.value && next_offset.is_none_or(|n| sym.value < n) {
                return Ok(v.start + (sym.value - v.offset));
            }
        }
        bail!(
            "symbol `{}` value {:#x} not covered by any mapping of {}",
            sym.name,
            sym.value,
            leader.name.display()
        );
    }

    if elf.e_type() == object::elf::ET_DYN {
        // Position-independent executable: bias by the load offset.
        return Ok(elf.load_offset + sym.value);
    }

    Ok(sym.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::vma::{MappingName, RawVma, VmPerms};
    use crate::target::vma_elf::VmaElf;
    use std::path::PathBuf;

    fn raw(start: u64, end: u64, offset: u64, name: MappingName) -> RawVma {
        RawVma {
            start,
            end,
            perms: VmPerms::default(),
            offset,
            dev: (0, 0),
            inode: 7,
            name,
        }
    }

    fn lib_table() -> VmaTable {
        let exe = PathBuf::from("/bin/app");
        let name = || MappingName::Path(PathBuf::from("/usr/lib64/libc.so.6"));
        let mut table = VmaTable::build(
            vec![
                raw(0x7f00_0000_0000, 0x7f00_0002_8000, 0, name()),
                raw(0x7f00_0002_8000, 0x7f00_001b_d000, 0x28000, name()),
                raw(0x7f00_001b_d000, 0x7f00_0021_5000, 0x1bd000, name()),
            ],
            &exe,
        );
        table.get_mut(0).elf = Some(VmaElf::fake(object::elf::ET_DYN, 0x7f00_0000_0000, true));
        table
    }

    fn sym(name: &str, value: u64, leader: u64) -> Symbol {
        Symbol {
            name: name.into(),
            value,
            size: 0,
            binding: object::elf::STB_GLOBAL,
            kind: object::elf::STT_FUNC,
            leader,
        }
    }

    const LIB_BASE: u64 = 0x7f00_0000_0000;

    #[test]
    fn shared_library_address_uses_covering_sibling() {
        let table = lib_table();
        // Falls inside the second segment's offset window.
        let printf = sym("printf", 0x6_0d70, LIB_BASE);
        assert_eq!(
            runtime_addr(&table, &printf).unwrap(),
            0x7f00_0002_8000 + (0x6_0d70 - 0x28000)
        );
        // First segment.
        let early = sym("early", 0x100, LIB_BASE);
        assert_eq!(runtime_addr(&table, &early).unwrap(), 0x7f00_0000_0100);
        // Last segment is open-ended.
        let late = sym("late", 0x20_0000, LIB_BASE);
        assert_eq!(
            runtime_addr(&table, &late).unwrap(),
            0x7f00_001b_d000 + (0x20_0000 - 0x1bd000)
        );
    }

    #[test]
    fn shared_library_addresses_stay_inside_the_group() {
        let table = lib_table();
        let group_end = table.get(2).end;
        for value in [0x100u64, 0x28000, 0x6_0d70, 0x1bd000] {
            let addr = runtime_addr(&table, &sym("s", value, LIB_BASE)).unwrap();
            assert!(addr >= table.get(0).start && addr < group_end);
        }
    }

    #[test]
    fn fixed_position_symbols_keep_their_value() {
        let exe = PathBuf::from("/bin/app");
        let mut table = VmaTable::build(
            vec![raw(
                0x40_0000,
                0x40_1000,
                0,
                MappingName::Path(exe.clone()),
            )],
            &exe,
        );
        table.get_mut(0).elf = Some(VmaElf::fake(object::elf::ET_EXEC, 0, false));
        let s = sym("main", 0x40_1234, 0x40_0000);
        assert_eq!(runtime_addr(&table, &s).unwrap(), 0x40_1234);
    }

    #[test]
    fn pie_executable_symbols_are_biased() {
        let exe = PathBuf::from("/bin/app");
        let mut table = VmaTable::build(
            vec![raw(
                0x5555_5555_0000,
                0x5555_5556_0000,
                0,
                MappingName::Path(exe.clone()),
            )],
            &exe,
        );
        table.get_mut(0).elf = Some(VmaElf::fake(object::elf::ET_DYN, 0x5555_5555_0000, false));
        let s = sym("main", 0x1234, 0x5555_5555_0000);
        assert_eq!(runtime_addr(&table, &s).unwrap(), 0x5555_5555_1234);
    }

    #[test]
    fn duplicate_insertion_keeps_the_first_definition() {
        let mut index = SymbolIndex::default();
        index.insert(sym("printf", 0x100, LIB_BASE));
        index.insert(sym("printf", 0x999, LIB_BASE));
        assert_eq!(index.get("printf").unwrap().value, 0x100);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn string_table_lookup_handles_bad_offsets() {
        let strings = b"\0printf\0exit\0";
        assert_eq!(str_at(strings, 1), Some("printf"));
        assert_eq!(str_at(strings, 8), Some("exit"));
        assert_eq!(str_at(strings, 0), Some(""));
        assert_eq!(str_at(strings, 100), None);
    }
}
