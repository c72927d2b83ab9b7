//! Applying a patch object's relocations inside the target.
//!
//! The staged image is a byte copy of the patch file, so a section lives at
//! `patch_base + sh_offset` and a relocation site at
//! `patch_base + sh_offset + r_offset`. Symbols defined by the patch
//! resolve within the image; undefined symbols resolve through the target's
//! symbol index. Value computation is delegated to the per-ISA
//! `resolve_rela` and the store goes through target memory.

use object::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex};

use crate::arch;
use crate::error::RelocationError;
use crate::prelude::*;
use crate::target::Task;

use super::load_info::LoadInfo;

/// One pending relocation store, fully resolved to target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelaSite {
    pub place: u64,
    pub r_type: u32,
    pub sym: u64,
    pub addend: i64,
}

fn section_file_offset(obj: &object::File, index: SectionIndex, place: u64) -> Result<u64> {
    let section = obj.section_by_index(index)?;
    section
        .file_range()
        .map(|(off, _)| off)
        .ok_or_else(|| RelocationError::NoBits { place }.into())
}

/// Walk every allocated section's relocation table, in section-header order,
/// resolving symbol addresses in the target's address space.
pub(crate) fn collect_sites(
    obj: &object::File,
    patch_base: u64,
    resolve: &mut dyn FnMut(&str) -> Result<u64>,
) -> Result<Vec<RelaSite>> {
    let mut sites = Vec::new();

    for section in obj.sections() {
        let allocated = matches!(
            section.flags(),
            object::SectionFlags::Elf { sh_flags } if sh_flags & object::elf::SHF_ALLOC as u64 != 0
        );
        if !allocated {
            continue;
        }
        let Some((section_offset, _)) = section.file_range() else {
            continue;
        };

        for (r_offset, reloc) in section.relocations() {
            let place = patch_base + section_offset + r_offset;
            let object::RelocationFlags::Elf { r_type } = reloc.flags() else {
                return Err(RelocationError::Unsupported { r_type: 0, place }.into());
            };

            let sym = match reloc.target() {
                RelocationTarget::Symbol(index) => {
                    let symbol = obj.symbol_by_index(index)?;
                    if symbol.is_undefined() {
                        let name = symbol.name().unwrap_or_default();
                        resolve(name).map_err(|err| {
                            err.context(RelocationError::Unresolved(name.to_string()))
                        })?
                    } else {
                        let section_index = symbol
                            .section_index()
                            .with_context(|| format!("symbol {:?} has no section", symbol.name()))?;
                        patch_base
                            + section_file_offset(obj, section_index, place)?
                            + symbol.address()
                    }
                }
                RelocationTarget::Section(index) => {
                    patch_base + section_file_offset(obj, index, place)?
                }
                _ => return Err(RelocationError::Unsupported { r_type, place }.into()),
            };

            sites.push(RelaSite {
                place,
                r_type,
                sym,
                addend: reloc.addend(),
            });
        }
    }

    Ok(sites)
}

/// Resolve and store every relocation of the staged patch image.
pub fn apply_relocations(task: &mut Task, info: &LoadInfo, patch_base: u64) -> Result<()> {
    let obj = object::File::parse(info.bytes())?;

    let mut resolver = |name: &str| task.symbol_runtime_addr(name);
    let sites = collect_sites(&obj, patch_base, &mut resolver)?;
    debug!(
        "{}: applying {} relocations at image base {patch_base:#x}",
        info.path().display(),
        sites.len()
    );

    for site in sites {
        // The field-insert forms need the instruction word currently at the
        // site; read it unconditionally, the whole-word forms ignore it.
        let mut insn = [0u8; 4];
        task.read_memory(site.place, &mut insn)?;
        let value = arch::native::resolve_rela(
            site.r_type,
            site.place,
            site.sym,
            site.addend,
            u32::from_le_bytes(insn),
        )?;
        task.write_memory(site.place, &value.to_bytes())?;
        trace!(
            "rela type {} at {:#x}: sym {:#x} addend {:#x} -> {value:x?}",
            site.r_type, site.place, site.sym, site.addend
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::load_info::tests::host_arch;
    use object::write::{self, Object as WriteObject};
    use object::{
        BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags, SymbolKind,
        SymbolScope,
    };

    fn host_branch_rtype() -> u32 {
        if cfg!(target_arch = "x86_64") {
            object::elf::R_X86_64_PC32
        } else {
            object::elf::R_AARCH64_CALL26
        }
    }

    /// An object with one text section calling an undefined `puts` and one
    /// absolute data reference to a local symbol.
    fn synth_with_relocations() -> Vec<u8> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, host_arch(), Endianness::Little);

        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0u8; 16], 16);
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        obj.append_section_data(data, &[0u8; 16], 8);

        let local = obj.add_symbol(write::Symbol {
            name: b"local_buf".to_vec(),
            value: 8,
            size: 8,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: write::SymbolSection::Section(data),
            flags: SymbolFlags::None,
        });
        let puts = obj.add_symbol(write::Symbol {
            name: b"puts".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });

        obj.add_relocation(
            text,
            write::Relocation {
                offset: 4,
                symbol: puts,
                addend: if cfg!(target_arch = "x86_64") { -4 } else { 0 },
                flags: RelocationFlags::Elf {
                    r_type: host_branch_rtype(),
                },
            },
        )
        .unwrap();
        obj.add_relocation(
            data,
            write::Relocation {
                offset: 0,
                symbol: local,
                addend: 0,
                flags: RelocationFlags::Elf {
                    r_type: if cfg!(target_arch = "x86_64") {
                        object::elf::R_X86_64_64
                    } else {
                        object::elf::R_AARCH64_ABS64
                    },
                },
            },
        )
        .unwrap();

        obj.write().unwrap()
    }

    #[test]
    fn sites_resolve_against_image_and_target() {
        let bytes = synth_with_relocations();
        let obj = object::File::parse(&*bytes).unwrap();
        let patch_base = 0x7f12_3400_0000u64;

        let puts_addr = 0x7f12_3400_8000u64;
        let mut resolve = |name: &str| {
            assert_eq!(name, "puts");
            Ok(puts_addr)
        };
        let sites = collect_sites(&obj, patch_base, &mut resolve).unwrap();
        assert_eq!(sites.len(), 2);

        let text_off = obj
            .section_by_name(".text")
            .unwrap()
            .file_range()
            .unwrap()
            .0;
        let data_off = obj
            .section_by_name(".data")
            .unwrap()
            .file_range()
            .unwrap()
            .0;

        let call = sites.iter().find(|s| s.r_type == host_branch_rtype()).unwrap();
        assert_eq!(call.place, patch_base + text_off + 4);
        assert_eq!(call.sym, puts_addr);

        let abs = sites.iter().find(|s| s.r_type != host_branch_rtype()).unwrap();
        assert_eq!(abs.place, patch_base + data_off);
        // local_buf sits 8 bytes into .data inside the image.
        assert_eq!(abs.sym, patch_base + data_off + 8);
    }

    #[test]
    fn unresolved_symbols_are_fatal() {
        let bytes = synth_with_relocations();
        let obj = object::File::parse(&*bytes).unwrap();
        let mut resolve = |name: &str| bail!("symbol `{name}` not found in target");
        let err = collect_sites(&obj, 0x1000, &mut resolve).unwrap_err();
        assert!(format!("{err:#}").contains("puts"), "{err:#}");
    }
}
