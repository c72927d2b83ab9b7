//! Validation and indexing of a patch object file.
//!
//! A patch is a relocatable ELF (`ET_REL`, 64-bit LSB, host machine) that
//! carries its metadata in two dedicated sections: `.upatch.info` holds a
//! fixed-layout record naming the patched function and the patch author,
//! `.upatch.strtab` the patch-local strings. The file bytes are kept mapped
//! for the whole patch lifecycle; they are both the parse source and the
//! image that gets copied into the target.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use object::{Object, ObjectSection};

use crate::prelude::*;

pub const UPATCH_INFO_SECTION: &str = ".upatch.info";
pub const UPATCH_STRTAB_SECTION: &str = ".upatch.strtab";

/// Fixed-layout metadata record stored in `.upatch.info`.
///
/// Packed layout: `u32 type, u32 version, char target_func[64],
/// char author[64], u64 replace_addr` (a placeholder until the patch is
/// linked; the loader writes the resolved replacement address back into the
/// staged image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpatchInfo {
    pub kind: u32,
    pub version: u32,
    pub target_func: String,
    pub author: String,
    pub replace_addr: u64,
}

impl UpatchInfo {
    pub const SIZE: usize = 4 + 4 + 64 + 64 + 8;
    /// Byte offset of the `replace_addr` field within the record.
    pub const REPLACE_ADDR_OFFSET: u64 = 136;

    pub fn parse(data: &[u8]) -> Result<UpatchInfo> {
        if data.len() < Self::SIZE {
            bail!(
                "{UPATCH_INFO_SECTION} is {} bytes, expected at least {}",
                data.len(),
                Self::SIZE
            );
        }
        let kind = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let target_func = fixed_cstr(&data[8..72])?;
        let author = fixed_cstr(&data[72..136])?;
        let replace_addr = u64::from_le_bytes(data[136..144].try_into().unwrap());
        if target_func.is_empty() {
            bail!("{UPATCH_INFO_SECTION} names no target function");
        }
        Ok(UpatchInfo {
            kind,
            version,
            target_func,
            author,
            replace_addr,
        })
    }
}

fn fixed_cstr(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Ok(std::str::from_utf8(&field[..end])
        .context("non-UTF-8 string in patch metadata")?
        .to_string())
}

/// A validated, still-unstaged patch object.
#[derive(Debug)]
pub struct LoadInfo {
    path: PathBuf,
    mmap: Mmap,
    pub info: UpatchInfo,
    /// File offset of `.upatch.info`, for the placeholder write-back into
    /// the staged image.
    pub info_offset: u64,
}

impl LoadInfo {
    /// Read and validate the patch file. Nothing in the target is touched.
    pub fn parse(path: &Path) -> Result<LoadInfo> {
        let file =
            File::open(path).with_context(|| format!("open patch file {}", path.display()))?;
        let len = file.metadata()?.len();
        if len == 0 {
            bail!("patch file {} is empty", path.display());
        }
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("map patch file {}", path.display()))?;

        match object::FileKind::parse(&*mmap) {
            Ok(object::FileKind::Elf64) => {}
            Ok(kind) => bail!("{}: not a 64-bit ELF ({kind:?})", path.display()),
            Err(err) => bail!("{}: not an ELF file: {err}", path.display()),
        }
        let obj = object::File::parse(&*mmap)
            .with_context(|| format!("parse {}", path.display()))?;
        if !obj.is_little_endian() {
            bail!("{}: big-endian patch objects are not supported", path.display());
        }
        if obj.kind() != object::ObjectKind::Relocatable {
            bail!("{}: not a relocatable object (ET_REL)", path.display());
        }
        let expected = if cfg!(target_arch = "x86_64") {
            object::Architecture::X86_64
        } else {
            object::Architecture::Aarch64
        };
        if obj.architecture() != expected {
            bail!(
                "{}: built for {:?}, this host is {:?}",
                path.display(),
                obj.architecture(),
                expected
            );
        }
        if obj.symbol_table().is_none() {
            bail!("{}: no .symtab", path.display());
        }
        if obj.section_by_name(UPATCH_STRTAB_SECTION).is_none() {
            bail!("{}: missing {UPATCH_STRTAB_SECTION}", path.display());
        }
        let info_section = obj
            .section_by_name(UPATCH_INFO_SECTION)
            .with_context(|| format!("{}: missing {UPATCH_INFO_SECTION}", path.display()))?;
        let info = UpatchInfo::parse(info_section.data()?)
            .with_context(|| format!("{}: bad {UPATCH_INFO_SECTION}", path.display()))?;
        let info_offset = info_section
            .file_range()
            .map(|(off, _)| off)
            .with_context(|| format!("{}: {UPATCH_INFO_SECTION} has no file data", path.display()))?;

        debug!(
            "parsed patch {}: target `{}`, author `{}`",
            path.display(),
            info.target_func,
            info.author
        );
        Ok(LoadInfo {
            path: path.to_path_buf(),
            mmap,
            info,
            info_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use object::write::{self, Object as WriteObject};
    use object::{
        Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
    };
    use std::io::Write as _;

    pub(crate) fn host_arch() -> Architecture {
        if cfg!(target_arch = "x86_64") {
            Architecture::X86_64
        } else {
            Architecture::Aarch64
        }
    }

    pub(crate) fn upatch_info_bytes(target_func: &str, author: &str) -> Vec<u8> {
        let mut data = vec![0u8; UpatchInfo::SIZE];
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        data[4..8].copy_from_slice(&1u32.to_le_bytes());
        data[8..8 + target_func.len()].copy_from_slice(target_func.as_bytes());
        data[72..72 + author.len()].copy_from_slice(author.as_bytes());
        data
    }

    /// Synthesize a minimal patch object: one text section with `body`, the
    /// metadata sections, and a global function symbol `replacement`.
    pub(crate) fn synth_patch(target_func: &str, replacement: &str, body: &[u8]) -> Vec<u8> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, host_arch(), Endianness::Little);

        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, body, 16);

        let info = obj.add_section(Vec::new(), UPATCH_INFO_SECTION.as_bytes().to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(info, &upatch_info_bytes(target_func, "tester"), 8);

        let strtab = obj.add_section(
            Vec::new(),
            UPATCH_STRTAB_SECTION.as_bytes().to_vec(),
            SectionKind::ReadOnlyData,
        );
        obj.append_section_data(strtab, b"\0ulpatch\0", 1);

        obj.add_symbol(write::Symbol {
            name: replacement.as_bytes().to_vec(),
            value: 0,
            size: body.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });

        obj.write().expect("synthesize patch object")
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn parses_a_synthesized_patch() {
        let bytes = synth_patch("try_to_wake_up", "ulpatch_try_to_wake_up", &[0xc3]);
        let file = write_temp(&bytes);
        let load_info = LoadInfo::parse(file.path()).unwrap();
        assert_eq!(load_info.info.target_func, "try_to_wake_up");
        assert_eq!(load_info.info.author, "tester");
        assert_eq!(load_info.info.replace_addr, 0);
        assert_eq!(load_info.len(), bytes.len());
    }

    #[test]
    fn rejects_empty_and_non_elf_files() {
        let empty = write_temp(b"");
        assert!(LoadInfo::parse(empty.path()).is_err());

        let garbage = write_temp(b"definitely not an elf");
        let err = LoadInfo::parse(garbage.path()).unwrap_err();
        assert!(format!("{err:#}").contains("not an ELF"), "{err:#}");
    }

    #[test]
    fn rejects_objects_without_patch_metadata() {
        let mut obj = WriteObject::new(BinaryFormat::Elf, host_arch(), Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        obj.add_symbol(write::Symbol {
            name: b"f".to_vec(),
            value: 0,
            size: 1,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        let file = write_temp(&obj.write().unwrap());
        let err = LoadInfo::parse(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(UPATCH_STRTAB_SECTION), "{err:#}");
    }

    #[test]
    fn info_record_round_trips() {
        let bytes = upatch_info_bytes("do_work", "someone@example.com");
        let info = UpatchInfo::parse(&bytes).unwrap();
        assert_eq!(info.target_func, "do_work");
        assert_eq!(info.author, "someone@example.com");

        assert!(UpatchInfo::parse(&bytes[..100]).is_err());
        let anonymous = upatch_info_bytes("", "");
        assert!(UpatchInfo::parse(&anonymous).is_err());
    }
}
