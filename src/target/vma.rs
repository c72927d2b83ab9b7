//! Model of the target's virtual memory areas.
//!
//! `/proc/<pid>/maps` is ingested through `procfs`, classified, and indexed
//! twice: a flat vector in map order for iteration and a `BTreeMap` keyed
//! by start address for point lookup. Mappings that share a backing file
//! form a group whose first member is the *leader*; symbol address math and
//! ELF metadata anchor to leaders.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::prelude::*;
use crate::target::vma_elf::VmaElf;

/// Index into a [`VmaTable`]. Indices are invalidated by
/// [`crate::target::Task::update_vmas`]; never hold one across a remote
/// mmap/munmap.
pub type VmaIndex = usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmPerms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl std::fmt::Display for VmPerms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.exec { 'x' } else { '-' },
            if self.shared { 's' } else { 'p' },
        )
    }
}

/// What a mapping is backed by, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingName {
    Path(PathBuf),
    Heap,
    Stack,
    Vdso,
    Vvar,
    Vsyscall,
    Anonymous,
    Other(String),
}

impl MappingName {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            MappingName::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            MappingName::Path(p) => p.display().to_string(),
            MappingName::Heap => "[heap]".into(),
            MappingName::Stack => "[stack]".into(),
            MappingName::Vdso => "[vdso]".into(),
            MappingName::Vvar => "[vvar]".into(),
            MappingName::Vsyscall => "[vsyscall]".into(),
            MappingName::Anonymous => String::new(),
            MappingName::Other(s) => format!("[{s}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// The target's own executable.
    SelfExe,
    Libc,
    /// A shared library other than libc.
    LibElf,
    /// File-backed but not recognizably a library.
    LibUnknown,
    Heap,
    Ld,
    Stack,
    Vvar,
    Vdso,
    Vsyscall,
    Anon,
    Unknown,
}

/// One parsed line of `/proc/<pid>/maps`, before classification.
#[derive(Debug, Clone)]
pub struct RawVma {
    pub start: u64,
    pub end: u64,
    pub perms: VmPerms,
    pub offset: u64,
    pub dev: (u32, u32),
    pub inode: u64,
    pub name: MappingName,
}

#[derive(Debug)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub perms: VmPerms,
    pub offset: u64,
    pub dev: (u32, u32),
    pub inode: u64,
    pub name: MappingName,
    pub kind: VmaKind,
    /// First VMA of the group sharing this backing file; `leader == own
    /// index` for group leaders and for mappings without a backing file.
    pub leader: VmaIndex,
    /// Lazily attached in-memory ELF metadata; leaders only.
    pub elf: Option<VmaElf>,
}

impl Vma {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

fn file_name_of(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

fn classify(name: &MappingName, exe: &Path) -> VmaKind {
    match name {
        MappingName::Path(p) => {
            if p == exe {
                return VmaKind::SelfExe;
            }
            let file = file_name_of(p);
            if file.starts_with("libc.so") || file.starts_with("libc-") {
                VmaKind::Libc
            } else if file.starts_with("ld-") || file.starts_with("ld.so") {
                VmaKind::Ld
            } else if file.contains(".so") {
                VmaKind::LibElf
            } else {
                VmaKind::LibUnknown
            }
        }
        MappingName::Heap => VmaKind::Heap,
        MappingName::Stack => VmaKind::Stack,
        MappingName::Vdso => VmaKind::Vdso,
        MappingName::Vvar => VmaKind::Vvar,
        MappingName::Vsyscall => VmaKind::Vsyscall,
        MappingName::Anonymous => VmaKind::Anon,
        MappingName::Other(_) => VmaKind::Unknown,
    }
}

/// The address-indexed set of a target's VMAs.
#[derive(Debug, Default)]
pub struct VmaTable {
    vmas: Vec<Vma>,
    by_start: BTreeMap<u64, VmaIndex>,
}

impl VmaTable {
    /// Classify, group, and index a raw maps snapshot. `exe` is the
    /// target's canonical executable path, used to tag its own mappings.
    pub fn build(mut raw: Vec<RawVma>, exe: &Path) -> VmaTable {
        raw.sort_by_key(|r| r.start);

        let mut vmas = Vec::with_capacity(raw.len());
        let mut by_start = BTreeMap::new();
        let mut leaders: HashMap<PathBuf, VmaIndex> = HashMap::new();

        for (index, raw) in raw.into_iter().enumerate() {
            let kind = classify(&raw.name, exe);
            let leader = match raw.name.as_path() {
                Some(p) => *leaders.entry(p.to_path_buf()).or_insert(index),
                None => index,
            };
            by_start.insert(raw.start, index);
            vmas.push(Vma {
                start: raw.start,
                end: raw.end,
                perms: raw.perms,
                offset: raw.offset,
                dev: raw.dev,
                inode: raw.inode,
                name: raw.name,
                kind,
                leader,
                elf: None,
            });
        }

        VmaTable { vmas, by_start }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn get(&self, index: VmaIndex) -> &Vma {
        &self.vmas[index]
    }

    pub fn get_mut(&mut self, index: VmaIndex) -> &mut Vma {
        &mut self.vmas[index]
    }

    /// The VMA covering `addr`, if any.
    pub fn find_vma(&self, addr: u64) -> Option<VmaIndex> {
        let (_, &index) = self.by_start.range(..=addr).next_back()?;
        self.vmas[index].contains(addr).then_some(index)
    }

    /// First VMA of the given kind, in address order.
    pub fn find_by_kind(&self, kind: VmaKind) -> Option<VmaIndex> {
        self.vmas.iter().position(|v| v.kind == kind)
    }

    /// Indices of the group led by `leader`, in address order.
    pub fn group_of(&self, leader: VmaIndex) -> Vec<VmaIndex> {
        (0..self.vmas.len())
            .filter(|&i| self.vmas[i].leader == leader)
            .collect()
    }

    /// First inter-VMA gap of at least `size` bytes, page aligned.
    pub fn find_span(&self, size: u64) -> Option<u64> {
        self.find_span_in(size, 0, u64::MAX)
    }

    /// First inter-VMA gap of at least `size` bytes whose pages fall
    /// entirely inside `[lo, hi)`. Gaps before the first and after the last
    /// mapping are not considered.
    pub fn find_span_in(&self, size: u64, lo: u64, hi: u64) -> Option<u64> {
        let page = page_size();
        for pair in self.vmas.windows(2) {
            let gap_start = align_up(pair[0].end, page).max(align_up(lo, page));
            let gap_end = pair[1].start.min(hi);
            if gap_start < gap_end && gap_end - gap_start >= size {
                return Some(gap_start);
            }
        }
        None
    }

    /// Check the pairwise no-overlap invariant. The kernel guarantees it
    /// for a single read; a violation means we raced a remap without
    /// rereading.
    pub fn check_no_overlap(&self) -> Result<()> {
        for pair in self.vmas.windows(2) {
            if pair[0].end > pair[1].start {
                bail!(
                    "overlapping VMAs: {:#x}-{:#x} and {:#x}-{:#x}",
                    pair[0].start,
                    pair[0].end,
                    pair[1].start,
                    pair[1].end
                );
            }
        }
        Ok(())
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    value.next_multiple_of(align)
}

pub fn page_size() -> u64 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 { page as u64 } else { 4096 }
}

/// Snapshot the target's maps through procfs.
pub fn read_raw_maps(pid: nix::unistd::Pid) -> Result<Vec<RawVma>> {
    use procfs::process::{MMPermissions, MMapPath, Process};

    let proc = Process::new(pid.as_raw())
        .with_context(|| format!("no such process: pid {pid}"))?;
    let maps = proc
        .maps()
        .with_context(|| format!("read /proc/{pid}/maps"))?;

    let raw = maps
        .into_iter()
        .map(|map| {
            let (start, end) = map.address;
            let name = match map.pathname {
                MMapPath::Path(p) => MappingName::Path(p),
                MMapPath::Heap => MappingName::Heap,
                MMapPath::Stack => MappingName::Stack,
                MMapPath::TStack(tid) => MappingName::Other(format!("stack:{tid}")),
                MMapPath::Vdso => MappingName::Vdso,
                MMapPath::Vvar => MappingName::Vvar,
                MMapPath::Vsyscall => MappingName::Vsyscall,
                MMapPath::Anonymous => MappingName::Anonymous,
                MMapPath::Rollup => MappingName::Other("rollup".into()),
                MMapPath::Vsys(key) => MappingName::Other(format!("vsys:{key}")),
                MMapPath::Other(s) => MappingName::Other(s),
            };
            RawVma {
                start,
                end,
                perms: VmPerms {
                    read: map.perms.contains(MMPermissions::READ),
                    write: map.perms.contains(MMPermissions::WRITE),
                    exec: map.perms.contains(MMPermissions::EXECUTE),
                    shared: map.perms.contains(MMPermissions::SHARED),
                },
                offset: map.offset,
                dev: (map.dev.0 as u32, map.dev.1 as u32),
                inode: map.inode,
                name,
            }
        })
        .collect();
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: u64, end: u64, perms: &str, offset: u64, name: MappingName) -> RawVma {
        RawVma {
            start,
            end,
            perms: VmPerms {
                read: perms.contains('r'),
                write: perms.contains('w'),
                exec: perms.contains('x'),
                shared: perms.contains('s'),
            },
            offset,
            dev: (0xfd, 0),
            inode: 1,
            name,
        }
    }

    fn lib(p: &str) -> MappingName {
        MappingName::Path(PathBuf::from(p))
    }

    /// A layout shaped like a real glibc process: exe, heap, multi-segment
    /// libc, ld, stack, vdso.
    fn sample_table() -> VmaTable {
        let exe = PathBuf::from("/usr/bin/sleeper");
        let raws = vec![
            raw(0x400000, 0x401000, "r--", 0, lib("/usr/bin/sleeper")),
            raw(0x401000, 0x45f000, "r-x", 0x1000, lib("/usr/bin/sleeper")),
            raw(0x45f000, 0x460000, "rw-", 0x5f000, lib("/usr/bin/sleeper")),
            raw(0x800000, 0x900000, "rw-", 0, MappingName::Heap),
            raw(
                0x7f0000000000,
                0x7f0000028000,
                "r--",
                0,
                lib("/usr/lib64/libc.so.6"),
            ),
            raw(
                0x7f0000028000,
                0x7f00001bd000,
                "r-x",
                0x28000,
                lib("/usr/lib64/libc.so.6"),
            ),
            raw(
                0x7f00001bd000,
                0x7f0000215000,
                "r--",
                0x1bd000,
                lib("/usr/lib64/libc.so.6"),
            ),
            raw(
                0x7f0000215000,
                0x7f0000219000,
                "rw-",
                0x214000,
                lib("/usr/lib64/libc.so.6"),
            ),
            raw(
                0x7f0000400000,
                0x7f0000402000,
                "r-x",
                0,
                lib("/usr/lib64/ld-linux-x86-64.so.2"),
            ),
            raw(0x7ffc00000000, 0x7ffc00021000, "rw-", 0, MappingName::Stack),
            raw(0x7ffc00021000, 0x7ffc00023000, "r-x", 0, MappingName::Vdso),
        ];
        VmaTable::build(raws, &exe)
    }

    #[test]
    fn classifies_and_groups_mappings() {
        let table = sample_table();
        assert_eq!(table.get(0).kind, VmaKind::SelfExe);
        assert_eq!(table.get(3).kind, VmaKind::Heap);
        assert_eq!(table.get(4).kind, VmaKind::Libc);
        assert_eq!(table.get(8).kind, VmaKind::Ld);
        assert_eq!(table.get(9).kind, VmaKind::Stack);
        assert_eq!(table.get(10).kind, VmaKind::Vdso);

        // Every libc sibling links back to the first libc mapping.
        for i in 4..8 {
            assert_eq!(table.get(i).leader, 4);
        }
        assert_eq!(table.group_of(4), vec![4, 5, 6, 7]);
        // Anonymous mappings lead themselves.
        assert_eq!(table.get(3).leader, 3);
    }

    #[test]
    fn find_vma_is_a_point_lookup() {
        let table = sample_table();
        assert_eq!(table.find_vma(0x401fff), Some(1));
        assert_eq!(table.find_vma(0x400000), Some(0));
        assert_eq!(table.find_vma(0x460000), None);
        assert_eq!(table.find_vma(0x7f0000028abc), Some(5));
        assert_eq!(table.find_vma(0), None);
    }

    #[test]
    fn find_span_returns_first_fitting_gap() {
        let table = sample_table();
        // First gap is between the exe's rw segment (ends 0x460000) and the
        // heap (starts 0x800000).
        assert_eq!(table.find_span(0x1000), Some(0x460000));
        // A window above the heap skips that gap.
        assert_eq!(
            table.find_span_in(0x1000, 0xa00000, u64::MAX),
            Some(0xa00000)
        );
        // Gaps are never larger than the space between neighbors.
        assert_eq!(table.find_span_in(1 << 40, 0, u64::MAX), None);
    }

    #[test]
    fn no_overlap_invariant_holds() {
        let table = sample_table();
        table.check_no_overlap().unwrap();
    }

    #[test]
    fn overlap_is_detected() {
        let exe = PathBuf::from("/x");
        let table = VmaTable::build(
            vec![
                raw(0x1000, 0x3000, "rw-", 0, MappingName::Anonymous),
                raw(0x2000, 0x4000, "rw-", 0, MappingName::Anonymous),
            ],
            &exe,
        );
        assert!(table.check_no_overlap().is_err());
    }

    #[test]
    fn libc_prefix_variants_are_recognized() {
        let exe = PathBuf::from("/x");
        for name in ["/lib/libc.so.6", "/lib/libc-2.31.so"] {
            assert_eq!(classify(&lib(name), &exe), VmaKind::Libc);
        }
        assert_eq!(classify(&lib("/lib/libm.so.6"), &exe), VmaKind::LibElf);
        assert_eq!(classify(&lib("/var/data.bin"), &exe), VmaKind::LibUnknown);
    }
}
