//! The traced target process.
//!
//! A [`Task`] owns one attachment session: the pid stays ptrace-stopped (in
//! group-stop) between [`Task::open`] and [`Task::close`], and everything the
//! crate does to the target's memory or registers flows through it. One Task
//! is owned by one thread of control for its whole life; remote operations
//! take `&mut self` and are therefore strictly serialized.

use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::prelude::*;
use crate::registry::Registry;
use crate::symbols::{self, Symbol, SymbolIndex};

pub mod memory;
pub mod ptrace;
pub mod syscall;
pub mod vma;
pub mod vma_elf;

use memory::TargetMemory;
use vma::{VmaIndex, VmaKind, VmaTable};
use vma_elf::VmaElf;

/// Capabilities requested when opening a target. What is not requested is
/// not loaded; patching wants [`OpenFlags::for_patching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    /// Open target memory for writing, not just inspection.
    pub const RDWR: OpenFlags = OpenFlags(1 << 0);
    /// Attach ELF metadata to the target's own executable mapping.
    pub const LOAD_SELF_ELF: OpenFlags = OpenFlags(1 << 1);
    /// Attach ELF metadata to the libc mapping.
    pub const LOAD_LIBC_ELF: OpenFlags = OpenFlags(1 << 2);
    /// Kept for call sites that only inspect mappings; the VMA table itself
    /// is always read, the Task cannot exist without it.
    pub const LOAD_VMAS: OpenFlags = OpenFlags(1 << 3);
    /// Attach ELF metadata to every file-backed leader and the vdso.
    pub const LOAD_VMA_ELFS: OpenFlags = OpenFlags(1 << 4);
    /// Build the symbol index (implies the ELF loads it needs).
    pub const LOAD_SYMBOLS: OpenFlags = OpenFlags(1 << 5);
    /// Record this target in the on-disk registry.
    pub const REGISTER_ON_DISK: OpenFlags = OpenFlags(1 << 6);

    /// Everything a patch load needs.
    pub fn for_patching() -> OpenFlags {
        Self::RDWR
            | Self::LOAD_VMAS
            | Self::LOAD_VMA_ELFS
            | Self::LOAD_SYMBOLS
            | Self::REGISTER_ON_DISK
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

pub struct Task {
    pid: Pid,
    comm: String,
    exe: PathBuf,
    flags: OpenFlags,
    pub(crate) memory: TargetMemory,
    pub(crate) vmas: VmaTable,
    libc_vma: VmaIndex,
    stack_vma: VmaIndex,
    /// Known-executable byte range used to splice syscall instructions:
    /// start of libc's executable mapping.
    pub(crate) splice_addr: u64,
    pub(crate) symbols: SymbolIndex,
    registry: Option<Registry>,
    attached: bool,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid.as_raw())
            .field("comm", &self.comm)
            .field("exe", &self.exe)
            .field("vmas", &self.vmas.len())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl Task {
    /// Attach to `pid` and load what `flags` ask for. On any failure after
    /// the attach the tracee is detached again before the error surfaces.
    pub fn open(pid: i32, flags: OpenFlags) -> Result<Task> {
        let pid = Pid::from_raw(pid);
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .with_context(|| format!("no such process: pid {pid}"))?
            .trim()
            .to_string();
        let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
            .with_context(|| format!("read /proc/{pid}/exe"))?;

        ptrace::attach(pid)?;
        match Self::init(pid, comm, exe, flags) {
            Ok(task) => Ok(task),
            Err(err) => {
                if let Err(derr) = ptrace::detach(pid) {
                    warn!("detach after failed open of pid {pid}: {derr}");
                }
                Err(err)
            }
        }
    }

    fn init(pid: Pid, comm: String, exe: PathBuf, flags: OpenFlags) -> Result<Task> {
        let memory = TargetMemory::open(pid, flags.contains(OpenFlags::RDWR));
        let mut task = Task {
            pid,
            comm,
            exe,
            flags,
            memory,
            vmas: VmaTable::default(),
            libc_vma: 0,
            stack_vma: 0,
            splice_addr: 0,
            symbols: SymbolIndex::default(),
            registry: None,
            attached: true,
        };
        task.read_maps()?;
        if flags.contains(OpenFlags::LOAD_SYMBOLS) {
            task.load_symbols();
        }
        if flags.contains(OpenFlags::REGISTER_ON_DISK) {
            task.registry = Some(Registry::create(pid.as_raw(), &task.comm)?);
        }
        debug!("opened {task:?}");
        Ok(task)
    }

    /// Detach and consume the Task.
    pub fn close(mut self) -> Result<()> {
        self.attached = false;
        ptrace::detach(self.pid)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn comm(&self) -> &str {
        &self.comm
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn cwd(&self) -> Result<PathBuf> {
        let pid = self.pid;
        std::fs::read_link(format!("/proc/{pid}/cwd"))
            .with_context(|| format!("read /proc/{pid}/cwd"))
    }

    pub fn vmas(&self) -> &VmaTable {
        &self.vmas
    }

    /// Leader VMA of the libc image, anchor for the syscall splice site.
    pub fn libc_vma(&self) -> &vma::Vma {
        self.vmas.get(self.vmas.get(self.libc_vma).leader)
    }

    pub fn stack_vma(&self) -> &vma::Vma {
        self.vmas.get(self.stack_vma)
    }

    pub fn symbols(&self) -> &SymbolIndex {
        &self.symbols
    }

    pub(crate) fn registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }

    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Runtime address of a symbol already present in the index.
    pub fn symbol_runtime_addr(&self, name: &str) -> Result<u64> {
        let sym = self
            .find_symbol(name)
            .with_context(|| format!("symbol `{name}` not found in target"))?;
        symbols::runtime_addr(&self.vmas, sym)
    }

    /// Read the target's memory; see [`TargetMemory::read`].
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read(addr, buf)
    }

    /// Write the target's memory. Requires [`OpenFlags::RDWR`].
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.flags.contains(OpenFlags::RDWR) {
            bail!("target pid {} opened read-only", self.pid);
        }
        self.memory.write(addr, data)
    }

    fn read_maps(&mut self) -> Result<()> {
        let raw = vma::read_raw_maps(self.pid)?;
        let mut table = VmaTable::build(raw, &self.exe);
        table.check_no_overlap()?;
        self.attach_vma_elfs(&mut table);

        // Lifecycle invariant: syscall injection needs a splice site in
        // libc text, and sanity-checking needs the stack.
        let libc = table
            .iter()
            .position(|v| v.kind == VmaKind::Libc && v.perms.exec)
            .with_context(|| {
                format!(
                    "pid {}: no executable libc mapping (required for remote syscalls)",
                    self.pid
                )
            })?;
        let stack = table
            .find_by_kind(VmaKind::Stack)
            .with_context(|| format!("pid {}: no stack mapping", self.pid))?;

        self.splice_addr = table.get(libc).start;
        self.libc_vma = libc;
        self.stack_vma = stack;
        self.vmas = table;
        Ok(())
    }

    fn attach_vma_elfs(&self, table: &mut VmaTable) {
        for index in 0..table.len() {
            let vma = table.get(index);
            if vma.leader != index || vma.offset != 0 || !vma.perms.read {
                continue;
            }
            let wanted = match vma.kind {
                VmaKind::SelfExe => {
                    self.flags.contains(OpenFlags::LOAD_SELF_ELF)
                        || self.flags.contains(OpenFlags::LOAD_VMA_ELFS)
                        || self.flags.contains(OpenFlags::LOAD_SYMBOLS)
                }
                VmaKind::Libc => {
                    self.flags.contains(OpenFlags::LOAD_LIBC_ELF)
                        || self.flags.contains(OpenFlags::LOAD_VMA_ELFS)
                        || self.flags.contains(OpenFlags::LOAD_SYMBOLS)
                }
                VmaKind::LibElf | VmaKind::LibUnknown | VmaKind::Ld | VmaKind::Vdso => {
                    self.flags.contains(OpenFlags::LOAD_VMA_ELFS)
                        || self.flags.contains(OpenFlags::LOAD_SYMBOLS)
                }
                _ => false,
            };
            if !wanted {
                continue;
            }
            let name = vma.name.display();
            match VmaElf::read_from(&self.memory, vma.start, &name) {
                Ok(Some(elf)) => table.get_mut(index).elf = Some(elf),
                Ok(None) => {}
                Err(err) => warn!("pid {}: reading ELF of {name}: {err:#}", self.pid),
            }
        }
    }

    fn load_symbols(&mut self) {
        let self_leader = self
            .vmas
            .iter()
            .find(|v| v.kind == VmaKind::SelfExe)
            .map(|v| v.start);
        if let Some(leader) = self_leader {
            if let Err(err) = symbols::load_self_symbols(&mut self.symbols, &self.exe, leader) {
                warn!("pid {}: self symbols: {err:#}", self.pid);
            }
        }

        for index in 0..self.vmas.len() {
            let vma = self.vmas.get(index);
            if vma.leader != index || vma.kind == VmaKind::SelfExe {
                continue;
            }
            let eligible = vma
                .elf
                .as_ref()
                .is_some_and(|e| e.is_shared_lib || vma.kind == VmaKind::Vdso);
            if !eligible {
                continue;
            }
            if let Err(err) =
                symbols::load_dynamic_symbols(&mut self.symbols, &self.memory, &self.vmas, index)
            {
                warn!(
                    "pid {}: symbols of {}: {err:#}",
                    self.pid,
                    self.vmas.get(index).name.display()
                );
            }
        }
        debug!("pid {}: {} symbols indexed", self.pid, self.symbols.len());
    }

    /// Re-read `/proc/<pid>/maps` and rebuild the table. Must be called
    /// after every remote mmap/munmap; any [`VmaIndex`] held across this
    /// call is invalid.
    pub fn update_vmas(&mut self) -> Result<()> {
        let keep: Vec<(u64, VmaElf)> = (0..self.vmas.len())
            .filter_map(|i| {
                let vma = self.vmas.get(i);
                vma.elf.as_ref().map(|e| (vma.start, e.clone()))
            })
            .collect();

        self.read_maps()?;

        // Carry previously attached ELF metadata over to the new table so a
        // mapping change elsewhere does not force rereading every image.
        for (start, elf) in keep {
            if let Some(index) = self.vmas.find_vma(start) {
                let vma = self.vmas.get_mut(index);
                if vma.start == start && vma.elf.is_none() {
                    vma.elf = Some(elf);
                }
            }
        }
        Ok(())
    }

    /// Thread ids of the target, from `/proc/<pid>/task`.
    pub fn threads(&self) -> Result<Vec<i32>> {
        let proc = procfs::process::Process::new(self.pid.as_raw())?;
        let mut tids: Vec<i32> = proc
            .tasks()
            .with_context(|| format!("read /proc/{}/task", self.pid))?
            .filter_map(|t| t.ok().map(|t| t.tid))
            .collect();
        tids.sort_unstable();
        Ok(tids)
    }

    /// Open file descriptors of the target and what they resolve to.
    pub fn fds(&self) -> Result<Vec<(i32, String)>> {
        use procfs::process::FDTarget;

        let proc = procfs::process::Process::new(self.pid.as_raw())?;
        let fds = proc
            .fd()
            .with_context(|| format!("read /proc/{}/fd", self.pid))?
            .filter_map(|fd| fd.ok())
            .map(|fd| {
                let target = match fd.target {
                    FDTarget::Path(p) => p.display().to_string(),
                    FDTarget::Socket(inode) => format!("socket:[{inode}]"),
                    FDTarget::Net(inode) => format!("net:[{inode}]"),
                    FDTarget::Pipe(inode) => format!("pipe:[{inode}]"),
                    FDTarget::AnonInode(kind) => format!("anon_inode:[{kind}]"),
                    FDTarget::MemFD(name) => format!("memfd:{name}"),
                    FDTarget::Other(name, inode) => format!("{name}:[{inode}]"),
                };
                (fd.fd, target)
            })
            .collect();
        Ok(fds)
    }

    /// Copy the bytes of the VMA covering `addr` out of the target.
    pub fn dump_vma(&self, addr: u64) -> Result<Vec<u8>> {
        let index = self
            .vmas
            .find_vma(addr)
            .with_context(|| format!("no mapping covers {addr:#x}; check /proc/{}/maps", self.pid))?;
        let vma = self.vmas.get(index);
        let mut buf = vec![0u8; vma.size() as usize];
        self.memory.read(vma.start, &mut buf)?;
        Ok(buf)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.attached {
            // Best-effort: never leave the target ptrace-stopped.
            if let Err(err) = ptrace::detach(self.pid) {
                warn!("detach pid {} on drop: {err}", self.pid);
            }
        }
    }
}
