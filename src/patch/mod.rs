//! Patch lifecycle: parse, stage into the target, relocate, install,
//! remove.
//!
//! State machine per patch:
//!
//! ```text
//! UNLOADED -> PARSED -> STAGED -> RELOCATED -> ACTIVE -> UNLOADED
//! ```
//!
//! Relocation failure unwinds STAGED -> UNLOADED by unmapping the image; no
//! call site has been touched at that point. Install failure unwinds
//! RELOCATED -> UNLOADED the same way after restoring any bytes the install
//! already poked. Removal restores the call site, zeroes and unmaps the
//! trampoline, unmaps the image, and drops the registry entry.

use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags};
use object::{Object, ObjectSection, ObjectSymbol};

use crate::arch::native;
use crate::prelude::*;
use crate::registry::PatchRecord;
use crate::target::Task;

pub mod install;
pub mod load_info;
pub mod relocate;

use install::InstallRecord;
use load_info::{LoadInfo, UpatchInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unloaded,
    Parsed,
    Staged,
    Relocated,
    Active,
}

pub struct Patch {
    load_info: LoadInfo,
    state: PatchState,
    image_base: u64,
    /// Registry copy the target opened, when the Task is registered.
    staged: Option<(String, PathBuf)>,
    install: Option<InstallRecord>,
}

impl Patch {
    /// Run the full lifecycle against an attached target: stage the object
    /// in the target, resolve and relocate it, redirect the patched
    /// function. On any failure the target is left as it was found.
    pub fn load(task: &mut Task, path: &Path) -> Result<Patch> {
        let load_info = LoadInfo::parse(path)?;
        let mut patch = Patch {
            load_info,
            state: PatchState::Parsed,
            image_base: 0,
            staged: None,
            install: None,
        };

        patch.stage(task)?;
        if let Err(err) = patch.link(task) {
            patch.unwind(task);
            return Err(err);
        }
        patch.register(task);

        info!(
            "patch `{}` active in pid {}: `{}` redirected",
            patch.load_info.path().display(),
            task.pid(),
            patch.load_info.info.target_func,
        );
        Ok(patch)
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn info(&self) -> &UpatchInfo {
        &self.load_info.info
    }

    /// Stage the patch file into the target: the target opens it (the
    /// registry copy when one exists), grows it to size, and maps it
    /// private R|W|X; then the bytes are copied in through target memory,
    /// so edits never reach the file.
    fn stage(&mut self, task: &mut Task) -> Result<()> {
        let len = self.load_info.len();
        let open_path = match task.registry() {
            Some(registry) => {
                let (name, path) = registry.stage_patch(self.load_info.path())?;
                self.staged = Some((name, path.clone()));
                path
            }
            None => self.load_info.path().to_path_buf(),
        };

        let fd = task.remote_open(&open_path, OFlag::O_RDWR, 0)?;
        let mapped = (|| -> Result<u64> {
            task.remote_ftruncate(fd, len as u64)?;
            task.remote_mmap(
                0,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE,
                fd,
                0,
            )
        })();
        let closed = task.remote_close(fd);
        let base = mapped?;
        closed?;

        let copied = (|| -> Result<()> {
            task.update_vmas()?;
            task.write_memory(base, self.load_info.bytes())
        })();
        if let Err(err) = copied {
            if let Err(merr) = task.remote_munmap(base, len) {
                warn!("unwinding staged image at {base:#x}: {merr:#}");
            }
            let _ = task.update_vmas();
            return Err(err);
        }

        self.image_base = base;
        self.state = PatchState::Staged;
        debug!(
            "staged {} ({len} bytes) at {base:#x} in pid {}",
            self.load_info.path().display(),
            task.pid()
        );
        Ok(())
    }

    fn link(&mut self, task: &mut Task) -> Result<()> {
        relocate::apply_relocations(task, &self.load_info, self.image_base)?;
        self.state = PatchState::Relocated;
        self.install(task)?;
        self.state = PatchState::Active;
        Ok(())
    }

    fn install(&mut self, task: &mut Task) -> Result<()> {
        let target_func = self.load_info.info.target_func.clone();
        let call_site = task
            .symbol_runtime_addr(&target_func)
            .with_context(|| format!("locate patched function `{target_func}`"))?;

        // A function shorter than the call-site replacement cannot be
        // redirected without clobbering its successor.
        if let Some(sym) = task.find_symbol(&target_func) {
            if sym.size > 0 && (sym.size as usize) < native::MCOUNT_INSN_SIZE {
                bail!(
                    "function `{target_func}` is {} bytes, shorter than the {}-byte call site",
                    sym.size,
                    native::MCOUNT_INSN_SIZE
                );
            }
        }

        let dst = self.replacement_addr()?;
        // Fill the replace_addr placeholder in the staged image's metadata
        // record so the target self-describes what is linked in.
        let info_addr =
            self.image_base + self.load_info.info_offset + UpatchInfo::REPLACE_ADDR_OFFSET;
        task.write_memory(info_addr, &dst.to_le_bytes())?;

        debug!("redirecting `{target_func}` at {call_site:#x} to {dst:#x}");
        self.install = Some(install::install_branch(task, call_site, dst)?);
        Ok(())
    }

    /// Runtime address of the replacement function inside the staged image:
    /// the patch's global function whose name matches (or suffixes) the
    /// target, falling back to its only global function.
    fn replacement_addr(&self) -> Result<u64> {
        let obj = object::File::parse(self.load_info.bytes())?;
        let target_func = &self.load_info.info.target_func;

        let mut candidates = Vec::new();
        for sym in obj.symbols() {
            if sym.is_undefined() || !sym.is_global() || sym.kind() != object::SymbolKind::Text {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            let Some(section_index) = sym.section_index() else {
                continue;
            };
            candidates.push((name.to_string(), section_index, sym.address()));
        }

        let (name, section_index, value) = candidates
            .iter()
            .find(|(name, ..)| name == target_func || name.ends_with(target_func.as_str()))
            .or_else(|| candidates.first())
            .with_context(|| {
                format!("patch object defines no global function to replace `{target_func}`")
            })?;
        let section = obj.section_by_index(*section_index)?;
        let (offset, _) = section
            .file_range()
            .with_context(|| format!("replacement `{name}` lives in a section with no file data"))?;
        Ok(self.image_base + offset + value)
    }

    fn register(&self, task: &Task) {
        let Some(registry) = task.registry() else {
            return;
        };
        let (Some((name, _)), Some(install)) = (&self.staged, &self.install) else {
            return;
        };
        let record = PatchRecord {
            patch_file: name.clone(),
            source: self.load_info.path().to_path_buf(),
            target_func: self.load_info.info.target_func.clone(),
            author: self.load_info.info.author.clone(),
            call_site: install.call_site,
            original: install.original.clone(),
            image_base: self.image_base,
            image_len: self.load_info.len() as u64,
            trampoline_addr: install.trampoline.map(|t| t.addr),
            trampoline_len: install.trampoline.map(|t| t.map_len as u64),
        };
        // The registry is advisory; failing to record is not fatal.
        if let Err(err) = registry.write_record(&record) {
            warn!("record patch in registry: {err:#}");
        }
    }

    /// Remove an active patch: restore the call site, tear down the
    /// trampoline, unmap the image, drop the registry entry.
    pub fn unload(mut self, task: &mut Task) -> Result<()> {
        if let Some(record) = self.install.take() {
            install::remove_branch(task, &record)?;
        }
        if self.image_base != 0 {
            task.remote_munmap(self.image_base, self.load_info.len())?;
            task.update_vmas()?;
            self.image_base = 0;
        }
        if let (Some((name, _)), Some(registry)) = (&self.staged, task.registry()) {
            if let Err(err) = registry.remove_named(name) {
                warn!("drop registry entry {name}: {err:#}");
            }
        }
        self.state = PatchState::Unloaded;
        Ok(())
    }

    /// Best-effort teardown on a failure path. Ordering mirrors
    /// [`Patch::unload`]; errors are logged, the first failure does not
    /// stop the rest of the unwind.
    fn unwind(&mut self, task: &mut Task) {
        if let Some(record) = self.install.take() {
            if let Err(err) = install::remove_branch(task, &record) {
                warn!("unwind call site {:#x}: {err:#}", record.call_site);
            }
        }
        if self.image_base != 0 {
            if let Err(err) = task.remote_munmap(self.image_base, self.load_info.len()) {
                warn!("unwind staged image at {:#x}: {err:#}", self.image_base);
            }
            let _ = task.update_vmas();
            self.image_base = 0;
        }
        if let (Some((name, _)), Some(registry)) = (self.staged.take(), task.registry()) {
            if let Err(err) = registry.remove_named(&name) {
                warn!("drop registry entry {name}: {err:#}");
            }
        }
        self.state = PatchState::Unloaded;
    }
}

/// Remove a patch recorded on disk, possibly by a previous tool run:
/// everything needed for reversal comes from the registry record.
pub fn remove_patch(task: &mut Task, patch: &Path) -> Result<()> {
    let record = {
        let registry = task
            .registry()
            .context("target was opened without OpenFlags::REGISTER_ON_DISK")?;
        registry.find_record(patch)?.with_context(|| {
            format!(
                "no installed patch matches {} for pid {}",
                patch.display(),
                task.pid()
            )
        })?
    };

    // Reverse order of install: call site first, then the trampoline, then
    // the image.
    task.write_memory(record.call_site, &record.original)?;
    if let (Some(addr), Some(len)) = (record.trampoline_addr, record.trampoline_len) {
        let zeros = vec![0u8; native::JUMP_TABLE_ENTRY_SIZE];
        task.write_memory(addr, &zeros)?;
        task.remote_munmap(addr, len as usize)?;
    }
    task.remote_munmap(record.image_base, record.image_len as usize)?;
    task.update_vmas()?;

    if let Some(registry) = task.registry() {
        registry.remove_record(&record)?;
    }
    info!(
        "patch `{}` removed from pid {}",
        record.target_func,
        task.pid()
    );
    Ok(())
}
