//! Poking branches into the target and undoing them.
//!
//! A call site is redirected with a direct branch when the destination is
//! within reach, otherwise through a jump-table entry (an absolute far jump)
//! placed in a one-page mapping materialized inside a free span near the
//! call site. Every install captures the original bytes so removal is a
//! byte-exact restore.
//!
//! Poking a live call site while another thread executes inside it can
//! expose a torn instruction on weakly ordered ISAs; only the thread-group
//! leader is stopped. Known limitation, see DESIGN.md.

use nix::sys::mman::{MapFlags, ProtFlags};

use crate::arch::native;
use crate::prelude::*;
use crate::target::Task;
use crate::target::vma::page_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    pub addr: u64,
    /// Length of the mapping backing the entry, one page.
    pub map_len: usize,
}

/// Everything needed to reverse one installed branch.
#[derive(Debug, Clone)]
pub struct InstallRecord {
    pub call_site: u64,
    pub original: Vec<u8>,
    pub trampoline: Option<Trampoline>,
}

/// Address window a direct branch at `call_site` can reach, shrunk by one
/// page so a mapping starting inside it stays reachable throughout.
fn reach_window(call_site: u64, page: u64) -> (u64, u64) {
    let reach = native::BRANCH_REACH - page;
    (call_site.saturating_sub(reach), call_site.saturating_add(reach))
}

/// Redirect `call_site` to `dst`, via trampoline when out of direct reach.
pub fn install_branch(task: &mut Task, call_site: u64, dst: u64) -> Result<InstallRecord> {
    let mut original = vec![0u8; native::MCOUNT_INSN_SIZE];
    task.read_memory(call_site, &mut original)?;

    if let Ok(branch) = native::encode_jmp(call_site, dst) {
        task.write_memory(call_site, &branch)?;
        debug!("direct branch installed at {call_site:#x} -> {dst:#x}");
        return Ok(InstallRecord {
            call_site,
            original,
            trampoline: None,
        });
    }

    let page = page_size();
    let (lo, hi) = reach_window(call_site, page);
    let span = task
        .vmas()
        .find_span_in(page, lo, hi)
        .with_context(|| {
            format!("no free span within branch reach of {call_site:#x} for a trampoline")
        })?;

    let mapped = task.remote_mmap(
        span,
        page as usize,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
        -1,
        0,
    )?;
    if mapped != span {
        let _ = task.remote_munmap(mapped, page as usize);
        bail!("trampoline mmap landed at {mapped:#x}, wanted {span:#x}");
    }
    task.update_vmas()?;

    let result = (|| -> Result<()> {
        let entry = native::encode_jump_table_entry(dst);
        task.write_memory(span, &entry)?;
        let branch = native::encode_jmp(call_site, span)
            .map_err(|err| anyhow!(err).context("branch to trampoline"))?;
        task.write_memory(call_site, &branch)?;
        Ok(())
    })();
    if let Err(err) = result {
        // A failed call-site store may have been torn mid-word; put the
        // originals back before dropping the trampoline page.
        if let Err(rerr) = task.write_memory(call_site, &original) {
            warn!("restoring call site {call_site:#x}: {rerr:#}");
        }
        if let Err(merr) = task.remote_munmap(span, page as usize) {
            warn!("unwinding trampoline at {span:#x}: {merr:#}");
        }
        let _ = task.update_vmas();
        return Err(err);
    }

    debug!("trampoline branch installed at {call_site:#x} -> {span:#x} -> {dst:#x}");
    Ok(InstallRecord {
        call_site,
        original,
        trampoline: Some(Trampoline {
            addr: span,
            map_len: page as usize,
        }),
    })
}

/// Restore the original bytes and tear down the trampoline, if one was
/// allocated. Reversal order is the opposite of install.
pub fn remove_branch(task: &mut Task, record: &InstallRecord) -> Result<()> {
    task.write_memory(record.call_site, &record.original)?;

    if let Some(tramp) = &record.trampoline {
        // Zero the entry before unmapping so nothing can race into a stale
        // absolute target through a lingering mapping.
        let zeros = vec![0u8; native::JUMP_TABLE_ENTRY_SIZE];
        task.write_memory(tramp.addr, &zeros)?;
        task.remote_munmap(tramp.addr, tramp.map_len)?;
        task.update_vmas()?;
    }

    debug!("call site {:#x} restored", record.call_site);
    Ok(())
}

/// Raw branch poke between two addresses, no bookkeeping. Returns the
/// overwritten bytes so a caller can undo it by hand.
pub fn poke_jump(task: &mut Task, from: u64, to: u64) -> Result<Vec<u8>> {
    let mut original = vec![0u8; native::MCOUNT_INSN_SIZE];
    task.read_memory(from, &mut original)?;
    let branch = native::encode_jmp(from, to)
        .map_err(|err| anyhow!(err).context(format!("encode jump {from:#x} -> {to:#x}")))?;
    task.write_memory(from, &branch)?;
    Ok(original)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reach_window_is_symmetric_and_clamped() {
        let page = 4096;
        let (lo, hi) = reach_window(0x7f00_0000_0000, page);
        assert_eq!(hi - 0x7f00_0000_0000, native::BRANCH_REACH - page);
        assert_eq!(0x7f00_0000_0000 - lo, native::BRANCH_REACH - page);

        // Near address zero the window clamps instead of wrapping.
        let (lo, _) = reach_window(0x1000, page);
        assert_eq!(lo, 0);
    }
}
