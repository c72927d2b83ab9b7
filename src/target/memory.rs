//! Reads and writes of another process's address space.
//!
//! This is the only place that touches `/proc/<pid>/mem` or the ptrace
//! data channel; everything else in the crate goes through [`TargetMemory`].
//! The fast path is positional I/O on `/proc/<pid>/mem`, which works at any
//! alignment and ignores page protections for a ptrace-stopped target. When
//! that file cannot be opened or a transfer fails, the word-at-a-time
//! `PTRACE_PEEKDATA`/`PTRACE_POKEDATA` path takes over, with read-modify-write
//! for sub-word head and tail slices.
//!
//! Transfers either complete in full or fail; a short read or write is
//! reported as an error, never truncated silently.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use libc::c_long;
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::prelude::*;

const WORD: usize = size_of::<c_long>();

pub struct TargetMemory {
    pid: Pid,
    mem: Option<File>,
}

impl TargetMemory {
    /// Open `/proc/<pid>/mem`. A failure to open is not fatal: the accessor
    /// degrades to the ptrace word path.
    pub fn open(pid: Pid, writable: bool) -> Self {
        let path = format!("/proc/{pid}/mem");
        let mem = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|err| {
                warn!("cannot open {path}: {err}, falling back to PTRACE_PEEKDATA/POKEDATA");
                err
            })
            .ok();
        TargetMemory { pid, mem }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Read `buf.len()` bytes at `addr` in the target. Page-boundary
    /// crossings are fine; a short transfer is an error.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(mem) = &self.mem {
            match mem.read_exact_at(buf, addr) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(
                        "pread of {} bytes at {addr:#x} in pid {} failed ({err}), retrying via ptrace",
                        buf.len(),
                        self.pid
                    );
                }
            }
        }
        self.peek_range(addr, buf)
            .with_context(|| format!("read {} bytes at {addr:#x} in pid {}", buf.len(), self.pid))
    }

    /// Write `data` at `addr` in the target. A short transfer is an error.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(mem) = &self.mem {
            match mem.write_all_at(data, addr) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(
                        "pwrite of {} bytes at {addr:#x} in pid {} failed ({err}), retrying via ptrace",
                        data.len(),
                        self.pid
                    );
                }
            }
        }
        self.poke_range(addr, data)
            .with_context(|| format!("write {} bytes at {addr:#x} in pid {}", data.len(), self.pid))
    }

    fn peek_word(&self, addr: u64) -> Result<[u8; WORD]> {
        let word = ptrace::read(self.pid, addr as ptrace::AddressType)
            .with_context(|| format!("PTRACE_PEEKDATA at {addr:#x}"))?;
        Ok(word.to_ne_bytes())
    }

    fn poke_word(&self, addr: u64, bytes: [u8; WORD]) -> Result<()> {
        let word = c_long::from_ne_bytes(bytes);
        unsafe { ptrace::write(self.pid, addr as ptrace::AddressType, word) }
            .with_context(|| format!("PTRACE_POKEDATA at {addr:#x}"))?;
        Ok(())
    }

    fn peek_range(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let end = addr + buf.len() as u64;
        let mut cur = addr & !(WORD as u64 - 1);
        while cur < end {
            let bytes = self.peek_word(cur)?;
            let from = addr.saturating_sub(cur) as usize;
            let to = WORD.min((end - cur) as usize);
            let out = (cur + from as u64 - addr) as usize;
            buf[out..out + (to - from)].copy_from_slice(&bytes[from..to]);
            cur += WORD as u64;
        }
        Ok(())
    }

    fn poke_range(&self, addr: u64, data: &[u8]) -> Result<()> {
        let end = addr + data.len() as u64;
        let mut cur = addr & !(WORD as u64 - 1);
        while cur < end {
            let from = addr.saturating_sub(cur) as usize;
            let to = WORD.min((end - cur) as usize);
            let mut bytes = if from == 0 && to == WORD {
                [0u8; WORD]
            } else {
                // Partial word: merge into the target's current contents.
                self.peek_word(cur)?
            };
            let src = (cur + from as u64 - addr) as usize;
            bytes[from..to].copy_from_slice(&data[src..src + (to - from)]);
            self.poke_word(cur, bytes)?;
            cur += WORD as u64;
        }
        Ok(())
    }
}
