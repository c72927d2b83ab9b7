//! Remote syscall injection.
//!
//! The target executes syscalls on our behalf without cooperating: a known
//! executable address (start of libc text, the *splice site*) is briefly
//! overwritten with the ISA's syscall instruction, the register file is
//! staged per the syscall ABI with the instruction pointer at the splice,
//! and one `PTRACE_SINGLESTEP` drives the kernel through the call. The
//! saved bytes and registers are put back no matter how the attempt ends;
//! only the initial saves may be skipped on failure.
//!
//! Sequence per call, in strict order: save regs, save bytes, write syscall
//! instruction, set regs, step, read regs, restore bytes, restore regs.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::c_long;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, MsFlags, ProtFlags};

use crate::arch;
use crate::error::RemoteError;
use crate::prelude::*;
use crate::target::{OpenFlags, Task, ptrace};

impl Task {
    /// Execute one syscall inside the target and return its raw result.
    ///
    /// Kernel error returns (-4095..0) become [`RemoteError`] carrying the
    /// target's errno.
    pub fn remote_syscall(&mut self, nr: c_long, args: [u64; 6]) -> Result<i64> {
        if !self.flags.contains(OpenFlags::RDWR) {
            bail!(
                "pid {} opened read-only, remote syscalls need OpenFlags::RDWR",
                self.pid
            );
        }
        let splice = self.splice_addr;
        trace!(
            "pid {}: syscall {nr}({args:x?}) via splice {splice:#x}",
            self.pid
        );

        let saved_regs = ptrace::save_gprs(self.pid)?;
        let mut saved_insn = [0u8; 8];
        let saved_insn = &mut saved_insn[..arch::native::MCOUNT_INSN_SIZE];
        self.memory.read(splice, saved_insn)?;
        self.memory.write(splice, arch::native::SYSCALL_INSN)?;

        let run = (|| -> Result<i64> {
            let mut regs = saved_regs;
            arch::native::stage_syscall_regs(&mut regs, splice, nr as i64, &args);
            ptrace::restore_gprs(self.pid, &regs)?;
            ptrace::step_and_wait(self.pid)?;
            let stopped = ptrace::save_gprs(self.pid)?;
            Ok(arch::native::syscall_ret(&stopped))
        })();

        // Cleanup is unconditional: the splice site and the register file
        // go back to their saved state on the failure path too.
        let bytes_restored = self.memory.write(splice, saved_insn);
        let regs_restored = ptrace::restore_gprs(self.pid, &saved_regs);

        let ret = run?;
        bytes_restored.context("restore splice-site bytes")?;
        regs_restored.context("restore target registers")?;

        if (-4095..0).contains(&ret) {
            return Err(RemoteError {
                nr: nr as i64,
                errno: (-ret) as i32,
            }
            .into());
        }
        Ok(ret)
    }

    pub fn remote_mmap(
        &mut self,
        addr: u64,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: u64,
    ) -> Result<u64> {
        let ret = self.remote_syscall(
            libc::SYS_mmap,
            [
                addr,
                length as u64,
                prot.bits() as u64,
                flags.bits() as u64,
                fd as i64 as u64,
                offset,
            ],
        )?;
        Ok(ret as u64)
    }

    pub fn remote_munmap(&mut self, addr: u64, length: usize) -> Result<()> {
        self.remote_syscall(libc::SYS_munmap, [addr, length as u64, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn remote_mprotect(&mut self, addr: u64, length: usize, prot: ProtFlags) -> Result<()> {
        self.remote_syscall(
            libc::SYS_mprotect,
            [addr, length as u64, prot.bits() as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn remote_msync(&mut self, addr: u64, length: usize, flags: MsFlags) -> Result<()> {
        self.remote_syscall(
            libc::SYS_msync,
            [addr, length as u64, flags.bits() as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    /// Open a file inside the target. Symlinks are resolved on our side
    /// first (both processes share a mount namespace in the intended
    /// deployment) except for `O_CREAT`, where the path may not exist yet.
    pub fn remote_open(&mut self, path: &Path, flags: OFlag, mode: u32) -> Result<i32> {
        let path = if flags.contains(OFlag::O_CREAT) {
            path.to_path_buf()
        } else {
            std::fs::canonicalize(path)
                .with_context(|| format!("resolve {} before remote open", path.display()))?
        };
        self.open_with_staged_path(&path, flags, mode)
    }

    pub fn remote_openat(
        &mut self,
        dirfd: i32,
        path: &Path,
        flags: OFlag,
        mode: u32,
    ) -> Result<i32> {
        let (remote_path, len) = self.stage_path(path)?;
        let res = self.remote_syscall(
            libc::SYS_openat,
            [
                dirfd as i64 as u64,
                remote_path,
                flags.bits() as u64,
                mode as u64,
                0,
                0,
            ],
        );
        let freed = self.remote_free(remote_path, len);
        let fd = res?;
        freed?;
        Ok(fd as i32)
    }

    fn open_with_staged_path(&mut self, path: &Path, flags: OFlag, mode: u32) -> Result<i32> {
        #[cfg(target_arch = "x86_64")]
        {
            let (remote_path, len) = self.stage_path(path)?;
            let res = self.remote_syscall(
                libc::SYS_open,
                [remote_path, flags.bits() as u64, mode as u64, 0, 0, 0],
            );
            let freed = self.remote_free(remote_path, len);
            let fd = res?;
            freed?;
            Ok(fd as i32)
        }
        #[cfg(target_arch = "aarch64")]
        {
            // No open(2) on aarch64.
            self.remote_openat(libc::AT_FDCWD, path, flags, mode)
        }
    }

    /// Materialize a NUL-terminated pathname in the target. Returns the
    /// remote address and the allocation length for [`Task::remote_free`].
    fn stage_path(&mut self, path: &Path) -> Result<(u64, usize)> {
        let mut bytes = path.as_os_str().as_bytes().to_vec();
        bytes.push(0);
        let len = bytes.len();
        let remote = self.remote_malloc(len)?;
        if let Err(err) = self.memory.write(remote, &bytes) {
            let _ = self.remote_free(remote, len);
            return Err(err.context("copy pathname into target"));
        }
        Ok((remote, len))
    }

    pub fn remote_close(&mut self, fd: i32) -> Result<()> {
        self.remote_syscall(libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn remote_ftruncate(&mut self, fd: i32, length: u64) -> Result<()> {
        self.remote_syscall(libc::SYS_ftruncate, [fd as u64, length, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn remote_fstat(&mut self, fd: i32) -> Result<libc::stat> {
        let len = size_of::<libc::stat>();
        let remote = self.remote_malloc(len)?;
        let res = self.remote_syscall(libc::SYS_fstat, [fd as u64, remote, 0, 0, 0, 0]);
        let mut buf = vec![0u8; len];
        let read = res.and_then(|_| self.memory.read(remote, &mut buf));
        let freed = self.remote_free(remote, len);
        read?;
        freed?;
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), (&raw mut st).cast::<u8>(), len);
        }
        Ok(st)
    }

    pub fn remote_prctl(&mut self, option: i32, args: [u64; 4]) -> Result<i64> {
        self.remote_syscall(
            libc::SYS_prctl,
            [option as u64, args[0], args[1], args[2], args[3], 0],
        )
    }

    /// Anonymous private read-write mapping in the target; the crate's
    /// stand-in for malloc when staging data remotely.
    pub fn remote_malloc(&mut self, length: usize) -> Result<u64> {
        self.remote_mmap(
            0,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    }

    pub fn remote_free(&mut self, addr: u64, length: usize) -> Result<()> {
        self.remote_munmap(addr, length)
    }
}
