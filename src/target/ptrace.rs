//! Attach/detach and register save/restore for the traced target.
//!
//! Attach waits until the tracee is quiescent in group-stop: the initial
//! `SIGSTOP` may race with an in-flight `execve` (which reports `SIGTRAP`),
//! so anything that is not the stop signal is re-delivered and the wait
//! continues. Register copies are whole-file (`PTRACE_GETREGS` on x86-64,
//! `PTRACE_GETREGSET`/`NT_PRSTATUS` on aarch64) so caller-saved and
//! callee-saved state survive a remote syscall verbatim.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::prelude::*;

/// The full general-purpose register file of the target ISA.
pub type Regs = libc::user_regs_struct;

/// `PTRACE_ATTACH` and wait until the tracee has actually stopped.
pub fn attach(pid: Pid) -> Result<()> {
    ptrace::attach(pid).with_context(|| format!("PTRACE_ATTACH pid {pid}"))?;

    loop {
        match waitpid(pid, None).with_context(|| format!("waitpid({pid}) after attach"))? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => return Ok(()),
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                // execve race: swallow the trap and keep waiting for the
                // attach stop.
                trace!("pid {pid}: SIGTRAP while waiting for attach stop");
                ptrace::cont(pid, None)?;
            }
            WaitStatus::Stopped(_, sig) => {
                trace!("pid {pid}: re-delivering {sig} while waiting for attach stop");
                ptrace::cont(pid, sig)?;
            }
            WaitStatus::Exited(_, code) => {
                bail!("pid {pid} exited with status {code} during attach")
            }
            WaitStatus::Signaled(_, sig, _) => {
                bail!("pid {pid} was killed by {sig} during attach")
            }
            status => {
                trace!("pid {pid}: ignoring {status:?} while waiting for attach stop");
            }
        }
    }
}

/// `PTRACE_DETACH`. Valid once per successful [`attach`].
pub fn detach(pid: Pid) -> Result<()> {
    ptrace::detach(pid, None).with_context(|| format!("PTRACE_DETACH pid {pid}"))?;
    Ok(())
}

/// Single-step the tracee and block until it stops again.
///
/// Used to drive a spliced syscall instruction: the kernel completes the
/// syscall and reports the step `SIGTRAP` on the following instruction.
/// A `SIGSEGV` means the splice went wrong and is fatal to the operation
/// (the caller still restores bytes and registers before surfacing it).
pub fn step_and_wait(pid: Pid) -> Result<()> {
    ptrace::step(pid, None).with_context(|| format!("PTRACE_SINGLESTEP pid {pid}"))?;

    loop {
        match waitpid(pid, None).with_context(|| format!("waitpid({pid}) after step"))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP | Signal::SIGSTOP) => return Ok(()),
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                bail!("pid {pid} faulted (SIGSEGV) while stepping the spliced instruction")
            }
            WaitStatus::Stopped(_, sig) => {
                // Unrelated pending signal: re-deliver it and step again.
                trace!("pid {pid}: re-delivering {sig} during syscall step");
                ptrace::step(pid, sig)?;
            }
            WaitStatus::Exited(_, code) => bail!("pid {pid} exited with status {code} mid-step"),
            WaitStatus::Signaled(_, sig, _) => bail!("pid {pid} was killed by {sig} mid-step"),
            status => trace!("pid {pid}: ignoring {status:?} during syscall step"),
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub fn save_gprs(pid: Pid) -> Result<Regs> {
    let regs = ptrace::getregs(pid).with_context(|| format!("PTRACE_GETREGS pid {pid}"))?;
    Ok(regs)
}

#[cfg(target_arch = "x86_64")]
pub fn restore_gprs(pid: Pid, regs: &Regs) -> Result<()> {
    ptrace::setregs(pid, *regs).with_context(|| format!("PTRACE_SETREGS pid {pid}"))?;
    Ok(())
}

#[cfg(target_arch = "aarch64")]
pub fn save_gprs(pid: Pid) -> Result<Regs> {
    let regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(pid)
        .with_context(|| format!("PTRACE_GETREGSET(NT_PRSTATUS) pid {pid}"))?;
    Ok(regs)
}

#[cfg(target_arch = "aarch64")]
pub fn restore_gprs(pid: Pid, regs: &Regs) -> Result<()> {
    ptrace::setregset::<ptrace::regset::NT_PRSTATUS>(pid, *regs)
        .with_context(|| format!("PTRACE_SETREGSET(NT_PRSTATUS) pid {pid}"))?;
    Ok(())
}
