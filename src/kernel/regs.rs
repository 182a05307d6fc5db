// Register access for a stopped tracee via PTRACE_GETREGSET.
//
// Callers must only use these while the tracee is in a ptrace stop.

use crate::config::types::{DeptraceError, Result};
use crate::kernel::arch::SyscallRegs;
use nix::unistd::Pid;
use std::mem::MaybeUninit;

const NT_PRSTATUS: usize = 1;
#[cfg(target_arch = "aarch64")]
const NT_ARM_SYSTEM_CALL: usize = 0x404;

/// Fetch one register set of type `T` from a stopped tracee
fn getregset<T>(pid: Pid, note_type: usize, what: &str) -> Result<T> {
    let mut data = MaybeUninit::<T>::zeroed();
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: std::mem::size_of::<T>(),
    };

    // SAFETY: `iov` describes `data`, which is valid for size_of::<T>()
    // writable bytes and outlives the call.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            note_type as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc < 0 {
        return Err(DeptraceError::Tracer(format!(
            "ptrace(PTRACE_GETREGSET, {}) on pid {} failed: {}",
            what,
            pid,
            std::io::Error::last_os_error()
        )));
    }
    if iov.iov_len != std::mem::size_of::<T>() {
        return Err(DeptraceError::Tracer(format!(
            "{} register set for pid {} has unexpected size {}",
            what, pid, iov.iov_len
        )));
    }

    // SAFETY: the kernel filled exactly size_of::<T>() bytes, and every T
    // used here is a plain register struct valid for any bit pattern.
    Ok(unsafe { data.assume_init() })
}

/// Read the syscall number and argument registers of a tracee at a
/// syscall stop
#[cfg(target_arch = "x86_64")]
pub fn read_syscall_regs(pid: Pid) -> Result<SyscallRegs> {
    let regs: libc::user_regs_struct = getregset(pid, NT_PRSTATUS, "NT_PRSTATUS")?;
    Ok(SyscallRegs {
        number: regs.orig_rax,
        args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
    })
}

#[cfg(target_arch = "x86")]
pub fn read_syscall_regs(pid: Pid) -> Result<SyscallRegs> {
    let regs: libc::user_regs_struct = getregset(pid, NT_PRSTATUS, "NT_PRSTATUS")?;
    let word = |v: libc::c_long| v as u32 as u64;
    Ok(SyscallRegs {
        number: word(regs.orig_eax),
        args: [
            word(regs.ebx),
            word(regs.ecx),
            word(regs.edx),
            word(regs.esi),
            word(regs.edi),
            word(regs.ebp),
        ],
    })
}

#[cfg(target_arch = "aarch64")]
pub fn read_syscall_regs(pid: Pid) -> Result<SyscallRegs> {
    let regs: libc::user_regs_struct = getregset(pid, NT_PRSTATUS, "NT_PRSTATUS")?;
    // x8 is clobbered at syscall stops; the kernel exposes the number separately
    let number: libc::c_int = getregset(pid, NT_ARM_SYSTEM_CALL, "NT_ARM_SYSTEM_CALL")?;
    let mut args = [0u64; 6];
    args.copy_from_slice(&regs.regs[..6]);
    Ok(SyscallRegs {
        number: number as u32 as u64,
        args,
    })
}
