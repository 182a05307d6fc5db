//! Architecture descriptors and file-access syscall tables.
//!
//! Each supported architecture carries its own table mapping syscall
//! numbers to the argument slot holding a filesystem path. The tracer picks
//! one `Arch` when it starts and consults only that table afterwards.

use std::fmt;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
compile_error!("deptrace can only trace on x86_64, x86 and aarch64");

/// Static table entry: a file-access syscall and where its path lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallDescriptor {
    pub name: &'static str,
    pub number: u64,
    /// Zero-based argument index of the path pointer
    pub path_arg: usize,
}

const fn desc(name: &'static str, number: u64, path_arg: usize) -> SyscallDescriptor {
    SyscallDescriptor {
        name,
        number,
        path_arg,
    }
}

static X86_64_TABLE: &[SyscallDescriptor] = &[
    desc("open", 2, 0),
    desc("stat", 4, 0),
    desc("lstat", 6, 0),
    desc("execve", 59, 0),
    desc("openat", 257, 1),
    desc("newfstatat", 262, 1),
    desc("name_to_handle_at", 303, 1),
    desc("execveat", 322, 1),
    desc("statx", 332, 1),
];

static I386_TABLE: &[SyscallDescriptor] = &[
    desc("open", 5, 0),
    desc("execve", 11, 0),
    desc("stat", 106, 0),
    desc("lstat", 107, 0),
    desc("stat64", 195, 0),
    desc("lstat64", 196, 0),
    desc("openat", 295, 1),
    desc("fstatat64", 300, 1),
    desc("name_to_handle_at", 341, 1),
    desc("execveat", 358, 1),
    desc("statx", 383, 1),
];

// aarch64 only has the *at family
static AARCH64_TABLE: &[SyscallDescriptor] = &[
    desc("openat", 56, 1),
    desc("newfstatat", 79, 1),
    desc("execve", 221, 0),
    desc("name_to_handle_at", 264, 1),
    desc("execveat", 281, 1),
    desc("statx", 291, 1),
];

/// Supported tracee architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    I386,
    Aarch64,
}

impl Arch {
    /// Architecture of the running tracer
    pub const fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Arch::X86_64
        }
        #[cfg(target_arch = "x86")]
        {
            Arch::I386
        }
        #[cfg(target_arch = "aarch64")]
        {
            Arch::Aarch64
        }
    }

    pub fn syscall_table(self) -> &'static [SyscallDescriptor] {
        match self {
            Arch::X86_64 => X86_64_TABLE,
            Arch::I386 => I386_TABLE,
            Arch::Aarch64 => AARCH64_TABLE,
        }
    }

    /// Descriptor for a syscall number, `None` for calls we do not inspect
    pub fn lookup(self, number: u64) -> Option<&'static SyscallDescriptor> {
        self.syscall_table().iter().find(|d| d.number == number)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::I386 => write!(f, "i386"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

/// Decoded syscall-entry registers: the number and six argument slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallRegs {
    pub number: u64,
    pub args: [u64; 6],
}

impl SyscallRegs {
    /// Path pointer for a file-access syscall on `arch`; `None` when the
    /// call is not in the table
    pub fn path_pointer(&self, arch: Arch) -> Option<(&'static SyscallDescriptor, u64)> {
        let descriptor = arch.lookup(self.number)?;
        Some((descriptor, self.args[descriptor.path_arg]))
    }
}
