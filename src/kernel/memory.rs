//! Reading NUL-terminated strings out of a tracee's address space.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Bytes per `PTRACE_PEEKDATA` transfer
pub const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

/// Initial destination buffer size; doubled whenever the next word would not fit
pub const INITIAL_STRING_CAPACITY: usize = 4096;

/// Hard upper bound on a single string, well past PATH_MAX
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Word-granular access to another address space
pub trait PeekMemory {
    fn peek_word(&self, addr: u64) -> std::result::Result<[u8; WORD_SIZE], Errno>;
}

/// Memory of a ptrace-stopped process
pub struct TraceeMemory {
    pid: Pid,
}

impl TraceeMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl PeekMemory for TraceeMemory {
    fn peek_word(&self, addr: u64) -> std::result::Result<[u8; WORD_SIZE], Errno> {
        ptrace::read(self.pid, addr as usize as ptrace::AddressType).map(|word| word.to_ne_bytes())
    }
}

/// Copy a NUL-terminated byte string starting at `addr`.
///
/// Reads one word at a time into a single owned buffer. The result stops at
/// the first NUL byte. A fault on the very first word yields an empty
/// string; a later fault truncates the string after the last complete word.
pub fn read_c_string<M: PeekMemory + ?Sized>(memory: &M, addr: u64) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(INITIAL_STRING_CAPACITY);
    let mut offset: u64 = 0;

    loop {
        if buf.len() + WORD_SIZE > buf.capacity() {
            let grow_by = buf.capacity();
            buf.reserve_exact(grow_by);
        }

        let word = match memory.peek_word(addr.wrapping_add(offset)) {
            Ok(word) => word,
            Err(errno) => {
                log::trace!("peek at {:#x}+{} faulted: {}", addr, offset, errno);
                break;
            }
        };

        if let Some(nul) = word.iter().position(|&b| b == 0) {
            buf.extend_from_slice(&word[..nul]);
            break;
        }
        buf.extend_from_slice(&word);
        offset += WORD_SIZE as u64;

        if buf.len() >= MAX_STRING_LEN {
            log::warn!("string at {:#x} exceeds {} bytes, truncating", addr, MAX_STRING_LEN);
            break;
        }
    }

    buf
}
