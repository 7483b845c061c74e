//! Initial process stack construction
//!
//! Lays out argc, argv, envp and the auxiliary vector the way the Linux
//! kernel does for a freshly exec'd static binary:
//!
//! ```text
//! high  | strings (argv, envp, execfn), AT_RANDOM bytes
//!       | padding to 16 bytes
//!       | AT_NULL, ..., auxv pairs
//!       | NULL, envp pointers
//!       | NULL, argv pointers
//! sp -> | argc
//! ```

use std::ffi::CStr;

use super::EntryInfo;
use crate::error::{LoaderError, LoaderResult};

const WORD: usize = core::mem::size_of::<u64>();

/// Auxiliary vector entry type identifiers (Linux ABI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum AuxType {
    /// End of vector (sentinel).
    AtNull = 0,
    /// Program headers address in memory.
    AtPhdr = 3,
    /// Size of one program header entry.
    AtPhent = 4,
    /// Number of program headers.
    AtPhnum = 5,
    /// System page size.
    AtPagesz = 6,
    /// Entry point of the binary.
    AtEntry = 9,
    /// Address of 16 random bytes (for stack canaries / ASLR).
    AtRandom = 25,
    /// Filename of the program being run.
    AtExecfn = 31,
}

/// A single entry in the auxiliary vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxVecEntry {
    pub type_id: AuxType,
    pub value: u64,
}

impl AuxVecEntry {
    pub fn new(type_id: AuxType, value: u64) -> Self {
        Self { type_id, value }
    }
}

/// Build the auxiliary vector for a statically linked program.
///
/// `random_addr` and `execfn_addr` are omitted when 0.
pub fn build_aux_vector(entry: &EntryInfo, random_addr: u64, execfn_addr: u64) -> Vec<AuxVecEntry> {
    let mut aux = Vec::with_capacity(8);

    if entry.phdr_address != 0 {
        aux.push(AuxVecEntry::new(AuxType::AtPhdr, entry.phdr_address));
        aux.push(AuxVecEntry::new(AuxType::AtPhent, entry.phdr_entry_size as u64));
        aux.push(AuxVecEntry::new(AuxType::AtPhnum, entry.phdr_count as u64));
    }
    aux.push(AuxVecEntry::new(AuxType::AtPagesz, entry.page_size as u64));
    aux.push(AuxVecEntry::new(AuxType::AtEntry, entry.entry_point));

    if random_addr != 0 {
        aux.push(AuxVecEntry::new(AuxType::AtRandom, random_addr));
    }
    if execfn_addr != 0 {
        aux.push(AuxVecEntry::new(AuxType::AtExecfn, execfn_addr));
    }

    aux.push(AuxVecEntry::new(AuxType::AtNull, 0));
    aux
}

/// Writes downward into a stack region whose lowest byte is at `base`.
pub struct StackWriter<'a> {
    mem: &'a mut [u8],
    base: usize,
    top: usize,
}

impl<'a> StackWriter<'a> {
    /// `mem` is the whole stack region; `base` is the address of `mem[0]`.
    pub fn new(mem: &'a mut [u8], base: usize) -> Self {
        let top = mem.len();
        Self { mem, base, top }
    }

    fn exhausted() -> LoaderError {
        LoaderError::ResourceExhausted {
            resource: "initial stack",
        }
    }

    /// Copy `bytes` below the current top and return their address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> LoaderResult<u64> {
        if bytes.len() > self.top {
            return Err(Self::exhausted());
        }
        self.top -= bytes.len();
        self.mem[self.top..self.top + bytes.len()].copy_from_slice(bytes);
        Ok((self.base + self.top) as u64)
    }

    /// Copy a NUL-terminated string and return its address.
    pub fn push_cstr(&mut self, s: &CStr) -> LoaderResult<u64> {
        self.push_bytes(s.to_bytes_with_nul())
    }

    /// Place `words` below the current top so the first word lands on a
    /// 16-byte aligned address, and return that address.
    pub fn push_words(&mut self, words: &[u64]) -> LoaderResult<u64> {
        let len = words.len() * WORD;
        let Some(start) = self.top.checked_sub(len) else {
            return Err(Self::exhausted());
        };
        // Align the absolute address, not just the offset.
        let start = start - ((self.base + start) % 16);

        for (i, word) in words.iter().enumerate() {
            let at = start + i * WORD;
            self.mem[at..at + WORD].copy_from_slice(&word.to_ne_bytes());
        }
        self.top = start;
        Ok((self.base + start) as u64)
    }
}

/// Lay out the initial stack in `mem` and return the stack pointer value.
pub fn layout_stack(
    mem: &mut [u8],
    base: usize,
    entry: &EntryInfo,
    argv: &[&CStr],
    envp: &[&CStr],
    execfn: &CStr,
    random: &[u8; 16],
) -> LoaderResult<u64> {
    let mut stack = StackWriter::new(mem, base);

    let random_addr = stack.push_bytes(random)?;
    let execfn_addr = stack.push_cstr(execfn)?;

    let mut env_ptrs = Vec::with_capacity(envp.len());
    for var in envp.iter().rev() {
        env_ptrs.push(stack.push_cstr(var)?);
    }
    env_ptrs.reverse();

    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        arg_ptrs.push(stack.push_cstr(arg)?);
    }
    arg_ptrs.reverse();

    let aux = build_aux_vector(entry, random_addr, execfn_addr);

    let mut words = Vec::with_capacity(3 + arg_ptrs.len() + env_ptrs.len() + aux.len() * 2);
    words.push(argv.len() as u64);
    words.extend_from_slice(&arg_ptrs);
    words.push(0);
    words.extend_from_slice(&env_ptrs);
    words.push(0);
    for entry in &aux {
        words.push(entry.type_id as u64);
        words.push(entry.value);
    }

    stack.push_words(&words)
}
