//! Shared helpers for loader integration tests

#![allow(dead_code)]

use std::{fs, path::PathBuf};

use demand_loader::elf::ElfMachine;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

/// One program header as written to disk.
#[derive(Debug, Clone, Copy)]
pub struct Phdr {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl Phdr {
    pub fn load(vaddr: u64, offset: u64, filesz: u64, memsz: u64, flags: u32) -> Self {
        Self {
            p_type: PT_LOAD,
            flags,
            offset,
            vaddr,
            filesz,
            memsz,
        }
    }

    pub fn interp(offset: u64, len: u64) -> Self {
        Self {
            p_type: PT_INTERP,
            flags: PF_R,
            offset,
            vaddr: 0,
            filesz: len,
            memsz: len,
        }
    }
}

fn host_machine() -> u16 {
    ElfMachine::host().unwrap_or(ElfMachine::X86_64) as u16
}

/// Builds minimal ELF64 little-endian files for the host machine.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    elf_type: u16,
    entry: u64,
    phdrs: Vec<Phdr>,
    body: Vec<(u64, Vec<u8>)>,
}

impl ElfBuilder {
    pub fn executable(entry: u64) -> Self {
        Self {
            elf_type: ET_EXEC,
            entry,
            phdrs: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn shared_object(entry: u64) -> Self {
        Self {
            elf_type: ET_DYN,
            ..Self::executable(entry)
        }
    }

    pub fn phdr(mut self, phdr: Phdr) -> Self {
        self.phdrs.push(phdr);
        self
    }

    /// Place `bytes` at file offset `offset`.
    pub fn bytes_at(mut self, offset: u64, bytes: Vec<u8>) -> Self {
        self.body.push((offset, bytes));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&self.elf_type.to_le_bytes());
        out.extend_from_slice(&host_machine().to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&64u64.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&(self.phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]);

        for ph in &self.phdrs {
            out.extend_from_slice(&ph.p_type.to_le_bytes());
            out.extend_from_slice(&ph.flags.to_le_bytes());
            out.extend_from_slice(&ph.offset.to_le_bytes());
            out.extend_from_slice(&ph.vaddr.to_le_bytes());
            out.extend_from_slice(&ph.vaddr.to_le_bytes());
            out.extend_from_slice(&ph.filesz.to_le_bytes());
            out.extend_from_slice(&ph.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        }

        for (offset, bytes) in &self.body {
            let end = *offset as usize + bytes.len();
            if out.len() < end {
                out.resize(end, 0);
            }
            out[*offset as usize..end].copy_from_slice(bytes);
        }
        out
    }
}

/// Recognizable byte for file offset `offset`.
pub fn pattern(offset: usize) -> u8 {
    (offset % 251) as u8 ^ 0x5A
}

/// `len` bytes of [`pattern`] starting at offset 0.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(pattern).collect()
}

/// Inaccessible anonymous pages at an address of the kernel's choosing.
pub fn scratch_pages(len: usize) -> usize {
    // SAFETY: A non-fixed anonymous mapping cannot clobber existing memory.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED, "failed to map scratch pages");
    addr as usize
}

/// Write `contents` to a per-process temporary file named after `tag`.
pub fn temp_file(tag: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "demand-loader-{}-{}.bin",
        std::process::id(),
        tag
    ));
    fs::write(&path, contents).expect("failed to write temp file");
    path
}
