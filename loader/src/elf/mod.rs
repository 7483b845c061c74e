//! ELF64 executable parser
//!
//! Turns the program header table of a statically linked ELF64 executable
//! into an [`ExecutableImage`]. Only headers are read here; segment content
//! is read later, one page at a time, by the demand-paging engine.

pub mod types;

use core::{mem, ptr};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use log::debug;

pub use self::types::*;
use crate::{
    error::{ElfError, LoaderError, LoaderResult},
    image::{ExecutableImage, ProgramHeaders, Segment},
    mm::Permissions,
};

/// Upper bound on program headers accepted from a file.
const MAX_PROGRAM_HEADERS: usize = 512;

/// Parse the executable at `path` into an [`ExecutableImage`].
pub fn parse_executable(path: impl AsRef<Path>) -> LoaderResult<ExecutableImage> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| LoaderError::io("open executable", &e))?;

    let mut header_bytes = [0u8; mem::size_of::<Elf64Header>()];
    read_exact_or_truncated(&mut file, &mut header_bytes)?;
    let header = parse_header(&header_bytes)?;
    validate_header(&header)?;

    let table_len = program_table_len(&header)?;
    let mut table = vec![0u8; table_len];
    file.seek(SeekFrom::Start(header.phoff))
        .map_err(|e| LoaderError::io("seek to program headers", &e))?;
    read_exact_or_truncated(&mut file, &mut table)?;

    let program_headers = parse_program_headers(&table, &header)?;
    let image = build_image(&header, &program_headers)?;
    debug!(
        "parsed {}: entry {:#x}, {} loadable segments",
        path.display(),
        image.entry_point,
        image.segments.len()
    );
    Ok(image)
}

/// Parse an executable held entirely in memory.
pub fn parse_bytes(data: &[u8]) -> LoaderResult<ExecutableImage> {
    let header = parse_header(data)?;
    validate_header(&header)?;

    let table_len = program_table_len(&header)?;
    let start = usize::try_from(header.phoff).map_err(|_| ElfError::Truncated)?;
    let table = start
        .checked_add(table_len)
        .and_then(|end| data.get(start..end))
        .ok_or(ElfError::Truncated)?;

    let program_headers = parse_program_headers(table, &header)?;
    Ok(build_image(&header, &program_headers)?)
}

fn read_exact_or_truncated(file: &mut File, buf: &mut [u8]) -> LoaderResult<()> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => LoaderError::Elf(ElfError::Truncated),
        _ => LoaderError::io("read executable headers", &e),
    })
}

/// Parse the ELF header from the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<Elf64Header, ElfError> {
    if data.len() < mem::size_of::<Elf64Header>() {
        return Err(ElfError::Truncated);
    }

    // SAFETY: data.len() >= size_of::<Elf64Header>() was checked above.
    // Elf64Header is #[repr(C)] plain data, valid for any bit pattern, and
    // read_unaligned tolerates the byte buffer's alignment.
    let header = unsafe { ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

    Ok(header)
}

/// Validate ELF header
pub fn validate_header(header: &Elf64Header) -> Result<(), ElfError> {
    if header.magic != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }

    if header.class != ElfClass::Elf64 as u8 {
        return Err(ElfError::InvalidClass);
    }

    if header.data != ElfData::LittleEndian as u8 {
        return Err(ElfError::InvalidData);
    }

    // Position-independent images would need a load bias.
    match header.elf_type {
        t if t == ElfType::Executable as u16 => {}
        t if t == ElfType::SharedObject as u16 => return Err(ElfError::DynamicallyLinked),
        _ => return Err(ElfError::InvalidType),
    }

    // Code for another architecture would be jumped into as-is.
    match ElfMachine::from_u16(header.machine) {
        Some(machine) if Some(machine) == ElfMachine::host() => {}
        _ => return Err(ElfError::UnsupportedMachine),
    }

    if header.phnum == 0 {
        return Err(ElfError::NoLoadableSegments);
    }
    if (header.phentsize as usize) < mem::size_of::<Elf64ProgramHeader>() {
        return Err(ElfError::InvalidProgramHeader);
    }

    Ok(())
}

fn program_table_len(header: &Elf64Header) -> Result<usize, ElfError> {
    let count = header.phnum as usize;
    if count > MAX_PROGRAM_HEADERS {
        return Err(ElfError::InvalidProgramHeader);
    }
    Ok(count * header.phentsize as usize)
}

/// Parse program headers from `table`, which starts at `header.phoff`.
pub fn parse_program_headers(
    table: &[u8],
    header: &Elf64Header,
) -> Result<Vec<Elf64ProgramHeader>, ElfError> {
    let ph_size = header.phentsize as usize;
    let ph_count = header.phnum as usize;
    let mut headers = Vec::with_capacity(ph_count);

    for i in 0..ph_count {
        let offset = i * ph_size;
        if offset + mem::size_of::<Elf64ProgramHeader>() > table.len() {
            return Err(ElfError::Truncated);
        }

        // SAFETY: The bounds check above keeps the read inside `table`.
        // Elf64ProgramHeader is #[repr(C)] plain data and the value is copied
        // out with an unaligned read.
        let ph = unsafe {
            ptr::read_unaligned(table[offset..].as_ptr() as *const Elf64ProgramHeader)
        };

        headers.push(ph);
    }

    Ok(headers)
}

/// Build the segment table from parsed program headers.
pub fn build_image(
    header: &Elf64Header,
    program_headers: &[Elf64ProgramHeader],
) -> Result<ExecutableImage, ElfError> {
    if program_headers
        .iter()
        .any(|ph| ph.p_type == ProgramType::Interp as u32)
    {
        return Err(ElfError::DynamicallyLinked);
    }

    let mut segments = Vec::new();
    for ph in program_headers {
        if ph.p_type != ProgramType::Load as u32 {
            continue;
        }
        // Empty segments are validated too; the phdr lookup still sees them.
        if ph.p_filesz > ph.p_memsz {
            return Err(ElfError::InvalidProgramHeader);
        }

        let vaddr = usize::try_from(ph.p_vaddr).map_err(|_| ElfError::InvalidProgramHeader)?;
        let memsz = usize::try_from(ph.p_memsz).map_err(|_| ElfError::InvalidProgramHeader)?;
        let filesz = usize::try_from(ph.p_filesz).map_err(|_| ElfError::InvalidProgramHeader)?;
        if vaddr.checked_add(memsz).is_none() || ph.p_offset.checked_add(ph.p_filesz).is_none() {
            return Err(ElfError::InvalidProgramHeader);
        }
        if memsz == 0 {
            continue;
        }

        segments.push(Segment::new(
            vaddr,
            memsz,
            filesz,
            ph.p_offset,
            Permissions::from_elf_flags(ph.p_flags),
        ));
    }

    if segments.is_empty() {
        return Err(ElfError::NoLoadableSegments);
    }

    let mut image = ExecutableImage::new(header.entry, segments);
    image.program_headers = ProgramHeaders {
        address: program_header_address(header, program_headers),
        entry_size: header.phentsize,
        count: header.phnum,
    };
    Ok(image)
}

/// Where the program header table lives once the image is mapped.
///
/// Uses `PT_PHDR` when present, otherwise the `PT_LOAD` segment whose file
/// range covers `e_phoff`. Returns 0 when the table is not loaded.
fn program_header_address(header: &Elf64Header, program_headers: &[Elf64ProgramHeader]) -> u64 {
    if let Some(phdr) = program_headers
        .iter()
        .find(|ph| ph.p_type == ProgramType::Phdr as u32)
    {
        return phdr.p_vaddr;
    }

    program_headers
        .iter()
        .filter(|ph| ph.p_type == ProgramType::Load as u32 && ph.p_memsz != 0)
        .find(|ph| header.phoff >= ph.p_offset && header.phoff - ph.p_offset < ph.p_filesz)
        .and_then(|ph| ph.p_vaddr.checked_add(header.phoff - ph.p_offset))
        .unwrap_or(0)
}
