//! Error types for the demand loader
//!
//! Every fallible operation in the library returns [`LoaderResult`]. Startup
//! failures (handler installation, executable parsing, opening the backing
//! file) are surfaced to the caller; fault-path failures are reported to the
//! dispatcher, which forwards the fault.

use core::fmt;
use std::io;

/// Main loader error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// Memory-related errors
    MapFailed {
        addr: usize,
        errno: i32,
    },
    ProtectFailed {
        addr: usize,
        errno: i32,
    },

    /// Executable format errors
    Elf(ElfError),

    /// Host I/O errors
    Io {
        operation: &'static str,
        kind: io::ErrorKind,
    },

    /// Signal registration errors
    SignalInstall {
        signal: i32,
        errno: i32,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },
    OperationNotSupported {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
}

/// ELF parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    Truncated,
    InvalidMagic,
    InvalidClass,
    InvalidData,
    InvalidType,
    UnsupportedMachine,
    InvalidProgramHeader,
    NoLoadableSegments,
    DynamicallyLinked,
}

/// Result type alias for loader operations
pub type LoaderResult<T> = Result<T, LoaderError>;

impl LoaderError {
    /// Build an I/O error tagged with the operation that failed.
    pub fn io(operation: &'static str, err: &io::Error) -> Self {
        Self::Io {
            operation,
            kind: err.kind(),
        }
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapFailed { addr, errno } => {
                write!(f, "mmap of page 0x{:x} failed: errno {}", addr, errno)
            }
            Self::ProtectFailed { addr, errno } => {
                write!(f, "mprotect of page 0x{:x} failed: errno {}", addr, errno)
            }
            Self::Elf(e) => write!(f, "ELF error: {}", e),
            Self::Io { operation, kind } => write!(f, "I/O error during {}: {}", operation, kind),
            Self::SignalInstall { signal, errno } => {
                write!(
                    f,
                    "Failed to install handler for signal {}: errno {}",
                    signal, errno
                )
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::NotInitialized { subsystem } => write!(f, "{} is not initialized", subsystem),
            Self::OperationNotSupported { operation } => {
                write!(f, "Operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
        }
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Truncated => "file is shorter than its headers claim",
            Self::InvalidMagic => "bad magic number",
            Self::InvalidClass => "not a 64-bit ELF file",
            Self::InvalidData => "not little-endian",
            Self::InvalidType => "not an executable",
            Self::UnsupportedMachine => "unsupported machine type",
            Self::InvalidProgramHeader => "malformed program header",
            Self::NoLoadableSegments => "no PT_LOAD segments",
            Self::DynamicallyLinked => "dynamically linked or position-independent executables are not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for LoaderError {}

impl std::error::Error for ElfError {}

// Conversion implementations
impl From<ElfError> for LoaderError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elf_error_wraps() {
        let err: LoaderError = ElfError::InvalidMagic.into();
        assert_eq!(err, LoaderError::Elf(ElfError::InvalidMagic));
        assert_eq!(err.to_string(), "ELF error: bad magic number");
    }

    #[test]
    fn test_io_error_keeps_kind() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = LoaderError::io("open executable", &io_err);
        assert_eq!(
            err,
            LoaderError::Io {
                operation: "open executable",
                kind: io::ErrorKind::NotFound,
            }
        );
    }

    #[test]
    fn test_display_formats_addresses_in_hex() {
        let err = LoaderError::MapFailed {
            addr: 0x40_1000,
            errno: 22,
        };
        assert_eq!(err.to_string(), "mmap of page 0x401000 failed: errno 22");
    }
}
