//! Heap-free stderr logger
//!
//! Backs the [`log`] facade with a logger that can run inside the SIGSEGV
//! handler: each record is formatted into a fixed-size stack buffer and
//! emitted with a single `write(2)` on stderr. No allocation, no locks.
//!
//! Lines longer than [`LOG_LINE_MAX_LEN`] are truncated.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::{LoaderError, LoaderResult};

/// Maximum length (in bytes) of one emitted log line, newline included.
pub const LOG_LINE_MAX_LEN: usize = 256;

/// Environment variable consulted when no level is given explicitly.
pub const LOG_ENV_VAR: &str = "DEMAND_LOADER_LOG";

/// Fixed-capacity line that silently drops what does not fit.
pub struct LineBuffer {
    buf: [u8; LOG_LINE_MAX_LEN],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            buf: [0; LOG_LINE_MAX_LEN],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Make sure the line ends in `\n`, overwriting the last byte if full.
    fn terminate(&mut self) {
        if self.len == LOG_LINE_MAX_LEN {
            self.buf[LOG_LINE_MAX_LEN - 1] = b'\n';
        } else if self.len == 0 || self.buf[self.len - 1] != b'\n' {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_LINE_MAX_LEN - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Last path component of a log target (`a::b::demand_paging` ->
/// `demand_paging`).
fn subsystem(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Render `record` as one terminated line.
pub fn format_line(record: &Record<'_>) -> LineBuffer {
    let mut line = LineBuffer::new();
    let _ = write!(
        line,
        "[{:<5} {}] {}",
        record.level(),
        subsystem(record.target()),
        record.args()
    );
    line.terminate();
    line
}

fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid readable buffer of the given length.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// [`Log`] implementation writing to stderr.
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        write_stderr(format_line(record).as_bytes());
    }

    fn flush(&self) {}
}

/// Install the logger with the given maximum level.
pub fn init(level: LevelFilter) -> LoaderResult<()> {
    log::set_logger(&LOGGER).map_err(|_| LoaderError::InvalidState {
        expected: "no logger installed",
        actual: "logger already set",
    })?;
    log::set_max_level(level);
    Ok(())
}

/// Level from [`LOG_ENV_VAR`], or `fallback` if unset or unparsable.
pub fn level_from_env(fallback: LevelFilter) -> LevelFilter {
    std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;

    #[test]
    fn test_format_line_uses_subsystem_tag() {
        let line = format_line(
            &Record::builder()
                .args(format_args!("page {:#x} serviced", 0x40_1000))
                .level(Level::Info)
                .target("demand_loader::mm::demand_paging")
                .build(),
        );
        assert_eq!(
            line.as_bytes(),
            b"[INFO  demand_paging] page 0x401000 serviced\n"
        );
    }

    #[test]
    fn test_long_lines_are_truncated_with_newline() {
        let long = "x".repeat(LOG_LINE_MAX_LEN * 2);
        let line = format_line(
            &Record::builder()
                .args(format_args!("{}", long))
                .level(Level::Warn)
                .target("loader")
                .build(),
        );
        let bytes = line.as_bytes();
        assert_eq!(bytes.len(), LOG_LINE_MAX_LEN);
        assert_eq!(bytes[bytes.len() - 1], b'\n');
        assert!(bytes.starts_with(b"[WARN  loader] xxx"));
    }

    #[test]
    fn test_subsystem_of_plain_target() {
        assert_eq!(subsystem("loader"), "loader");
        assert_eq!(subsystem("a::b"), "b");
    }
}
