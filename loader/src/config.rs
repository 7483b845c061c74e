//! Loader configuration

use log::LevelFilter;

use crate::error::{LoaderError, LoaderResult};

/// Default size of the initial stack handed to the loaded program (8 MiB).
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Smallest accepted stack; argv, envp and the aux vector must fit.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Runtime settings for one loader invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Bytes reserved for the program's initial stack.
    pub stack_size: usize,
    /// Maximum level emitted by the logger.
    pub log_level: LevelFilter,
    /// Parse and report the segment table without running the program.
    pub dry_run: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            log_level: LevelFilter::Warn,
            dry_run: false,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> LoaderResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(LoaderError::InvalidArgument {
                name: "stack_size",
                value: "below the 64 KiB minimum",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LoaderConfig::default();
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tiny_stack_rejected() {
        let config = LoaderConfig {
            stack_size: 4096,
            ..LoaderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LoaderError::InvalidArgument {
                name: "stack_size",
                ..
            })
        ));
    }
}
