//! demand-loader
//!
//! Runs a statically linked ELF64 executable with every page of its image
//! loaded on first touch.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use demand_loader::{
    config::{LoaderConfig, DEFAULT_STACK_SIZE},
    elf, logger, Permissions,
};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "demand-loader")]
#[command(about = "Runs a static ELF executable, paging its image in on demand")]
struct Args {
    /// Log level (off, error, warn, info, debug, trace). Falls back to
    /// $DEMAND_LOADER_LOG, then warn.
    #[arg(long)]
    log_level: Option<String>,

    /// Size of the program's initial stack in bytes
    #[arg(long, default_value_t = DEFAULT_STACK_SIZE)]
    stack_size: usize,

    /// Print the segment table and exit without running the program
    #[arg(long)]
    dry_run: bool,

    /// Executable to run
    path: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

impl Args {
    fn config(&self) -> Result<LoaderConfig> {
        let log_level = match &self.log_level {
            Some(level) => level
                .parse::<LevelFilter>()
                .map_err(|_| anyhow!("Invalid log level: {}", level))?,
            None => logger::level_from_env(LevelFilter::Warn),
        };
        let config = LoaderConfig {
            stack_size: self.stack_size,
            log_level,
            dry_run: self.dry_run,
        };
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    logger::init(config.log_level).context("Failed to initialize logger")?;

    if config.dry_run {
        return print_segments(&args.path);
    }

    demand_loader::init_loader().context("Failed to install fault handler")?;

    let mut argv = Vec::with_capacity(args.args.len() + 1);
    argv.push(args.path.clone().into_os_string());
    argv.extend(args.args.iter().cloned());

    let never = demand_loader::execute(&args.path, &argv, &config)
        .with_context(|| format!("Failed to execute {}", args.path.display()))?;
    match never {}
}

fn permission_string(permissions: Permissions) -> String {
    let flag = |bit: Permissions, c: char| if permissions.contains(bit) { c } else { '-' };
    [
        flag(Permissions::READ, 'r'),
        flag(Permissions::WRITE, 'w'),
        flag(Permissions::EXECUTE, 'x'),
    ]
    .iter()
    .collect()
}

fn print_segments(path: &Path) -> Result<()> {
    let image = elf::parse_executable(path)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    println!("{}", path.display());
    println!("  entry point: {:#x}", image.entry_point);
    if image.program_headers.address != 0 {
        println!(
            "  program headers: {:#x} ({} x {} bytes)",
            image.program_headers.address,
            image.program_headers.count,
            image.program_headers.entry_size
        );
    }
    println!();
    println!(
        "  {:>18}  {:>10}  {:>10}  {:>10}  perm",
        "vaddr", "memsz", "filesz", "offset"
    );
    for segment in &image.segments {
        println!(
            "  {:#018x}  {:#10x}  {:#10x}  {:#10x}  {}",
            segment.virtual_address,
            segment.memory_size,
            segment.file_size,
            segment.file_offset,
            permission_string(segment.permissions)
        );
    }
    Ok(())
}
