//! Tidal Compiler CLI
//!
//! A command-line interface for the tidal native backend.

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use tidal::{CompileConfig, CompileError, ProgramModel};

#[derive(Parser)]
#[command(name = "tidalc")]
#[command(version)]
#[command(about = "Tidal Compiler - agent programs to native x86-64", long_about = None)]
struct Cli {
    /// Log pipeline stages to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program model to a Linux x86-64 executable
    Build {
        /// Input program model (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output file path (default: input file without its extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        settings: Settings,
    },

    /// Print the layout tables: schemas, agent state, routes and handlers
    Layout {
        /// Input program model (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },

    /// Print the instruction listing before encoding
    Asm {
        /// Input program model (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },
}

/// Flags that override the `--config` file
#[derive(Args)]
struct Settings {
    /// Base settings (JSON); flags below override it
    #[arg(long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many tidal cycles (0 = unbounded)
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Heap size in bytes
    #[arg(long)]
    heap_size: Option<u64>,

    /// Capacity of each agent's message queue
    #[arg(long)]
    queue_capacity: Option<u32>,

    /// Compile `report` statements into stderr writes
    #[arg(long)]
    debug_reports: bool,

    /// Request debug symbols (accepted, not produced)
    #[arg(long)]
    emit_debug_symbols: bool,

    /// Load address of the image, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_address)]
    load_address: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Build { file, output, settings } => cmd_build(file, output, settings),
        Commands::Layout { file, settings } => cmd_layout(file, settings),
        Commands::Asm { file, settings } => cmd_asm(file, settings),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tidal=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", text, e))
}

impl Settings {
    /// Resolve the effective configuration; `None` after printing an error
    fn resolve(&self) -> Option<CompileConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = read_file(path)?;
                match CompileConfig::from_json(&text) {
                    Ok(c) => c,
                    Err(e) => {
                        print_error(&e, Some(path.as_path()));
                        return None;
                    }
                }
            }
            None => CompileConfig::default(),
        };
        if let Some(n) = self.max_cycles {
            config.max_cycles = n;
        }
        if let Some(n) = self.heap_size {
            config.heap_size = n;
        }
        if let Some(n) = self.queue_capacity {
            config.queue_capacity = n;
        }
        if let Some(addr) = self.load_address {
            config.load_address = addr;
        }
        config.debug_reports |= self.debug_reports;
        config.emit_debug_symbols |= self.emit_debug_symbols;
        Some(config)
    }
}

fn read_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) => {
            eprintln!("{}: could not read '{}': {}", "error".red().bold(), path.display(), e);
            None
        }
    }
}

fn load_model(file: &Path) -> Option<ProgramModel> {
    let text = read_file(file)?;
    match ProgramModel::from_json(&text) {
        Ok(model) => Some(model),
        Err(e) => {
            print_error(&e, Some(file));
            None
        }
    }
}

/// Print a compilation error with its code and pipeline stage
fn print_error(e: &CompileError, file: Option<&Path>) {
    eprintln!("{}: {}", format!("error[{}]", e.code()).red().bold(), e);
    if let Some(file) = file {
        eprintln!("  {} {}", "-->".blue().bold(), file.display());
    }
    eprintln!("  {} failed during {}", "note:".yellow(), e.stage());
}

fn cmd_build(file: PathBuf, output: Option<PathBuf>, settings: Settings) -> ExitCode {
    let Some(mut config) = settings.resolve() else {
        return ExitCode::FAILURE;
    };
    let Some(model) = load_model(&file) else {
        return ExitCode::FAILURE;
    };

    // -o wins, then the config file, then the input stem
    if let Some(path) = output {
        config.output_path = path;
    } else if settings.config.is_none() {
        config.output_path = file.with_extension("");
    }

    match tidal::compile_to_file(&model, &config) {
        Ok(image) => {
            println!(
                "{} {} -> {} ({} bytes)",
                "Compiled".green().bold(),
                file.display(),
                config.output_path.display(),
                image.bytes().len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e, Some(file.as_path()));
            ExitCode::FAILURE
        }
    }
}

fn cmd_layout(file: PathBuf, settings: Settings) -> ExitCode {
    let Some(config) = settings.resolve() else {
        return ExitCode::FAILURE;
    };
    let Some(model) = load_model(&file) else {
        return ExitCode::FAILURE;
    };

    match tidal::describe_layout(&model, &config) {
        Ok(layout) => {
            print!("{}", layout);
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e, Some(file.as_path()));
            ExitCode::FAILURE
        }
    }
}

fn cmd_asm(file: PathBuf, settings: Settings) -> ExitCode {
    let Some(config) = settings.resolve() else {
        return ExitCode::FAILURE;
    };
    let Some(model) = load_model(&file) else {
        return ExitCode::FAILURE;
    };

    match tidal::assembly_listing(&model, &config) {
        Ok(listing) => {
            print!("{}", listing);
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e, Some(file.as_path()));
            ExitCode::FAILURE
        }
    }
}
