//! Compilation settings
//!
//! Read from an optional JSON file (`tidalc build --config`), then overridden
//! by command-line flags. Every field has a default, so `{}` is a valid file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CompileError, Result};
use crate::x64::elf::consts::{DEFAULT_LOAD_ADDR, PAGE_SIZE};

pub const DEFAULT_MAX_CYCLES: u64 = 1_000_000;
pub const DEFAULT_HEAP_SIZE: u64 = 1 << 20;
pub const MAX_HEAP_SIZE: u64 = 1 << 30;
pub const DEFAULT_QUEUE_CAPACITY: u32 = 64;
pub const MAX_QUEUE_CAPACITY: u32 = 65536;
pub const DEFAULT_MAX_STATE_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CompileConfig {
    /// Destination of the image for [`crate::compile_to_file`]
    pub output_path: PathBuf,
    /// Upper bound on tidal cycles; 0 disables the bound
    pub max_cycles: u64,
    /// Accepted for compatibility; no debug sections are produced
    pub emit_debug_symbols: bool,
    /// Compile `report` statements into stderr writes instead of no-ops
    pub debug_reports: bool,
    /// Bump allocator capacity in bytes
    pub heap_size: u64,
    /// Pending messages each agent queue can hold
    pub queue_capacity: u32,
    /// Bound on the total agent state arena
    pub max_state_bytes: u64,
    /// Virtual address of the first loadable segment
    pub load_address: u64,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("a.out"),
            max_cycles: DEFAULT_MAX_CYCLES,
            emit_debug_symbols: false,
            debug_reports: false,
            heap_size: DEFAULT_HEAP_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_state_bytes: DEFAULT_MAX_STATE_BYTES,
            load_address: DEFAULT_LOAD_ADDR,
        }
    }
}

impl CompileConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Check limits before any code is generated
    pub fn validate(&self) -> Result<()> {
        if self.heap_size == 0 || self.heap_size > MAX_HEAP_SIZE {
            return Err(CompileError::exhausted("heap size", self.heap_size, MAX_HEAP_SIZE));
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(CompileError::exhausted(
                "queue capacity",
                self.queue_capacity as u64,
                MAX_QUEUE_CAPACITY as u64,
            ));
        }
        if self.load_address % PAGE_SIZE != 0 || self.load_address == 0 {
            return Err(CompileError::InvalidInstruction {
                instruction: format!("load address {:#x}", self.load_address),
                message: "must be a non-zero multiple of the page size".to_string(),
            });
        }
        // Code must stay within rel32 reach of data
        if self.load_address >= (1 << 31) {
            return Err(CompileError::exhausted(
                "load address",
                self.load_address,
                (1 << 31) - 1,
            ));
        }
        if self.emit_debug_symbols {
            warn!("debug symbol emission is not supported; the image will carry no symbols");
        }
        Ok(())
    }
}
