//! x64 Native Code Backend
//!
//! Direct x64 machine code generation without an external assembler or linker.
//!
//! ## Architecture
//!
//! ```text
//! Vec<Inst> → assembler (2 passes) → .text bytes + relocations → ExecutableBuilder → ELF64
//! ```
//!
//! ## Modules
//!
//! - `registers`: x64 register definitions and the register roles used by codegen
//! - `inst`: abstract instructions, labels and operands
//! - `encoding`: x64 instruction encoding (REX, ModR/M, SIB)
//! - `assembler`: label resolution and relocation recording
//! - `symbols`: sections, symbols and relocations
//! - `elf`: ELF64 executable generation (Linux)

pub mod assembler;
pub mod elf;
pub mod encoding;
pub mod inst;
pub mod registers;
pub mod symbols;

pub use assembler::{assemble, AssembledCode};
pub use elf::{ExecutableBuilder, ExecutableImage};
pub use inst::{Inst, Label, LabelTable};
pub use symbols::{SectionKind, SymbolId, SymbolTable};
