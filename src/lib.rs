//! # Tidal
//!
//! Native x86-64 backend for agent programs: message schemas, agent templates
//! with typed state and handlers, a routing table and a seed message, compiled
//! straight to a static Linux ELF executable. No assembler, linker or libc is
//! involved; the generated binary talks to the kernel through raw syscalls.
//!
//! ## Pipeline
//!
//! | Stage    | Module    | Output                                   |
//! |----------|-----------|------------------------------------------|
//! | input    | `model`   | `ProgramModel` (JSON)                    |
//! | layout   | `layout`  | record offsets, schema ids, routes       |
//! | codegen  | `codegen` | abstract instructions, data sections     |
//! | encoding | `x64`     | `.text` bytes + relocations              |
//! | link     | `x64::elf`| `ExecutableImage`                        |
//!
//! ## Runtime behavior
//!
//! The generated `_start` injects the seed message, then runs tidal cycles:
//! REST (stop when every queue is empty or the cycle bound is reached), SENSE
//! (each agent dequeues at most one message) and ACT (each agent that received
//! a message runs the matching handler). A non-zero handler status becomes the
//! process exit status.

pub mod codegen;
pub mod config;
pub mod error;
pub mod layout;
pub mod model;
pub mod x64;

use tracing::{debug, info};

pub use config::CompileConfig;
pub use error::{CompileError, Result};
pub use layout::Layout;
pub use model::ProgramModel;
pub use x64::ExecutableImage;

use x64::ExecutableBuilder;

/// Compile a program model into an in-memory executable image
pub fn compile(model: &ProgramModel, config: &CompileConfig) -> Result<ExecutableImage> {
    config.validate()?;

    let layout = layout::analyze(model, config)?;
    let program = codegen::generate(model, &layout, config)?;
    let code = x64::assemble(&program.insts, &program.labels, &program.symbols)?;
    info!(
        instructions = program.insts.len(),
        text_bytes = code.bytes.len(),
        relocations = code.relocations.len() + program.data_relocs.len(),
        "encoding complete"
    );

    let entry = code
        .label_offset(program.entry)
        .ok_or_else(|| CompileError::RelocationUnresolved {
            symbol: program.labels.name(program.entry).to_string(),
        })?;

    let image = ExecutableBuilder::new()
        .load_addr(config.load_address)
        .text(code.bytes)
        .section(program.rodata)
        .section(program.data)
        .section(program.bss)
        .relocations(code.relocations)
        .relocations(program.data_relocs)
        .entry(entry)
        .build(&program.symbols)?;
    info!(
        bytes = image.bytes().len(),
        entry = image.entry(),
        "image built"
    );
    Ok(image)
}

/// Compile and write the image to `config.output_path`
pub fn compile_to_file(model: &ProgramModel, config: &CompileConfig) -> Result<ExecutableImage> {
    let image = compile(model, config)?;
    image.write_to_file(&config.output_path)?;
    debug!(path = %config.output_path.display(), "image written");
    Ok(image)
}

/// Layout tables of a program, as printed by `tidalc layout`
pub fn describe_layout(model: &ProgramModel, config: &CompileConfig) -> Result<Layout> {
    config.validate()?;
    layout::analyze(model, config)
}

/// Abstract instruction listing of the whole program, before encoding
pub fn assembly_listing(model: &ProgramModel, config: &CompileConfig) -> Result<String> {
    config.validate()?;
    let layout = layout::analyze(model, config)?;
    let program = codegen::generate(model, &layout, config)?;
    Ok(x64::inst::listing(&program.insts, &program.labels, &program.symbols))
}
