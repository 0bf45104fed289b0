//! Two-Pass Assembler
//!
//! Pass 1 sizes every instruction and records label offsets.
//! Pass 2 writes bytes, resolving label-relative branches and recording a
//! [`Relocation`] for every data symbol reference.

use std::collections::HashMap;

use tracing::debug;

use super::encoding::{encode, CodeBuffer, Disp, Encoding, Imm};
use super::inst::{Inst, Label, LabelTable};
use super::symbols::{align_up, RelocKind, Relocation, SectionKind, SymbolTable};
use crate::error::{CompileError, Result};

/// Padding byte for `Align` (int3)
const PAD_BYTE: u8 = 0xCC;

/// Output of [`assemble`]: `.text` bytes plus the fix-ups they need
#[derive(Debug)]
pub struct AssembledCode {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
    label_offsets: HashMap<Label, u64>,
}

impl AssembledCode {
    /// Byte offset of a bound label inside `.text`
    pub fn label_offset(&self, label: Label) -> Option<u64> {
        self.label_offsets.get(&label).copied()
    }
}

fn describe(inst: &Inst, labels: &LabelTable, symbols: &SymbolTable) -> String {
    inst.display(labels, Some(symbols)).to_string()
}

/// Assemble an instruction stream into `.text` bytes
pub fn assemble(insts: &[Inst], labels: &LabelTable, symbols: &SymbolTable) -> Result<AssembledCode> {
    // Pass 1: sizes and label offsets
    let mut encodings: Vec<Encoding> = Vec::with_capacity(insts.len());
    let mut label_offsets: HashMap<Label, u64> = HashMap::new();
    let mut pc: u64 = 0;

    for inst in insts {
        match inst {
            Inst::Label(label) => {
                if label_offsets.insert(*label, pc).is_some() {
                    return Err(CompileError::InvalidInstruction {
                        instruction: describe(inst, labels, symbols),
                        message: "label bound twice".to_string(),
                    });
                }
            }
            Inst::Align(n) => {
                if !n.is_power_of_two() {
                    return Err(CompileError::InvalidInstruction {
                        instruction: describe(inst, labels, symbols),
                        message: "alignment must be a power of two".to_string(),
                    });
                }
                pc = align_up(pc, *n);
            }
            _ => {}
        }
        let enc = encode(inst).map_err(|message| CompileError::InvalidInstruction {
            instruction: describe(inst, labels, symbols),
            message: message.to_string(),
        })?;
        pc += enc.len() as u64;
        encodings.push(enc);
    }
    debug!(
        instructions = insts.len(),
        labels = label_offsets.len(),
        size = pc,
        "assembler pass 1 complete"
    );

    // Pass 2: bytes, branch displacements, relocations
    let mut buf = CodeBuffer::new();
    let mut relocations = Vec::new();

    for (inst, enc) in insts.iter().zip(&encodings) {
        let start = buf.offset() as u64;
        let next = start + enc.len() as u64;

        let rel = match enc.imm {
            Imm::Rel8(target) | Imm::Rel32(target) => {
                let dest = label_offsets.get(&target).copied().ok_or_else(|| {
                    CompileError::RelocationUnresolved {
                        symbol: labels.name(target).to_string(),
                    }
                })?;
                let delta = dest as i64 - next as i64;
                let (fits, bits) = match enc.imm {
                    Imm::Rel8(_) => (i8::try_from(delta).is_ok(), 8),
                    _ => (i32::try_from(delta).is_ok(), 32),
                };
                if !fits {
                    return Err(CompileError::EncodingRange {
                        instruction: describe(inst, labels, symbols),
                        value: delta,
                        bits,
                    });
                }
                delta
            }
            _ => 0,
        };

        if let Inst::Align(n) = inst {
            let padded = align_up(start, *n);
            buf.emit_fill(PAD_BYTE, (padded - start) as usize);
            continue;
        }

        if let Disp::Rip { symbol, addend } = enc.disp {
            // The CPU adds the displacement to the address of the next
            // instruction, which lies past any trailing immediate.
            let tail = (enc.len() - enc.disp_offset()) as i64;
            relocations.push(Relocation {
                section: SectionKind::Text,
                offset: start + enc.disp_offset() as u64,
                symbol,
                kind: RelocKind::PcRel32,
                addend: addend as i64 - tail,
            });
        }
        if let Imm::Abs64 { symbol, addend } = enc.imm {
            relocations.push(Relocation {
                section: SectionKind::Text,
                offset: start + enc.imm_offset() as u64,
                symbol,
                kind: RelocKind::Abs64,
                addend,
            });
        }

        enc.write(&mut buf, rel);
    }

    Ok(AssembledCode {
        bytes: buf.into_code(),
        relocations,
        label_offsets,
    })
}
