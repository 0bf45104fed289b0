//! x64 Instruction Encoding
//!
//! Direct machine code generation for x64 instructions.
//! No external assembler dependency.
//!
//! ## Instruction Format
//!
//! ```text
//! [Legacy Prefix] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```
//!
//! [`encode`] maps an abstract [`Inst`] to an [`Encoding`]: the exact list of
//! fields that instruction occupies. Which fields are present depends only on
//! the mnemonic and the operand kinds (plus immediate/displacement magnitudes,
//! which are known up front), so the length is fixed before any label has an
//! address. Label displacements and symbol addresses are filled in later.

use super::inst::{AluOp, Base, Inst, Label, Mem, Operand, Rm, ShiftAmount, ShiftOp, UnaryOp, Width};
use super::registers::Reg64;
use super::symbols::SymbolId;

/// Machine code buffer for emitting instructions
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit multiple bytes
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a 32-bit little-endian value
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit little-endian value
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit `count` copies of `byte`
    pub fn emit_fill(&mut self, byte: u8, count: usize) {
        self.code.resize(self.code.len() + count, byte);
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Take ownership of the generated code
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

/// REX prefix builder
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    w: bool, // 64-bit operand size
    r: bool, // ModR/M reg extension
    x: bool, // SIB index extension
    b: bool, // ModR/M r/m or SIB base extension
}

impl Rex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set W bit (64-bit operand size)
    pub fn w(mut self) -> Self {
        self.w = true;
        self
    }

    /// Set R bit (reg field extension for r8-r15)
    pub fn r(mut self) -> Self {
        self.r = true;
        self
    }

    /// Set X bit (SIB index extension for r8-r15)
    pub fn x(mut self) -> Self {
        self.x = true;
        self
    }

    /// Set B bit (r/m or base field extension for r8-r15)
    pub fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// Check if REX prefix is needed
    pub fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    /// Encode to byte (0x40-0x4F)
    pub fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3)
            | ((self.r as u8) << 2)
            | ((self.x as u8) << 1)
            | (self.b as u8)
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Create ModR/M for register-to-register (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for a memory operand (mod=00, 01 or 10)
    pub fn mem(mod_: u8, reg: u8, rm: u8) -> Self {
        Self {
            mod_: mod_ & 0x03,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

/// SIB byte builder
#[derive(Debug, Clone, Copy)]
pub struct Sib {
    scale: u8, // 2 bits: log2 of the index multiplier
    index: u8, // 3 bits: index register (100 = none)
    base: u8,  // 3 bits: base register
}

impl Sib {
    pub fn new(scale: u8, index: u8, base: u8) -> Self {
        Self {
            scale: scale & 0x03,
            index: index & 0x07,
            base: base & 0x07,
        }
    }

    pub fn encode(&self) -> u8 {
        (self.scale << 6) | (self.index << 3) | self.base
    }
}

/// rm field value that selects a SIB byte (or RIP-relative with mod=00)
const RM_SIB: u8 = 0b100;
const RM_DISP32: u8 = 0b101;
const SIB_NO_INDEX: u8 = 0b100;

/// Displacement field of an encoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disp {
    None,
    D8(i8),
    D32(i32),
    /// RIP-relative disp32 against a data symbol, filled by relocation
    Rip { symbol: SymbolId, addend: i32 },
}

impl Disp {
    pub fn len(&self) -> usize {
        match self {
            Disp::None => 0,
            Disp::D8(_) => 1,
            Disp::D32(_) | Disp::Rip { .. } => 4,
        }
    }
}

/// Immediate field of an encoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm {
    None,
    I8(i8),
    I32(i32),
    I64(i64),
    /// Branch displacement to a label, rel8
    Rel8(Label),
    /// Branch displacement to a label, rel32
    Rel32(Label),
    /// Absolute symbol address, filled by relocation
    Abs64 { symbol: SymbolId, addend: i64 },
}

impl Imm {
    pub fn len(&self) -> usize {
        match self {
            Imm::None => 0,
            Imm::I8(_) | Imm::Rel8(_) => 1,
            Imm::I32(_) | Imm::Rel32(_) => 4,
            Imm::I64(_) | Imm::Abs64 { .. } => 8,
        }
    }
}

/// Field-by-field layout of one encoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub prefix: Option<u8>,
    pub rex: Option<u8>,
    opcode: [u8; 3],
    opcode_len: u8,
    pub modrm: Option<u8>,
    pub sib: Option<u8>,
    pub disp: Disp,
    pub imm: Imm,
}

impl Encoding {
    /// A zero-length encoding (labels, directives)
    pub fn empty() -> Self {
        Self {
            prefix: None,
            rex: None,
            opcode: [0; 3],
            opcode_len: 0,
            modrm: None,
            sib: None,
            disp: Disp::None,
            imm: Imm::None,
        }
    }

    pub fn opcode(&self) -> &[u8] {
        &self.opcode[..self.opcode_len as usize]
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.disp_offset() + self.disp.len() + self.imm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the displacement field from the first byte
    pub fn disp_offset(&self) -> usize {
        self.prefix.is_some() as usize
            + self.rex.is_some() as usize
            + self.opcode_len as usize
            + self.modrm.is_some() as usize
            + self.sib.is_some() as usize
    }

    /// Offset of the immediate field from the first byte
    pub fn imm_offset(&self) -> usize {
        self.disp_offset() + self.disp.len()
    }

    /// Write the final bytes.
    ///
    /// `rel` is the resolved branch displacement for `Rel8`/`Rel32`
    /// immediates and must already be range checked. Relocated fields are
    /// written as zero placeholders.
    pub fn write(&self, buf: &mut CodeBuffer, rel: i64) {
        if let Some(prefix) = self.prefix {
            buf.emit(prefix);
        }
        if let Some(rex) = self.rex {
            buf.emit(rex);
        }
        buf.emit_bytes(self.opcode());
        if let Some(modrm) = self.modrm {
            buf.emit(modrm);
        }
        if let Some(sib) = self.sib {
            buf.emit(sib);
        }
        match self.disp {
            Disp::None => {}
            Disp::D8(d) => buf.emit(d as u8),
            Disp::D32(d) => buf.emit_i32(d),
            Disp::Rip { .. } => buf.emit_i32(0),
        }
        match self.imm {
            Imm::None => {}
            Imm::I8(v) => buf.emit(v as u8),
            Imm::I32(v) => buf.emit_i32(v),
            Imm::I64(v) => buf.emit_u64(v as u64),
            Imm::Rel8(_) => buf.emit(rel as i8 as u8),
            Imm::Rel32(_) => buf.emit_i32(rel as i32),
            Imm::Abs64 { .. } => buf.emit_u64(0),
        }
    }
}

/// Encoding under construction
#[derive(Debug, Clone, Copy)]
struct Builder {
    prefix: Option<u8>,
    rex: Rex,
    force_rex: bool,
    opcode: [u8; 3],
    opcode_len: u8,
    modrm: Option<u8>,
    sib: Option<u8>,
    disp: Disp,
    imm: Imm,
}

type EncodeResult = Result<Encoding, &'static str>;

impl Builder {
    fn op(bytes: &[u8]) -> Self {
        let mut opcode = [0u8; 3];
        opcode[..bytes.len()].copy_from_slice(bytes);
        Self {
            prefix: None,
            rex: Rex::new(),
            force_rex: false,
            opcode,
            opcode_len: bytes.len() as u8,
            modrm: None,
            sib: None,
            disp: Disp::None,
            imm: Imm::None,
        }
    }

    fn prefix(mut self, byte: u8) -> Self {
        self.prefix = Some(byte);
        self
    }

    fn w(mut self, on: bool) -> Self {
        if on {
            self.rex = self.rex.w();
        }
        self
    }

    /// Register encoded in the low opcode bits (`+rd`)
    fn opcode_reg(mut self, reg: Reg64) -> Self {
        let last = self.opcode_len as usize - 1;
        self.opcode[last] += reg.encoding();
        if reg.needs_rex_ext() {
            self.rex = self.rex.b();
        }
        self
    }

    /// `reg` names a byte register in this instruction
    fn byte_reg(mut self, reg: Reg64) -> Self {
        self.force_rex |= reg.byte_needs_rex();
        self
    }

    fn byte_rm(self, rm: &Rm) -> Self {
        match rm {
            Rm::Reg(reg) => self.byte_reg(*reg),
            Rm::Mem(_) => self,
        }
    }

    fn imm(mut self, imm: Imm) -> Self {
        self.imm = imm;
        self
    }

    /// Fill ModR/M (and SIB/displacement) from a `reg` field value and an r/m operand.
    ///
    /// `reg` is either a register number (0-15) or an opcode extension (0-7).
    fn modrm(mut self, reg: u8, rm: &Rm) -> Result<Self, &'static str> {
        if reg >= 8 {
            self.rex = self.rex.r();
        }
        match rm {
            Rm::Reg(r) => {
                if r.needs_rex_ext() {
                    self.rex = self.rex.b();
                }
                self.modrm = Some(ModRM::reg_reg(reg, r.encoding()).encode());
            }
            Rm::Mem(mem) => self.mem(reg, mem)?,
        }
        Ok(self)
    }

    fn mem(&mut self, reg: u8, mem: &Mem) -> Result<(), &'static str> {
        let base = match mem.base {
            Base::Rip(symbol) => {
                if mem.index.is_some() {
                    return Err("RIP-relative operands cannot be indexed");
                }
                self.modrm = Some(ModRM::mem(0b00, reg, RM_DISP32).encode());
                self.disp = Disp::Rip {
                    symbol,
                    addend: mem.disp,
                };
                return Ok(());
            }
            Base::Reg(base) => base,
        };

        if base.needs_rex_ext() {
            self.rex = self.rex.b();
        }

        // mod=00 with base 101 means "disp32, no base", so RBP/R13 always
        // carry at least a disp8.
        let (mod_, disp) = if mem.disp == 0 && base.encoding() != RM_DISP32 {
            (0b00, Disp::None)
        } else if i8::try_from(mem.disp).is_ok() {
            (0b01, Disp::D8(mem.disp as i8))
        } else {
            (0b10, Disp::D32(mem.disp))
        };
        self.disp = disp;

        match mem.index {
            None if base.encoding() != RM_SIB => {
                self.modrm = Some(ModRM::mem(mod_, reg, base.encoding()).encode());
            }
            None => {
                // RSP/R12 as base can only be expressed through a SIB byte
                self.modrm = Some(ModRM::mem(mod_, reg, RM_SIB).encode());
                self.sib = Some(Sib::new(0, SIB_NO_INDEX, base.encoding()).encode());
            }
            Some((index, scale)) => {
                if index == Reg64::RSP {
                    return Err("RSP cannot be used as an index register");
                }
                if index.needs_rex_ext() {
                    self.rex = self.rex.x();
                }
                self.modrm = Some(ModRM::mem(mod_, reg, RM_SIB).encode());
                self.sib = Some(Sib::new(scale.bits(), index.encoding(), base.encoding()).encode());
            }
        }
        Ok(())
    }

    fn finish(self) -> Encoding {
        let rex = if self.rex.is_needed() || self.force_rex {
            Some(self.rex.encode())
        } else {
            None
        };
        Encoding {
            prefix: self.prefix,
            rex,
            opcode: self.opcode,
            opcode_len: self.opcode_len,
            modrm: self.modrm,
            sib: self.sib,
            disp: self.disp,
            imm: self.imm,
        }
    }
}

fn fits_i8(v: i64) -> bool {
    i8::try_from(v).is_ok()
}

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// Immediates of byte-sized operations accept both signed and unsigned bytes
fn byte_imm(v: i64) -> Result<Imm, &'static str> {
    if (-128..=255).contains(&v) {
        Ok(Imm::I8(v as u8 as i8))
    } else {
        Err("immediate does not fit in 8 bits")
    }
}

/// Immediates of dword operations accept both signed and unsigned dwords
fn dword_imm(v: i64) -> Result<Imm, &'static str> {
    if (i32::MIN as i64..=u32::MAX as i64).contains(&v) {
        Ok(Imm::I32(v as u32 as i32))
    } else {
        Err("immediate does not fit in 32 bits")
    }
}

fn operand_rm(op: &Operand) -> Option<Rm> {
    match op {
        Operand::Reg(r) => Some(Rm::Reg(*r)),
        Operand::Mem(m) => Some(Rm::Mem(*m)),
        Operand::Imm(_) => None,
    }
}

/// Compute the encoding of one instruction
pub fn encode(inst: &Inst) -> EncodeResult {
    match inst {
        Inst::Label(_) | Inst::Align(_) => Ok(Encoding::empty()),
        Inst::Mov { width, dst, src } => encode_mov(*width, dst, src),
        Inst::MovAbs {
            dst,
            symbol,
            addend,
        } => Ok(Builder::op(&[0xB8]) // REX.W B8+rd io
            .w(true)
            .opcode_reg(*dst)
            .imm(Imm::Abs64 {
                symbol: *symbol,
                addend: *addend,
            })
            .finish()),
        Inst::MovZx8 { dst, src } => Ok(Builder::op(&[0x0F, 0xB6]) // REX.W 0F B6 /r
            .w(true)
            .byte_rm(src)
            .modrm(*dst as u8, src)?
            .finish()),
        Inst::MovSx32 { dst, src } => Ok(Builder::op(&[0x63]) // REX.W 63 /r
            .w(true)
            .modrm(*dst as u8, src)?
            .finish()),
        Inst::Lea { dst, src } => Ok(Builder::op(&[0x8D]) // REX.W 8D /r
            .w(true)
            .modrm(*dst as u8, &Rm::Mem(*src))?
            .finish()),
        Inst::Alu {
            op,
            width,
            dst,
            src,
        } => encode_alu(*op, *width, dst, src),
        Inst::Test { dst, src } => Ok(Builder::op(&[0x85]) // REX.W 85 /r
            .w(true)
            .modrm(*src as u8, dst)?
            .finish()),
        Inst::Imul { dst, src } => Ok(Builder::op(&[0x0F, 0xAF]) // REX.W 0F AF /r
            .w(true)
            .modrm(*dst as u8, src)?
            .finish()),
        Inst::Unary { op, dst } => {
            let (opcode, ext) = match op {
                UnaryOp::Not => (0xF7, 2),
                UnaryOp::Neg => (0xF7, 3),
                UnaryOp::Div => (0xF7, 6),
                UnaryOp::Idiv => (0xF7, 7),
                UnaryOp::Inc => (0xFF, 0),
                UnaryOp::Dec => (0xFF, 1),
            };
            Ok(Builder::op(&[opcode]).w(true).modrm(ext, dst)?.finish())
        }
        Inst::Shift { op, dst, amount } => encode_shift(*op, dst, *amount),
        Inst::Cqo => Ok(Builder::op(&[0x99]).w(true).finish()),
        Inst::Setcc { cond, dst } => Ok(Builder::op(&[0x0F, 0x90 + cond.code()]) // 0F 9x /0
            .byte_reg(*dst)
            .modrm(0, &Rm::Reg(*dst))?
            .finish()),
        Inst::Push(reg) => Ok(Builder::op(&[0x50]).opcode_reg(*reg).finish()), // 50+rd
        Inst::Pop(reg) => Ok(Builder::op(&[0x58]).opcode_reg(*reg).finish()),  // 58+rd
        Inst::Call(label) => Ok(Builder::op(&[0xE8]).imm(Imm::Rel32(*label)).finish()),
        Inst::Jmp(label) => Ok(Builder::op(&[0xE9]).imm(Imm::Rel32(*label)).finish()),
        Inst::JmpShort(label) => Ok(Builder::op(&[0xEB]).imm(Imm::Rel8(*label)).finish()),
        Inst::Jcc { cond, target } => Ok(Builder::op(&[0x0F, 0x80 + cond.code()])
            .imm(Imm::Rel32(*target))
            .finish()),
        Inst::JccShort { cond, target } => Ok(Builder::op(&[0x70 + cond.code()])
            .imm(Imm::Rel8(*target))
            .finish()),
        Inst::Ret => Ok(Builder::op(&[0xC3]).finish()),
        Inst::Syscall => Ok(Builder::op(&[0x0F, 0x05]).finish()),
        Inst::RepMovsb => Ok(Builder::op(&[0xA4]).prefix(0xF3).finish()),
        Inst::RepStosb => Ok(Builder::op(&[0xAA]).prefix(0xF3).finish()),
        Inst::Ud2 => Ok(Builder::op(&[0x0F, 0x0B]).finish()),
    }
}

fn encode_mov(width: Width, dst: &Operand, src: &Operand) -> EncodeResult {
    let wide = width == Width::W64;
    match (dst, src) {
        (Operand::Reg(d), Operand::Reg(s)) => {
            let b = match width {
                Width::W8 => Builder::op(&[0x88]).byte_reg(*d).byte_reg(*s), // 88 /r
                _ => Builder::op(&[0x89]).w(wide),                           // 89 /r
            };
            Ok(b.modrm(*s as u8, &Rm::Reg(*d))?.finish())
        }
        (Operand::Reg(d), Operand::Mem(m)) => {
            let b = match width {
                Width::W8 => Builder::op(&[0x8A]).byte_reg(*d), // 8A /r
                _ => Builder::op(&[0x8B]).w(wide),              // 8B /r
            };
            Ok(b.modrm(*d as u8, &Rm::Mem(*m))?.finish())
        }
        (Operand::Mem(m), Operand::Reg(s)) => {
            let b = match width {
                Width::W8 => Builder::op(&[0x88]).byte_reg(*s),
                _ => Builder::op(&[0x89]).w(wide),
            };
            Ok(b.modrm(*s as u8, &Rm::Mem(*m))?.finish())
        }
        (Operand::Reg(d), Operand::Imm(v)) => match width {
            Width::W64 if fits_i32(*v) => Ok(Builder::op(&[0xC7]) // REX.W C7 /0 id
                .w(true)
                .modrm(0, &Rm::Reg(*d))?
                .imm(Imm::I32(*v as i32))
                .finish()),
            Width::W64 => Ok(Builder::op(&[0xB8]) // REX.W B8+rd io
                .w(true)
                .opcode_reg(*d)
                .imm(Imm::I64(*v))
                .finish()),
            Width::W32 => Ok(Builder::op(&[0xB8]).opcode_reg(*d).imm(dword_imm(*v)?).finish()),
            Width::W8 => Ok(Builder::op(&[0xB0]) // B0+rb ib
                .byte_reg(*d)
                .opcode_reg(*d)
                .imm(byte_imm(*v)?)
                .finish()),
        },
        (Operand::Mem(m), Operand::Imm(v)) => match width {
            Width::W64 => {
                if !fits_i32(*v) {
                    return Err("64-bit store immediate must fit in a sign-extended imm32");
                }
                Ok(Builder::op(&[0xC7])
                    .w(true)
                    .modrm(0, &Rm::Mem(*m))?
                    .imm(Imm::I32(*v as i32))
                    .finish())
            }
            Width::W32 => Ok(Builder::op(&[0xC7])
                .modrm(0, &Rm::Mem(*m))?
                .imm(dword_imm(*v)?)
                .finish()),
            Width::W8 => Ok(Builder::op(&[0xC6]) // C6 /0 ib
                .modrm(0, &Rm::Mem(*m))?
                .imm(byte_imm(*v)?)
                .finish()),
        },
        _ => Err("unsupported operand combination for mov"),
    }
}

fn encode_alu(op: AluOp, width: Width, dst: &Operand, src: &Operand) -> EncodeResult {
    let wide = width == Width::W64;
    let byte = width == Width::W8;
    let base = op.base_opcode();
    match (dst, src) {
        (Operand::Reg(_) | Operand::Mem(_), Operand::Reg(s)) => {
            // r/m, r form (01, 09, 21, 29, 31, 39; byte forms one lower)
            let rm = operand_rm(dst).ok_or("invalid destination")?;
            let mut b = Builder::op(&[base + if byte { 0 } else { 1 }]).w(wide);
            if byte {
                b = b.byte_reg(*s).byte_rm(&rm);
            }
            Ok(b.modrm(*s as u8, &rm)?.finish())
        }
        (Operand::Reg(d), Operand::Mem(m)) => {
            // r, r/m form (03, 0B, 23, 2B, 33, 3B)
            let mut b = Builder::op(&[base + if byte { 2 } else { 3 }]).w(wide);
            if byte {
                b = b.byte_reg(*d);
            }
            Ok(b.modrm(*d as u8, &Rm::Mem(*m))?.finish())
        }
        (Operand::Reg(_) | Operand::Mem(_), Operand::Imm(v)) => {
            let rm = operand_rm(dst).ok_or("invalid destination")?;
            let ext = op.extension();
            if byte {
                return Ok(Builder::op(&[0x80]) // 80 /ext ib
                    .byte_rm(&rm)
                    .modrm(ext, &rm)?
                    .imm(byte_imm(*v)?)
                    .finish());
            }
            if fits_i8(*v) {
                Ok(Builder::op(&[0x83]) // 83 /ext ib (sign-extended)
                    .w(wide)
                    .modrm(ext, &rm)?
                    .imm(Imm::I8(*v as i8))
                    .finish())
            } else if fits_i32(*v) || (!wide && dword_imm(*v).is_ok()) {
                Ok(Builder::op(&[0x81]) // 81 /ext id
                    .w(wide)
                    .modrm(ext, &rm)?
                    .imm(dword_imm(*v)?)
                    .finish())
            } else {
                Err("ALU immediate must fit in a sign-extended imm32")
            }
        }
        _ => Err("unsupported operand combination for ALU instruction"),
    }
}

fn encode_shift(op: ShiftOp, dst: &Rm, amount: ShiftAmount) -> EncodeResult {
    match amount {
        ShiftAmount::Cl => Ok(Builder::op(&[0xD3]) // REX.W D3 /ext
            .w(true)
            .modrm(op.extension(), dst)?
            .finish()),
        ShiftAmount::Imm(n) => {
            if n > 63 {
                return Err("shift count must be below 64");
            }
            Ok(Builder::op(&[0xC1]) // REX.W C1 /ext ib
                .w(true)
                .modrm(op.extension(), dst)?
                .imm(Imm::I8(n as i8))
                .finish())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::inst::{Cond, Scale};
    use crate::x64::symbols::SymbolId;

    fn bytes(inst: Inst) -> Vec<u8> {
        let enc = encode(&inst).expect("encodable");
        let mut buf = CodeBuffer::new();
        enc.write(&mut buf, 0);
        assert_eq!(buf.code().len(), enc.len(), "size function disagrees for {:?}", inst);
        buf.into_code()
    }

    fn mov(dst: impl Into<Operand>, src: impl Into<Operand>) -> Inst {
        Inst::Mov {
            width: Width::W64,
            dst: dst.into(),
            src: src.into(),
        }
    }

    fn alu(op: AluOp, dst: impl Into<Operand>, src: Operand) -> Inst {
        Inst::Alu {
            op,
            width: Width::W64,
            dst: dst.into(),
            src,
        }
    }

    #[test]
    fn test_mov_rax_imm_1_is_seven_bytes() {
        assert_eq!(
            bytes(mov(Reg64::RAX, Operand::Imm(1))),
            vec![0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_r64_imm64() {
        let code = bytes(mov(Reg64::RAX, Operand::Imm(0x1_0000_0000)));
        // REX.W + B8 + imm64
        assert_eq!(&code[0..2], &[0x48, 0xB8]);
        assert_eq!(code.len(), 10);
        let code = bytes(mov(Reg64::R9, Operand::Imm(10)));
        assert_eq!(code, vec![0x49, 0xC7, 0xC1, 0x0A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_r64_r64() {
        // REX.W + 89 + ModR/M(11 000 011)
        assert_eq!(bytes(mov(Reg64::RBX, Reg64::RAX)), vec![0x48, 0x89, 0xC3]);
    }

    #[test]
    fn test_extended_registers() {
        // REX.WRB + 89 + ModR/M(11 111 000)
        assert_eq!(bytes(mov(Reg64::R8, Reg64::R15)), vec![0x4D, 0x89, 0xF8]);
    }

    #[test]
    fn test_add_r64_r64() {
        // REX.W + 01 + ModR/M(11 011 000)
        assert_eq!(
            bytes(alu(AluOp::Add, Reg64::RAX, Operand::Reg(Reg64::RBX))),
            vec![0x48, 0x01, 0xD8]
        );
    }

    #[test]
    fn test_alu_immediate_forms() {
        assert_eq!(
            bytes(alu(AluOp::Sub, Reg64::RSP, Operand::Imm(8))),
            vec![0x48, 0x83, 0xEC, 0x08]
        );
        assert_eq!(
            bytes(alu(AluOp::Add, Reg64::RSP, Operand::Imm(8))),
            vec![0x48, 0x83, 0xC4, 0x08]
        );
        assert_eq!(
            bytes(alu(AluOp::Sub, Reg64::RSP, Operand::Imm(256))),
            vec![0x48, 0x81, 0xEC, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            bytes(alu(AluOp::And, Reg64::RSP, Operand::Imm(-16))),
            vec![0x48, 0x83, 0xE4, 0xF0]
        );
        assert_eq!(
            bytes(alu(AluOp::Cmp, Reg64::R11, Operand::Imm(64))),
            vec![0x49, 0x83, 0xFB, 0x40]
        );
    }

    #[test]
    fn test_alu_register_and_memory_forms() {
        assert_eq!(
            bytes(alu(AluOp::Xor, Reg64::RAX, Operand::Reg(Reg64::RAX))),
            vec![0x48, 0x31, 0xC0]
        );
        assert_eq!(
            bytes(alu(AluOp::Cmp, Reg64::RBX, Operand::Reg(Reg64::R14))),
            vec![0x4C, 0x39, 0xF3]
        );
        assert_eq!(
            bytes(alu(AluOp::Add, Reg64::RAX, Operand::Mem(Mem::disp(Reg64::RDI, 8)))),
            vec![0x48, 0x03, 0x47, 0x08]
        );
    }

    #[test]
    fn test_cmp_byte_indexed_memory() {
        let inst = Inst::Alu {
            op: AluOp::Cmp,
            width: Width::W8,
            dst: Operand::Mem(Mem::indexed(Reg64::RDI, Reg64::RAX, Scale::S1, 0)),
            src: Operand::Imm(0),
        };
        assert_eq!(bytes(inst), vec![0x80, 0x3C, 0x07, 0x00]);
    }

    #[test]
    fn test_memory_base_rules() {
        // rbp base always needs a displacement
        assert_eq!(
            bytes(mov(Reg64::RAX, Mem::disp(Reg64::RBP, -8))),
            vec![0x48, 0x8B, 0x45, 0xF8]
        );
        // rsp base needs a SIB byte
        assert_eq!(
            bytes(mov(Reg64::RAX, Mem::disp(Reg64::RSP, 8))),
            vec![0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        assert_eq!(
            bytes(mov(Mem::base(Reg64::RSP), Reg64::RAX)),
            vec![0x48, 0x89, 0x04, 0x24]
        );
        assert_eq!(
            bytes(mov(Reg64::RDI, Mem::base(Reg64::RSP))),
            vec![0x48, 0x8B, 0x3C, 0x24]
        );
        // r12 shares rsp's low bits and needs a SIB byte too
        assert_eq!(
            bytes(mov(Reg64::RAX, Mem::base(Reg64::R12))),
            vec![0x49, 0x8B, 0x04, 0x24]
        );
        // r13 shares rbp's low bits and needs a disp8
        assert_eq!(
            bytes(mov(Reg64::RAX, Mem::base(Reg64::R13))),
            vec![0x49, 0x8B, 0x45, 0x00]
        );
        assert_eq!(
            bytes(mov(Mem::disp(Reg64::R12, 16), Reg64::RBX)),
            vec![0x49, 0x89, 0x5C, 0x24, 0x10]
        );
        assert_eq!(
            bytes(mov(Mem::base(Reg64::R8), Reg64::RSI)),
            vec![0x49, 0x89, 0x30]
        );
    }

    #[test]
    fn test_disp32_memory() {
        assert_eq!(
            bytes(mov(Reg64::RCX, Mem::disp(Reg64::RBX, 0x1000))),
            vec![0x48, 0x8B, 0x8B, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sib_with_scale_and_extended_index() {
        assert_eq!(
            bytes(mov(
                Reg64::RAX,
                Mem::indexed(Reg64::RBX, Reg64::RCX, Scale::S8, 16)
            )),
            vec![0x48, 0x8B, 0x44, 0xCB, 0x10]
        );
        let lea = Inst::Lea {
            dst: Reg64::RDI,
            src: Mem::indexed(Reg64::RBX, Reg64::R14, Scale::S1, 1),
        };
        assert_eq!(bytes(lea), vec![0x4A, 0x8D, 0x7C, 0x33, 0x01]);
        let lea = Inst::Lea {
            dst: Reg64::R8,
            src: Mem::indexed(Reg64::RDI, Reg64::RCX, Scale::S1, 16),
        };
        assert_eq!(bytes(lea), vec![0x4C, 0x8D, 0x44, 0x0F, 0x10]);
    }

    #[test]
    fn test_rsp_is_not_an_index() {
        let inst = Inst::Lea {
            dst: Reg64::RAX,
            src: Mem::indexed(Reg64::RAX, Reg64::RSP, Scale::S1, 0),
        };
        assert!(encode(&inst).is_err());
    }

    #[test]
    fn test_rip_relative_lea() {
        let inst = Inst::Lea {
            dst: Reg64::RDI,
            src: Mem::sym(SymbolId(0), 0),
        };
        let enc = encode(&inst).unwrap();
        assert_eq!(enc.len(), 7);
        assert_eq!(enc.disp_offset(), 3);
        assert_eq!(bytes(inst), vec![0x48, 0x8D, 0x3D, 0, 0, 0, 0]);
    }

    #[test]
    fn test_rip_relative_store_with_immediate() {
        let inst = Inst::Mov {
            width: Width::W64,
            dst: Operand::Mem(Mem::sym(SymbolId(0), 0)),
            src: Operand::Imm(0),
        };
        let enc = encode(&inst).unwrap();
        assert_eq!(enc.disp_offset(), 3);
        assert_eq!(enc.imm_offset(), 7);
        assert_eq!(enc.len(), 11);
        assert_eq!(&bytes(inst)[..3], &[0x48, 0xC7, 0x05]);
    }

    #[test]
    fn test_narrow_stores() {
        let store32 = Inst::Mov {
            width: Width::W32,
            dst: Operand::Mem(Mem::disp(Reg64::R12, 4)),
            src: Operand::Reg(Reg64::R10),
        };
        assert_eq!(bytes(store32), vec![0x45, 0x89, 0x54, 0x24, 0x04]);

        let store8 = Inst::Mov {
            width: Width::W8,
            dst: Operand::Mem(Mem::base(Reg64::RSI)),
            src: Operand::Reg(Reg64::RDX),
        };
        assert_eq!(bytes(store8), vec![0x88, 0x16]);

        let store8_imm = Inst::Mov {
            width: Width::W8,
            dst: Operand::Mem(Mem::base(Reg64::RSI)),
            src: Operand::Imm(b'-' as i64),
        };
        assert_eq!(bytes(store8_imm), vec![0xC6, 0x06, 0x2D]);

        let store8_sil = Inst::Mov {
            width: Width::W8,
            dst: Operand::Mem(Mem::base(Reg64::RAX)),
            src: Operand::Reg(Reg64::RSI),
        };
        // SIL needs an empty REX prefix, otherwise it would mean DH
        assert_eq!(bytes(store8_sil), vec![0x40, 0x88, 0x30]);

        let store8_indexed = Inst::Mov {
            width: Width::W8,
            dst: Operand::Mem(Mem::indexed(Reg64::R12, Reg64::RAX, Scale::S1, 0)),
            src: Operand::Imm(0),
        };
        assert_eq!(bytes(store8_indexed), vec![0x41, 0xC6, 0x04, 0x04, 0x00]);
    }

    #[test]
    fn test_extending_loads() {
        let movsxd = Inst::MovSx32 {
            dst: Reg64::RAX,
            src: Rm::Mem(Mem::disp(Reg64::R13, 4)),
        };
        assert_eq!(bytes(movsxd), vec![0x49, 0x63, 0x45, 0x04]);

        let movzx = Inst::MovZx8 {
            dst: Reg64::RBX,
            src: Rm::Reg(Reg64::RBX),
        };
        assert_eq!(bytes(movzx), vec![0x48, 0x0F, 0xB6, 0xDB]);

        let movzx = Inst::MovZx8 {
            dst: Reg64::R10,
            src: Rm::Reg(Reg64::R10),
        };
        assert_eq!(bytes(movzx), vec![0x4D, 0x0F, 0xB6, 0xD2]);

        let movzx = Inst::MovZx8 {
            dst: Reg64::RAX,
            src: Rm::Mem(Mem::indexed(Reg64::RDI, Reg64::RCX, Scale::S1, 0)),
        };
        assert_eq!(bytes(movzx), vec![0x48, 0x0F, 0xB6, 0x04, 0x0F]);
    }

    #[test]
    fn test_setcc() {
        let sete = Inst::Setcc {
            cond: Cond::E,
            dst: Reg64::RBX,
        };
        assert_eq!(bytes(sete), vec![0x0F, 0x94, 0xC3]);
        let setl = Inst::Setcc {
            cond: Cond::L,
            dst: Reg64::R10,
        };
        assert_eq!(bytes(setl), vec![0x41, 0x0F, 0x9C, 0xC2]);
        let sete_sil = Inst::Setcc {
            cond: Cond::E,
            dst: Reg64::RSI,
        };
        assert_eq!(bytes(sete_sil), vec![0x40, 0x0F, 0x94, 0xC6]);
    }

    #[test]
    fn test_unary_group() {
        let neg = Inst::Unary {
            op: UnaryOp::Neg,
            dst: Rm::Reg(Reg64::RBX),
        };
        assert_eq!(bytes(neg), vec![0x48, 0xF7, 0xDB]);
        let not = Inst::Unary {
            op: UnaryOp::Not,
            dst: Rm::Reg(Reg64::R10),
        };
        assert_eq!(bytes(not), vec![0x49, 0xF7, 0xD2]);
        let idiv = Inst::Unary {
            op: UnaryOp::Idiv,
            dst: Rm::Reg(Reg64::RCX),
        };
        assert_eq!(bytes(idiv), vec![0x48, 0xF7, 0xF9]);
        let idiv = Inst::Unary {
            op: UnaryOp::Idiv,
            dst: Rm::Reg(Reg64::R11),
        };
        assert_eq!(bytes(idiv), vec![0x49, 0xF7, 0xFB]);
        let inc = Inst::Unary {
            op: UnaryOp::Inc,
            dst: Rm::Mem(Mem::disp(Reg64::RDI, 8)),
        };
        assert_eq!(bytes(inc), vec![0x48, 0xFF, 0x47, 0x08]);
    }

    #[test]
    fn test_imul_and_test() {
        let imul = Inst::Imul {
            dst: Reg64::RBX,
            src: Rm::Reg(Reg64::R14),
        };
        assert_eq!(bytes(imul), vec![0x49, 0x0F, 0xAF, 0xDE]);
        let test = Inst::Test {
            dst: Rm::Reg(Reg64::RAX),
            src: Reg64::RAX,
        };
        assert_eq!(bytes(test), vec![0x48, 0x85, 0xC0]);
    }

    #[test]
    fn test_shifts() {
        let shl = Inst::Shift {
            op: ShiftOp::Shl,
            dst: Rm::Reg(Reg64::RCX),
            amount: ShiftAmount::Imm(4),
        };
        assert_eq!(bytes(shl), vec![0x48, 0xC1, 0xE1, 0x04]);
        let shl = Inst::Shift {
            op: ShiftOp::Shl,
            dst: Rm::Reg(Reg64::RBX),
            amount: ShiftAmount::Cl,
        };
        assert_eq!(bytes(shl), vec![0x48, 0xD3, 0xE3]);
        let sar = Inst::Shift {
            op: ShiftOp::Sar,
            dst: Rm::Reg(Reg64::R14),
            amount: ShiftAmount::Cl,
        };
        assert_eq!(bytes(sar), vec![0x49, 0xD3, 0xFE]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(bytes(Inst::Push(Reg64::RBP)), vec![0x55]);
        assert_eq!(bytes(Inst::Pop(Reg64::RBP)), vec![0x5D]);
        assert_eq!(bytes(Inst::Push(Reg64::R12)), vec![0x41, 0x54]);
        assert_eq!(bytes(Inst::Pop(Reg64::R15)), vec![0x41, 0x5F]);
    }

    #[test]
    fn test_fixed_instructions() {
        assert_eq!(bytes(Inst::Syscall), vec![0x0F, 0x05]);
        assert_eq!(bytes(Inst::Ret), vec![0xC3]);
        assert_eq!(bytes(Inst::Cqo), vec![0x48, 0x99]);
        assert_eq!(bytes(Inst::RepMovsb), vec![0xF3, 0xA4]);
        assert_eq!(bytes(Inst::RepStosb), vec![0xF3, 0xAA]);
        assert_eq!(bytes(Inst::Ud2), vec![0x0F, 0x0B]);
    }

    #[test]
    fn test_branch_sizes() {
        let l = Label(0);
        assert_eq!(encode(&Inst::Call(l)).unwrap().len(), 5);
        assert_eq!(encode(&Inst::Jmp(l)).unwrap().len(), 5);
        assert_eq!(encode(&Inst::JmpShort(l)).unwrap().len(), 2);
        let jcc = Inst::Jcc {
            cond: Cond::E,
            target: l,
        };
        assert_eq!(encode(&jcc).unwrap().opcode(), &[0x0F, 0x84]);
        assert_eq!(encode(&jcc).unwrap().len(), 6);
        let jcc = Inst::JccShort {
            cond: Cond::NE,
            target: l,
        };
        assert_eq!(encode(&jcc).unwrap().opcode(), &[0x75]);
    }

    #[test]
    fn test_movabs_symbol() {
        let inst = Inst::MovAbs {
            dst: Reg64::R10,
            symbol: SymbolId(3),
            addend: 0,
        };
        let enc = encode(&inst).unwrap();
        assert_eq!(enc.len(), 10);
        assert_eq!(enc.imm_offset(), 2);
        assert_eq!(&bytes(inst)[..2], &[0x49, 0xBA]);
    }

    #[test]
    fn test_invalid_combinations() {
        let mem_to_mem = mov(Mem::base(Reg64::RAX), Mem::base(Reg64::RBX));
        assert!(encode(&mem_to_mem).is_err());
        let big_store = mov(Mem::base(Reg64::RAX), Operand::Imm(i64::MAX));
        assert!(encode(&big_store).is_err());
    }
}
