//! Abstract x64 Instructions
//!
//! Code generators append [`Inst`] values to a flat `Vec`; control flow
//! targets are [`Label`] ids rather than pointers, so the assembler resolves
//! forward references in its second pass.

use std::collections::HashMap;
use std::fmt;

use super::registers::Reg64;
use super::symbols::{SymbolId, SymbolTable};
use crate::error::{CompileError, Result};

/// Position marker in the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Label names, indexed by label id
#[derive(Debug, Default, Clone)]
pub struct LabelTable {
    names: Vec<String>,
    named: HashMap<String, Label>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a local label; `hint` only serves listings and diagnostics
    pub fn fresh(&mut self, hint: &str) -> Label {
        let label = Label(self.names.len() as u32);
        self.names.push(format!(".L{}.{}", label.0, hint));
        label
    }

    /// Create a label with a globally unique name (routine entry points)
    pub fn named(&mut self, name: &str) -> Result<Label> {
        if self.named.contains_key(name) {
            return Err(CompileError::Reference {
                entity: format!("label `{}`", name),
                message: "label name is not unique".to_string(),
            });
        }
        let label = Label(self.names.len() as u32);
        self.names.push(name.to_string());
        self.named.insert(name.to_string(), label);
        Ok(label)
    }

    pub fn lookup(&self, name: &str) -> Option<Label> {
        self.named.get(name).copied()
    }

    pub fn name(&self, label: Label) -> &str {
        self.names
            .get(label.0 as usize)
            .map(|s| s.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Condition codes, valued by their `cc` nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    NO = 0x1,
    /// Below (unsigned <)
    B = 0x2,
    /// Above or equal (unsigned >=)
    AE = 0x3,
    E = 0x4,
    NE = 0x5,
    /// Below or equal (unsigned <=)
    BE = 0x6,
    /// Above (unsigned >)
    A = 0x7,
    S = 0x8,
    NS = 0x9,
    L = 0xC,
    GE = 0xD,
    LE = 0xE,
    G = 0xF,
}

impl Cond {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::NO => "no",
            Cond::B => "b",
            Cond::AE => "ae",
            Cond::E => "e",
            Cond::NE => "ne",
            Cond::BE => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::NS => "ns",
            Cond::L => "l",
            Cond::GE => "ge",
            Cond::LE => "le",
            Cond::G => "g",
        }
    }
}

/// Operand width of a data movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    fn ptr_name(self) -> &'static str {
        match self {
            Width::W8 => "byte",
            Width::W32 => "dword",
            Width::W64 => "qword",
        }
    }
}

/// SIB scale factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    S1 = 0,
    S2 = 1,
    S4 = 2,
    S8 = 3,
}

impl Scale {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn factor(self) -> u8 {
        1 << (self as u8)
    }
}

/// Base of a memory operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    Reg(Reg64),
    /// RIP-relative reference to a data symbol; the displacement is the addend
    Rip(SymbolId),
}

/// `[base + index*scale + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Base,
    pub index: Option<(Reg64, Scale)>,
    pub disp: i32,
}

impl Mem {
    pub fn base(reg: Reg64) -> Self {
        Self {
            base: Base::Reg(reg),
            index: None,
            disp: 0,
        }
    }

    pub fn disp(reg: Reg64, disp: i32) -> Self {
        Self {
            base: Base::Reg(reg),
            index: None,
            disp,
        }
    }

    pub fn indexed(reg: Reg64, index: Reg64, scale: Scale, disp: i32) -> Self {
        Self {
            base: Base::Reg(reg),
            index: Some((index, scale)),
            disp,
        }
    }

    pub fn sym(symbol: SymbolId, addend: i32) -> Self {
        Self {
            base: Base::Rip(symbol),
            index: None,
            disp: addend,
        }
    }
}

/// Register-or-memory operand (the ModR/M `r/m` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    Reg(Reg64),
    Mem(Mem),
}

/// General operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg64),
    Imm(i64),
    Mem(Mem),
}

impl From<Reg64> for Operand {
    fn from(reg: Reg64) -> Self {
        Operand::Reg(reg)
    }
}

impl From<Mem> for Operand {
    fn from(mem: Mem) -> Self {
        Operand::Mem(mem)
    }
}

impl From<i64> for Operand {
    fn from(imm: i64) -> Self {
        Operand::Imm(imm)
    }
}

impl From<i32> for Operand {
    fn from(imm: i32) -> Self {
        Operand::Imm(imm as i64)
    }
}

impl From<Reg64> for Rm {
    fn from(reg: Reg64) -> Self {
        Rm::Reg(reg)
    }
}

impl From<Mem> for Rm {
    fn from(mem: Mem) -> Self {
        Rm::Mem(mem)
    }
}

/// Two-operand integer ALU group (`00`-`3F` opcodes, `80`/`81`/`83` /ext)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Opcode of the `r/m8, r8` form; the other forms are offsets from it
    pub fn base_opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x00,
            AluOp::Or => 0x08,
            AluOp::And => 0x20,
            AluOp::Sub => 0x28,
            AluOp::Xor => 0x30,
            AluOp::Cmp => 0x38,
        }
    }

    /// ModR/M `reg` extension for the immediate forms
    pub fn extension(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }
}

/// One-operand `F7`/`FF` group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    /// Unsigned divide RDX:RAX
    Div,
    /// Signed divide RDX:RAX
    Idiv,
    Inc,
    Dec,
}

impl UnaryOp {
    fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "neg",
            UnaryOp::Div => "div",
            UnaryOp::Idiv => "idiv",
            UnaryOp::Inc => "inc",
            UnaryOp::Dec => "dec",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    pub fn extension(self) -> u8 {
        match self {
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftAmount {
    Cl,
    Imm(u8),
}

/// One abstract x64 instruction (or assembler directive)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// Bind a label to the current position
    Label(Label),
    /// Pad with `int3` up to a multiple of the given power of two
    Align(u64),
    Mov {
        width: Width,
        dst: Operand,
        src: Operand,
    },
    /// `movabs dst, symbol + addend` (absolute 64-bit relocation)
    MovAbs {
        dst: Reg64,
        symbol: SymbolId,
        addend: i64,
    },
    /// Zero-extend a byte into a 64-bit register
    MovZx8 { dst: Reg64, src: Rm },
    /// Sign-extend a dword into a 64-bit register (`movsxd`)
    MovSx32 { dst: Reg64, src: Rm },
    Lea { dst: Reg64, src: Mem },
    Alu {
        op: AluOp,
        width: Width,
        dst: Operand,
        src: Operand,
    },
    Test { dst: Rm, src: Reg64 },
    Imul { dst: Reg64, src: Rm },
    Unary { op: UnaryOp, dst: Rm },
    Shift {
        op: ShiftOp,
        dst: Rm,
        amount: ShiftAmount,
    },
    /// Sign-extend RAX into RDX:RAX
    Cqo,
    Setcc { cond: Cond, dst: Reg64 },
    Push(Reg64),
    Pop(Reg64),
    Call(Label),
    /// `jmp rel32`
    Jmp(Label),
    /// `jmp rel8`
    JmpShort(Label),
    /// `jcc rel32`
    Jcc { cond: Cond, target: Label },
    /// `jcc rel8`
    JccShort { cond: Cond, target: Label },
    Ret,
    Syscall,
    RepMovsb,
    RepStosb,
    Ud2,
}

impl Inst {
    /// 64-bit `mov`
    pub fn mov(dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Inst::Mov {
            width: Width::W64,
            dst: dst.into(),
            src: src.into(),
        }
    }

    pub fn mov_w(width: Width, dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Inst::Mov {
            width,
            dst: dst.into(),
            src: src.into(),
        }
    }

    /// 64-bit ALU operation
    pub fn alu(op: AluOp, dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Inst::Alu {
            op,
            width: Width::W64,
            dst: dst.into(),
            src: src.into(),
        }
    }

    pub fn lea(dst: Reg64, src: Mem) -> Self {
        Inst::Lea { dst, src }
    }

    /// `xor reg, reg`
    pub fn zero(reg: Reg64) -> Self {
        Inst::alu(AluOp::Xor, reg, reg)
    }

    pub fn test(reg: Reg64) -> Self {
        Inst::Test {
            dst: Rm::Reg(reg),
            src: reg,
        }
    }

    pub fn jcc(cond: Cond, target: Label) -> Self {
        Inst::Jcc { cond, target }
    }

    /// Label referenced as a branch or call target
    pub fn target(&self) -> Option<Label> {
        match self {
            Inst::Call(l) | Inst::Jmp(l) | Inst::JmpShort(l) => Some(*l),
            Inst::Jcc { target, .. } | Inst::JccShort { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Render with label and symbol names resolved
    pub fn display<'a>(
        &'a self,
        labels: &'a LabelTable,
        symbols: Option<&'a SymbolTable>,
    ) -> InstDisplay<'a> {
        InstDisplay {
            inst: self,
            labels,
            symbols,
        }
    }
}

/// Intel-syntax rendering of an [`Inst`]
pub struct InstDisplay<'a> {
    inst: &'a Inst,
    labels: &'a LabelTable,
    symbols: Option<&'a SymbolTable>,
}

impl InstDisplay<'_> {
    fn reg(&self, f: &mut fmt::Formatter<'_>, reg: Reg64, width: Width) -> fmt::Result {
        match width {
            Width::W8 => f.write_str(reg.name8()),
            Width::W32 => f.write_str(reg.name32()),
            Width::W64 => write!(f, "{}", reg),
        }
    }

    fn mem(&self, f: &mut fmt::Formatter<'_>, mem: &Mem, width: Option<Width>) -> fmt::Result {
        if let Some(width) = width {
            write!(f, "{} ", width.ptr_name())?;
        }
        f.write_str("[")?;
        match mem.base {
            Base::Reg(reg) => write!(f, "{}", reg)?,
            Base::Rip(sym) => match self.symbols {
                Some(table) => write!(f, "rip + {}", table.name(sym))?,
                None => write!(f, "rip + sym{}", sym.0)?,
            },
        }
        if let Some((index, scale)) = mem.index {
            write!(f, " + {}*{}", index, scale.factor())?;
        }
        if mem.disp > 0 {
            write!(f, " + {}", mem.disp)?;
        } else if mem.disp < 0 {
            write!(f, " - {}", (mem.disp as i64).unsigned_abs())?;
        }
        f.write_str("]")
    }

    fn operand(&self, f: &mut fmt::Formatter<'_>, op: &Operand, width: Width) -> fmt::Result {
        match op {
            Operand::Reg(reg) => self.reg(f, *reg, width),
            Operand::Imm(imm) => write!(f, "{}", imm),
            Operand::Mem(mem) => self.mem(f, mem, Some(width)),
        }
    }

    fn rm(&self, f: &mut fmt::Formatter<'_>, rm: &Rm, width: Width) -> fmt::Result {
        match rm {
            Rm::Reg(reg) => self.reg(f, *reg, width),
            Rm::Mem(mem) => self.mem(f, mem, Some(width)),
        }
    }
}

impl fmt::Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inst {
            Inst::Label(label) => write!(f, "{}:", self.labels.name(*label)),
            Inst::Align(n) => write!(f, ".align {}", n),
            Inst::Mov { width, dst, src } => {
                f.write_str("mov ")?;
                self.operand(f, dst, *width)?;
                f.write_str(", ")?;
                self.operand(f, src, *width)
            }
            Inst::MovAbs {
                dst,
                symbol,
                addend,
            } => {
                write!(f, "movabs {}, ", dst)?;
                match self.symbols {
                    Some(table) => f.write_str(table.name(*symbol))?,
                    None => write!(f, "sym{}", symbol.0)?,
                }
                if *addend != 0 {
                    write!(f, " + {}", addend)?;
                }
                Ok(())
            }
            Inst::MovZx8 { dst, src } => {
                write!(f, "movzx {}, ", dst)?;
                self.rm(f, src, Width::W8)
            }
            Inst::MovSx32 { dst, src } => {
                write!(f, "movsxd {}, ", dst)?;
                self.rm(f, src, Width::W32)
            }
            Inst::Lea { dst, src } => {
                write!(f, "lea {}, ", dst)?;
                self.mem(f, src, None)
            }
            Inst::Alu {
                op,
                width,
                dst,
                src,
            } => {
                write!(f, "{} ", op.mnemonic())?;
                self.operand(f, dst, *width)?;
                f.write_str(", ")?;
                self.operand(f, src, *width)
            }
            Inst::Test { dst, src } => {
                f.write_str("test ")?;
                self.rm(f, dst, Width::W64)?;
                write!(f, ", {}", src)
            }
            Inst::Imul { dst, src } => {
                write!(f, "imul {}, ", dst)?;
                self.rm(f, src, Width::W64)
            }
            Inst::Unary { op, dst } => {
                write!(f, "{} ", op.mnemonic())?;
                self.rm(f, dst, Width::W64)
            }
            Inst::Shift { op, dst, amount } => {
                write!(f, "{} ", op.mnemonic())?;
                self.rm(f, dst, Width::W64)?;
                match amount {
                    ShiftAmount::Cl => f.write_str(", cl"),
                    ShiftAmount::Imm(n) => write!(f, ", {}", n),
                }
            }
            Inst::Cqo => f.write_str("cqo"),
            Inst::Setcc { cond, dst } => write!(f, "set{} {}", cond.suffix(), dst.name8()),
            Inst::Push(reg) => write!(f, "push {}", reg),
            Inst::Pop(reg) => write!(f, "pop {}", reg),
            Inst::Call(label) => write!(f, "call {}", self.labels.name(*label)),
            Inst::Jmp(label) => write!(f, "jmp {}", self.labels.name(*label)),
            Inst::JmpShort(label) => write!(f, "jmp short {}", self.labels.name(*label)),
            Inst::Jcc { cond, target } => {
                write!(f, "j{} {}", cond.suffix(), self.labels.name(*target))
            }
            Inst::JccShort { cond, target } => {
                write!(f, "j{} short {}", cond.suffix(), self.labels.name(*target))
            }
            Inst::Ret => f.write_str("ret"),
            Inst::Syscall => f.write_str("syscall"),
            Inst::RepMovsb => f.write_str("rep movsb"),
            Inst::RepStosb => f.write_str("rep stosb"),
            Inst::Ud2 => f.write_str("ud2"),
        }
    }
}

/// Render a whole instruction stream as an indented listing
pub fn listing(insts: &[Inst], labels: &LabelTable, symbols: &SymbolTable) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for inst in insts {
        match inst {
            Inst::Label(_) => {
                let _ = writeln!(out, "{}", inst.display(labels, Some(symbols)));
            }
            _ => {
                let _ = writeln!(out, "    {}", inst.display(labels, Some(symbols)));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::symbols::SectionKind;

    #[test]
    fn test_fresh_labels_are_distinct() {
        let mut labels = LabelTable::new();
        let a = labels.fresh("then");
        let b = labels.fresh("then");
        assert_ne!(a, b);
        assert_ne!(labels.name(a), labels.name(b));
    }

    #[test]
    fn test_named_labels_must_be_unique() {
        let mut labels = LabelTable::new();
        labels.named("_start").unwrap();
        assert!(labels.named("_start").is_err());
        assert!(labels.lookup("_start").is_some());
    }

    #[test]
    fn test_display_memory_operands() {
        let labels = LabelTable::new();
        let inst = Inst::Mov {
            width: Width::W64,
            dst: Operand::Reg(Reg64::RAX),
            src: Operand::Mem(Mem::disp(Reg64::RBP, -8)),
        };
        assert_eq!(
            inst.display(&labels, None).to_string(),
            "mov rax, qword [rbp - 8]"
        );

        let inst = Inst::Alu {
            op: AluOp::Cmp,
            width: Width::W8,
            dst: Operand::Mem(Mem::indexed(Reg64::RDI, Reg64::RAX, Scale::S1, 0)),
            src: Operand::Imm(0),
        };
        assert_eq!(
            inst.display(&labels, None).to_string(),
            "cmp byte [rdi + rax*1], 0"
        );
    }

    #[test]
    fn test_display_symbol_names() {
        let labels = LabelTable::new();
        let mut symbols = SymbolTable::new();
        let heap = symbols.declare("heap", SectionKind::Bss);
        let inst = Inst::Lea {
            dst: Reg64::RDI,
            src: Mem::sym(heap, 16),
        };
        assert_eq!(
            inst.display(&labels, Some(&symbols)).to_string(),
            "lea rdi, [rip + heap + 16]"
        );
    }

    #[test]
    fn test_branch_targets() {
        let mut labels = LabelTable::new();
        let l = labels.fresh("loop");
        assert_eq!(Inst::Jmp(l).target(), Some(l));
        assert_eq!(
            Inst::JccShort {
                cond: Cond::NE,
                target: l
            }
            .target(),
            Some(l)
        );
        assert_eq!(Inst::Ret.target(), None);
    }
}
