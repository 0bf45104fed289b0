//! x64 Register Definitions
//!
//! All 16 general-purpose 64-bit registers with encoding values, plus the
//! register roles the code generator relies on.
//! Follows the System V AMD64 ABI for Linux.

use std::fmt;

/// x64 64-bit general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg64 {
    /// Get the 3-bit encoding for ModR/M and SIB bytes
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// Check if this register requires REX.B, REX.X or REX.R bit
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// The low byte of SPL/BPL/SIL/DIL is only addressable with a REX prefix;
    /// without one the same encodings select AH/CH/DH/BH.
    #[inline]
    pub fn byte_needs_rex(self) -> bool {
        matches!(self, Reg64::RSP | Reg64::RBP | Reg64::RSI | Reg64::RDI)
    }

    /// Check if this register is callee-saved (System V ABI)
    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg64::RBX | Reg64::RBP | Reg64::R12 | Reg64::R13 | Reg64::R14 | Reg64::R15
        )
    }

    /// Check if this register is caller-saved (System V ABI)
    pub fn is_caller_saved(self) -> bool {
        !self.is_callee_saved() && self != Reg64::RSP
    }

    /// Name of the 32-bit view of this register
    pub fn name32(self) -> &'static str {
        match self {
            Reg64::RAX => "eax",
            Reg64::RCX => "ecx",
            Reg64::RDX => "edx",
            Reg64::RBX => "ebx",
            Reg64::RSP => "esp",
            Reg64::RBP => "ebp",
            Reg64::RSI => "esi",
            Reg64::RDI => "edi",
            Reg64::R8 => "r8d",
            Reg64::R9 => "r9d",
            Reg64::R10 => "r10d",
            Reg64::R11 => "r11d",
            Reg64::R12 => "r12d",
            Reg64::R13 => "r13d",
            Reg64::R14 => "r14d",
            Reg64::R15 => "r15d",
        }
    }

    /// Name of the low-byte view of this register
    pub fn name8(self) -> &'static str {
        match self {
            Reg64::RAX => "al",
            Reg64::RCX => "cl",
            Reg64::RDX => "dl",
            Reg64::RBX => "bl",
            Reg64::RSP => "spl",
            Reg64::RBP => "bpl",
            Reg64::RSI => "sil",
            Reg64::RDI => "dil",
            Reg64::R8 => "r8b",
            Reg64::R9 => "r9b",
            Reg64::R10 => "r10b",
            Reg64::R11 => "r11b",
            Reg64::R12 => "r12b",
            Reg64::R13 => "r13b",
            Reg64::R14 => "r14b",
            Reg64::R15 => "r15b",
        }
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
            Reg64::R8 => "r8",
            Reg64::R9 => "r9",
            Reg64::R10 => "r10",
            Reg64::R11 => "r11",
            Reg64::R12 => "r12",
            Reg64::R13 => "r13",
            Reg64::R14 => "r14",
            Reg64::R15 => "r15",
        };
        write!(f, "{}", name)
    }
}

/// System V AMD64 ABI argument registers (in order) - Linux
pub const SYSV_ARG_REGS: [Reg64; 6] = [
    Reg64::RDI,
    Reg64::RSI,
    Reg64::RDX,
    Reg64::RCX,
    Reg64::R8,
    Reg64::R9,
];

/// System V AMD64 ABI return register
pub const SYSV_RET_REG: Reg64 = Reg64::RAX;

/// Holds the current agent's state base pointer for the whole handler body
pub const STATE_BASE_REG: Reg64 = Reg64::R12;

/// Holds the current inbound message pointer for the whole handler body
pub const MESSAGE_REG: Reg64 = Reg64::R13;

/// Expression scratch registers, handed out LIFO in this order.
///
/// Argument registers, RAX and RDX are excluded: calls, division and
/// shifts use them as fixed operands.
pub const SCRATCH_POOL: [Reg64; 5] = [
    Reg64::RBX,
    Reg64::R14,
    Reg64::R15,
    Reg64::R10,
    Reg64::R11,
];
