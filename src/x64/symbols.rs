//! Symbols, Sections and Relocations
//!
//! A symbol names a byte offset inside one output section. Its final virtual
//! address is only known once the executable builder has laid out the
//! sections, so every reference to it from code or data is recorded as a
//! [`Relocation`] and patched at the very end.

use std::collections::HashMap;
use std::fmt;

use crate::error::{CompileError, Result};

/// Output sections, in image order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    /// Machine code (R+X)
    Text,
    /// Read-only constants (R)
    Rodata,
    /// Initialized data (R+W)
    Data,
    /// Zero-initialized data (R+W, no file bytes)
    Bss,
}

impl SectionKind {
    pub const ALL: [SectionKind; 4] = [
        SectionKind::Text,
        SectionKind::Rodata,
        SectionKind::Data,
        SectionKind::Bss,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::Rodata => ".rodata",
            SectionKind::Data => ".data",
            SectionKind::Bss => ".bss",
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of a symbol in the [`SymbolTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub section: SectionKind,
    pub offset: u64,
    pub bound: bool,
}

/// All symbols of one compilation, in creation order
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a symbol whose location is not known yet
    pub fn declare(&mut self, name: &str, section: SectionKind) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.to_string(),
            section,
            offset: 0,
            bound: false,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Bind a previously declared symbol to its section offset
    pub fn bind(&mut self, id: SymbolId, offset: u64) -> Result<()> {
        let sym = &mut self.symbols[id.0 as usize];
        if sym.bound {
            return Err(CompileError::Reference {
                entity: format!("symbol `{}`", sym.name),
                message: "symbol defined twice".to_string(),
            });
        }
        sym.offset = offset;
        sym.bound = true;
        Ok(())
    }

    /// Declare and bind in one step
    pub fn define(&mut self, name: &str, section: SectionKind, offset: u64) -> Result<SymbolId> {
        let id = self.declare(name, section);
        self.bind(id, offset)?;
        Ok(id)
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.symbols[id.0 as usize].name
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }
}

/// Relocation kinds supported by the image builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// `S + A - P`, stored as a signed 32-bit value (RIP-relative operands)
    PcRel32,
    /// `S + A`, stored as a 64-bit value (`movabs`, pointers in data)
    Abs64,
}

/// A deferred address fix-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Section containing the bytes to patch
    pub section: SectionKind,
    /// Offset of the patch site inside `section`
    pub offset: u64,
    pub symbol: SymbolId,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Raw bytes of a data section under construction
#[derive(Debug, Clone)]
pub struct DataSection {
    pub kind: SectionKind,
    pub align: u64,
    bytes: Vec<u8>,
    /// Used instead of `bytes` for `.bss`
    size: u64,
}

impl DataSection {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            align: 16,
            bytes: Vec::new(),
            size: 0,
        }
    }

    pub fn len(&self) -> u64 {
        match self.kind {
            SectionKind::Bss => self.size,
            _ => self.bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Pad to `align` and append `data`, returning its offset
    pub fn append(&mut self, data: &[u8], align: u64) -> u64 {
        let offset = align_up(self.len(), align);
        match self.kind {
            SectionKind::Bss => {
                self.size = offset + data.len() as u64;
            }
            _ => {
                self.bytes.resize(offset as usize, 0);
                self.bytes.extend_from_slice(data);
            }
        }
        self.align = self.align.max(align);
        offset
    }

    /// Reserve `size` zero bytes, returning their offset
    pub fn reserve(&mut self, size: u64, align: u64) -> u64 {
        let offset = align_up(self.len(), align);
        match self.kind {
            SectionKind::Bss => self.size = offset + size,
            _ => self.bytes.resize((offset + size) as usize, 0),
        }
        self.align = self.align.max(align);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Round `value` up to a multiple of `align` (a power of two, or 0/1)
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}
