//! ELF64 Executable Generation
//!
//! Generates static Linux x86-64 ELF executables.
//! No external linker required.
//!
//! ## Image Layout
//!
//! ```text
//! file offset 0      ELF header, program headers, .text        PT_LOAD R+X
//! next page          .rodata                                   PT_LOAD R
//! next page          .data, then .bss (memsz > filesz)         PT_LOAD R+W
//! ```
//!
//! Every segment starts on a page boundary with `vaddr = load_address +
//! file offset`, so the loader's `offset ≡ vaddr (mod page)` rule always
//! holds. Empty segments are left out.

use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use super::symbols::{align_up, DataSection, RelocKind, Relocation, SectionKind, SymbolTable};
use crate::error::{CompileError, Result};

/// ELF64 file header constants
pub mod consts {
    // ELF magic number
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    // ELF class
    pub const ELFCLASS64: u8 = 2;

    // Data encoding
    pub const ELFDATA2LSB: u8 = 1; // Little endian

    // ELF version
    pub const EV_CURRENT: u8 = 1;

    // OS/ABI
    pub const ELFOSABI_NONE: u8 = 0; // UNIX System V ABI

    // Object file type
    pub const ET_EXEC: u16 = 2; // Executable file

    // Machine type
    pub const EM_X86_64: u16 = 62;

    // Program header types
    pub const PT_LOAD: u32 = 1;

    // Program header flags
    pub const PF_X: u32 = 1; // Execute
    pub const PF_W: u32 = 2; // Write
    pub const PF_R: u32 = 4; // Read

    // Header sizes
    pub const ELF64_EHDR_SIZE: u16 = 64;
    pub const ELF64_PHDR_SIZE: u16 = 56;

    // Default load address for Linux x86-64
    pub const DEFAULT_LOAD_ADDR: u64 = 0x400000;

    pub const PAGE_SIZE: u64 = 0x1000;
}

/// ELF64 file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Header {
    pub e_type: u16,      // Object file type
    pub e_machine: u16,   // Machine type
    pub e_version: u32,   // Object file version
    pub e_entry: u64,     // Entry point address
    pub e_phoff: u64,     // Program header offset
    pub e_shoff: u64,     // Section header offset
    pub e_flags: u32,     // Processor-specific flags
    pub e_ehsize: u16,    // ELF header size
    pub e_phentsize: u16, // Program header entry size
    pub e_phnum: u16,     // Number of program headers
    pub e_shentsize: u16, // Section header entry size
    pub e_shnum: u16,     // Number of section headers
    pub e_shstrndx: u16,  // Section name string table index
}

impl Default for Elf64Header {
    fn default() -> Self {
        Self {
            e_type: consts::ET_EXEC,
            e_machine: consts::EM_X86_64,
            e_version: consts::EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: consts::ELF64_EHDR_SIZE as u64,
            e_shoff: 0, // No section headers: the loader only reads segments
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: consts::ELF64_PHDR_SIZE,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}

impl Elf64Header {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_ident (16 bytes)
        w.write_all(&consts::ELF_MAGIC)?;
        w.write_all(&[consts::ELFCLASS64])?; // EI_CLASS
        w.write_all(&[consts::ELFDATA2LSB])?; // EI_DATA
        w.write_all(&[consts::EV_CURRENT])?; // EI_VERSION
        w.write_all(&[consts::ELFOSABI_NONE])?; // EI_OSABI
        w.write_all(&[0u8; 8])?; // EI_PAD

        w.write_all(&self.e_type.to_le_bytes())?;
        w.write_all(&self.e_machine.to_le_bytes())?;
        w.write_all(&self.e_version.to_le_bytes())?;
        w.write_all(&self.e_entry.to_le_bytes())?;
        w.write_all(&self.e_phoff.to_le_bytes())?;
        w.write_all(&self.e_shoff.to_le_bytes())?;
        w.write_all(&self.e_flags.to_le_bytes())?;
        w.write_all(&self.e_ehsize.to_le_bytes())?;
        w.write_all(&self.e_phentsize.to_le_bytes())?;
        w.write_all(&self.e_phnum.to_le_bytes())?;
        w.write_all(&self.e_shentsize.to_le_bytes())?;
        w.write_all(&self.e_shnum.to_le_bytes())?;
        w.write_all(&self.e_shstrndx.to_le_bytes())?;

        Ok(())
    }
}

/// ELF64 program header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,   // Segment type
    pub p_flags: u32,  // Segment flags
    pub p_offset: u64, // Segment file offset
    pub p_vaddr: u64,  // Segment virtual address
    pub p_paddr: u64,  // Segment physical address
    pub p_filesz: u64, // Segment size in file
    pub p_memsz: u64,  // Segment size in memory
    pub p_align: u64,  // Segment alignment
}

impl Elf64ProgramHeader {
    fn load(flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> Self {
        Self {
            p_type: consts::PT_LOAD,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: consts::PAGE_SIZE,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.p_type.to_le_bytes())?;
        w.write_all(&self.p_flags.to_le_bytes())?;
        w.write_all(&self.p_offset.to_le_bytes())?;
        w.write_all(&self.p_vaddr.to_le_bytes())?;
        w.write_all(&self.p_paddr.to_le_bytes())?;
        w.write_all(&self.p_filesz.to_le_bytes())?;
        w.write_all(&self.p_memsz.to_le_bytes())?;
        w.write_all(&self.p_align.to_le_bytes())?;
        Ok(())
    }
}

/// A laid-out output section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub align: u64,
    pub vaddr: u64,
    pub file_offset: u64,
    /// Bytes present in the file (0 for `.bss`)
    pub file_size: u64,
    pub mem_size: u64,
}

impl Section {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// A finished executable. Produced once by [`ExecutableBuilder::build`].
#[derive(Debug, Clone)]
pub struct ExecutableImage {
    header: Elf64Header,
    program_headers: Vec<Elf64ProgramHeader>,
    sections: Vec<Section>,
    bytes: Vec<u8>,
}

impl ExecutableImage {
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    pub fn program_headers(&self) -> &[Elf64ProgramHeader] {
        &self.program_headers
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Write the image and mark it executable. The bytes go to a temporary
    /// file next to `path` that is renamed into place, so a failed write
    /// leaves no partial executable behind.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&self.bytes)?;
        file.as_file().sync_all()?;

        // Make executable (chmod +x) - Unix only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.as_file().metadata()?.permissions();
            perms.set_mode(0o755);
            file.as_file().set_permissions(perms)?;
        }

        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// ELF64 executable builder
#[derive(Debug)]
pub struct ExecutableBuilder {
    load_addr: u64,
    text: Vec<u8>,
    rodata: DataSection,
    data: DataSection,
    bss: DataSection,
    relocations: Vec<Relocation>,
    entry_offset: u64,
}

impl ExecutableBuilder {
    pub fn new() -> Self {
        Self {
            load_addr: consts::DEFAULT_LOAD_ADDR,
            text: Vec::new(),
            rodata: DataSection::new(SectionKind::Rodata),
            data: DataSection::new(SectionKind::Data),
            bss: DataSection::new(SectionKind::Bss),
            relocations: Vec::new(),
            entry_offset: 0,
        }
    }

    /// Set the load address (default: 0x400000)
    pub fn load_addr(mut self, addr: u64) -> Self {
        self.load_addr = addr;
        self
    }

    /// Set the executable code
    pub fn text(mut self, code: Vec<u8>) -> Self {
        self.text = code;
        self
    }

    /// Set `.rodata`, `.data` or `.bss`, chosen by the section's kind
    pub fn section(mut self, section: DataSection) -> Self {
        match section.kind {
            SectionKind::Rodata => self.rodata = section,
            SectionKind::Data => self.data = section,
            SectionKind::Bss => self.bss = section,
            SectionKind::Text => {}
        }
        self
    }

    pub fn relocations(mut self, relocations: impl IntoIterator<Item = Relocation>) -> Self {
        self.relocations.extend(relocations);
        self
    }

    /// Entry point, as an offset into `.text`
    pub fn entry(mut self, text_offset: u64) -> Self {
        self.entry_offset = text_offset;
        self
    }

    /// Lay out sections, patch relocations and emit the image
    pub fn build(self, symbols: &SymbolTable) -> Result<ExecutableImage> {
        let page = consts::PAGE_SIZE;
        let has_rodata = !self.rodata.is_empty();
        let has_data = !self.data.is_empty() || !self.bss.is_empty();
        let phnum = 1 + has_rodata as u16 + has_data as u16;
        let headers_size =
            consts::ELF64_EHDR_SIZE as u64 + phnum as u64 * consts::ELF64_PHDR_SIZE as u64;

        let mut sections = Vec::with_capacity(4);

        let text_offset = align_up(headers_size, 16);
        let text_len = self.text.len() as u64;
        sections.push(Section {
            kind: SectionKind::Text,
            align: 16,
            vaddr: self.load_addr + text_offset,
            file_offset: text_offset,
            file_size: text_len,
            mem_size: text_len,
        });
        let mut file_end = text_offset + text_len;

        if has_rodata {
            let offset = align_up(file_end, page);
            let len = self.rodata.len();
            sections.push(Section {
                kind: SectionKind::Rodata,
                align: self.rodata.align,
                vaddr: self.load_addr + offset,
                file_offset: offset,
                file_size: len,
                mem_size: len,
            });
            file_end = offset + len;
        }

        if has_data {
            let offset = align_up(file_end, page);
            let len = self.data.len();
            let vaddr = self.load_addr + offset;
            sections.push(Section {
                kind: SectionKind::Data,
                align: self.data.align,
                vaddr,
                file_offset: offset,
                file_size: len,
                mem_size: len,
            });
            file_end = offset + len;
            if !self.bss.is_empty() {
                let bss_vaddr = align_up(vaddr + len, self.bss.align);
                sections.push(Section {
                    kind: SectionKind::Bss,
                    align: self.bss.align,
                    vaddr: bss_vaddr,
                    file_offset: file_end,
                    file_size: 0,
                    mem_size: self.bss.len(),
                });
            }
        }

        let vaddr_of = |kind: SectionKind| -> Option<u64> {
            sections.iter().find(|s| s.kind == kind).map(|s| s.vaddr)
        };

        // Patch relocations now that every section has an address
        let mut text = self.text;
        let mut rodata = self.rodata.into_bytes();
        let mut data = self.data.into_bytes();
        for reloc in &self.relocations {
            let sym = symbols.get(reloc.symbol);
            let target = match vaddr_of(sym.section) {
                Some(base) if sym.bound => base + sym.offset,
                _ => {
                    return Err(CompileError::RelocationUnresolved {
                        symbol: sym.name.clone(),
                    })
                }
            };
            let site_base = vaddr_of(reloc.section).ok_or_else(|| CompileError::InvalidInstruction {
                instruction: format!("relocation against `{}`", sym.name),
                message: format!("site section {} is not part of the image", reloc.section),
            })?;
            let buf = match reloc.section {
                SectionKind::Text => &mut text,
                SectionKind::Rodata => &mut rodata,
                SectionKind::Data => &mut data,
                SectionKind::Bss => {
                    return Err(CompileError::InvalidInstruction {
                        instruction: format!("relocation against `{}`", sym.name),
                        message: "zero-initialized sections cannot hold relocations".to_string(),
                    })
                }
            };
            let at = reloc.offset as usize;
            let width = match reloc.kind {
                RelocKind::PcRel32 => 4,
                RelocKind::Abs64 => 8,
            };
            let site = buf.get_mut(at..at + width).ok_or_else(|| CompileError::InvalidInstruction {
                instruction: format!("relocation against `{}`", sym.name),
                message: format!("site {}+{:#x} lies outside the section", reloc.section, at),
            })?;
            let value = target as i64 + reloc.addend;
            match reloc.kind {
                RelocKind::PcRel32 => {
                    let place = (site_base + reloc.offset) as i64;
                    let rel = value - place;
                    let rel = i32::try_from(rel).map_err(|_| CompileError::EncodingRange {
                        instruction: format!(
                            "{}+{:#x} -> `{}`",
                            reloc.section, reloc.offset, sym.name
                        ),
                        value: rel,
                        bits: 32,
                    })?;
                    site.copy_from_slice(&rel.to_le_bytes());
                }
                RelocKind::Abs64 => {
                    site.copy_from_slice(&(value as u64).to_le_bytes());
                }
            }
        }

        let mut program_headers = Vec::with_capacity(phnum as usize);
        program_headers.push(Elf64ProgramHeader::load(
            consts::PF_R | consts::PF_X,
            0,
            self.load_addr,
            text_offset + text_len,
            text_offset + text_len,
        ));
        for section in &sections {
            match section.kind {
                SectionKind::Rodata => program_headers.push(Elf64ProgramHeader::load(
                    consts::PF_R,
                    section.file_offset,
                    section.vaddr,
                    section.file_size,
                    section.mem_size,
                )),
                SectionKind::Data => {
                    let end = sections
                        .iter()
                        .filter(|s| matches!(s.kind, SectionKind::Data | SectionKind::Bss))
                        .map(|s| s.vaddr + s.mem_size)
                        .max()
                        .unwrap_or(section.vaddr);
                    program_headers.push(Elf64ProgramHeader::load(
                        consts::PF_R | consts::PF_W,
                        section.file_offset,
                        section.vaddr,
                        section.file_size,
                        end - section.vaddr,
                    ));
                }
                _ => {}
            }
        }

        let header = Elf64Header {
            e_entry: self.load_addr + text_offset + self.entry_offset,
            e_phnum: phnum,
            ..Default::default()
        };

        let mut bytes = Vec::with_capacity(file_end as usize);
        header.write(&mut bytes)?;
        for phdr in &program_headers {
            phdr.write(&mut bytes)?;
        }
        for section in &sections {
            let content = match section.kind {
                SectionKind::Text => &text,
                SectionKind::Rodata => &rodata,
                SectionKind::Data => &data,
                SectionKind::Bss => continue,
            };
            bytes.resize(section.file_offset as usize, 0);
            bytes.extend_from_slice(content);
        }

        debug!(
            sections = sections.len(),
            segments = program_headers.len(),
            size = bytes.len(),
            entry = format_args!("{:#x}", header.e_entry),
            "image laid out"
        );

        Ok(ExecutableImage {
            header,
            program_headers,
            sections,
            bytes,
        })
    }
}

impl Default for ExecutableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u64_at(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    fn i32_at(bytes: &[u8], at: usize) -> i32 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_elf_header_size() {
        let ehdr = Elf64Header::default();
        let mut buf = Vec::new();
        ehdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_program_header_size() {
        let phdr = Elf64ProgramHeader::load(consts::PF_R | consts::PF_X, 0, 0x400000, 120, 120);
        let mut buf = Vec::new();
        phdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 56);
    }

    #[test]
    fn test_elf_identity() {
        let image = ExecutableBuilder::new()
            .text(vec![0xC3]) // ret
            .build(&SymbolTable::new())
            .unwrap();
        let elf = image.bytes();

        assert_eq!(&elf[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(elf[4], 2); // 64-bit
        assert_eq!(elf[5], 1); // little endian
        assert_eq!(u16::from_le_bytes([elf[16], elf[17]]), consts::ET_EXEC);
        assert_eq!(u16::from_le_bytes([elf[18], elf[19]]), 62);
    }

    #[test]
    fn test_text_only_image_has_one_segment() {
        let image = ExecutableBuilder::new()
            .text(vec![0x90, 0xC3])
            .entry(1)
            .build(&SymbolTable::new())
            .unwrap();
        assert_eq!(image.program_headers().len(), 1);
        // 64 + 56 = 120, aligned to 128
        assert_eq!(image.entry(), 0x400000 + 128 + 1);
        let phdr = &image.program_headers()[0];
        assert_eq!(phdr.p_offset, 0);
        assert_eq!(phdr.p_filesz, 130);
        assert_eq!(phdr.p_flags, consts::PF_R | consts::PF_X);
    }

    #[test]
    fn test_segments_are_page_congruent() {
        let mut rodata = DataSection::new(SectionKind::Rodata);
        rodata.append(b"hello\0", 1);
        let mut data = DataSection::new(SectionKind::Data);
        data.append(&[1, 2, 3, 4, 5, 6, 7, 8], 8);
        let mut bss = DataSection::new(SectionKind::Bss);
        bss.reserve(4096 * 3, 16);

        let image = ExecutableBuilder::new()
            .text(vec![0xC3; 5000])
            .section(rodata)
            .section(data)
            .section(bss)
            .build(&SymbolTable::new())
            .unwrap();

        let phdrs = image.program_headers();
        assert_eq!(phdrs.len(), 3);
        for phdr in phdrs {
            assert_eq!(phdr.p_type, consts::PT_LOAD);
            assert_eq!(phdr.p_offset % 4096, phdr.p_vaddr % 4096);
            assert_eq!(phdr.p_offset % 4096, 0);
        }
        assert_eq!(phdrs[1].p_flags, consts::PF_R);
        assert_eq!(phdrs[2].p_flags, consts::PF_R | consts::PF_W);
        assert_eq!(phdrs[2].p_filesz, 8);
        assert!(phdrs[2].p_memsz > phdrs[2].p_filesz);

        // segments ascend without overlapping
        assert!(phdrs[1].p_vaddr >= phdrs[0].p_vaddr + phdrs[0].p_memsz);
        assert!(phdrs[2].p_vaddr >= phdrs[1].p_vaddr + phdrs[1].p_memsz);

        let ro = image.section(SectionKind::Rodata).unwrap();
        let at = ro.file_offset as usize;
        assert_eq!(&image.bytes()[at..at + 6], b"hello\0");
        assert_eq!(image.len() as u64, phdrs[2].p_offset + 8);
    }

    #[test]
    fn test_empty_rodata_is_omitted() {
        let mut data = DataSection::new(SectionKind::Data);
        data.append(&[0; 8], 8);
        let image = ExecutableBuilder::new()
            .text(vec![0xC3])
            .section(data)
            .build(&SymbolTable::new())
            .unwrap();
        assert_eq!(image.program_headers().len(), 2);
        assert!(image.section(SectionKind::Rodata).is_none());
    }

    #[test]
    fn test_relocations_are_patched() {
        let mut symbols = SymbolTable::new();
        let mut rodata = DataSection::new(SectionKind::Rodata);
        let msg = symbols
            .define("msg", SectionKind::Rodata, rodata.append(b"hi\0", 1))
            .unwrap();
        let mut data = DataSection::new(SectionKind::Data);
        let ptr_off = data.append(&[0; 8], 8);

        // lea rdi, [rip + msg]; ret
        let text = vec![0x48, 0x8D, 0x3D, 0, 0, 0, 0, 0xC3];
        let relocs = vec![
            Relocation {
                section: SectionKind::Text,
                offset: 3,
                symbol: msg,
                kind: RelocKind::PcRel32,
                addend: -4,
            },
            Relocation {
                section: SectionKind::Data,
                offset: ptr_off,
                symbol: msg,
                kind: RelocKind::Abs64,
                addend: 1,
            },
        ];
        let image = ExecutableBuilder::new()
            .text(text)
            .section(rodata)
            .section(data)
            .relocations(relocs)
            .build(&symbols)
            .unwrap();

        let text_sec = image.section(SectionKind::Text).unwrap();
        let ro = image.section(SectionKind::Rodata).unwrap();
        let data_sec = image.section(SectionKind::Data).unwrap();

        let disp = i32_at(image.bytes(), text_sec.file_offset as usize + 3);
        let next_ip = text_sec.vaddr + 7;
        assert_eq!((next_ip as i64 + disp as i64) as u64, ro.vaddr);

        let ptr = u64_at(image.bytes(), data_sec.file_offset as usize);
        assert_eq!(ptr, ro.vaddr + 1);
    }

    #[test]
    fn test_unbound_symbol_is_unresolved() {
        let mut symbols = SymbolTable::new();
        let ghost = symbols.declare("ghost", SectionKind::Data);
        let result = ExecutableBuilder::new()
            .text(vec![0x48, 0x8D, 0x3D, 0, 0, 0, 0])
            .relocations([Relocation {
                section: SectionKind::Text,
                offset: 3,
                symbol: ghost,
                kind: RelocKind::PcRel32,
                addend: -4,
            }])
            .build(&symbols);
        match result {
            Err(CompileError::RelocationUnresolved { symbol }) => assert_eq!(symbol, "ghost"),
            other => panic!("expected RelocationUnresolved, got {other:?}"),
        }
    }

    #[test]
    fn test_pc_relative_overflow() {
        let mut symbols = SymbolTable::new();
        let mut bss = DataSection::new(SectionKind::Bss);
        bss.reserve(1 << 33, 16);
        let far = symbols.define("far", SectionKind::Bss, 1 << 32).unwrap();
        let mut data = DataSection::new(SectionKind::Data);
        data.append(&[0; 8], 8);
        let result = ExecutableBuilder::new()
            .text(vec![0x48, 0x8D, 0x3D, 0, 0, 0, 0])
            .section(data)
            .section(bss)
            .relocations([Relocation {
                section: SectionKind::Text,
                offset: 3,
                symbol: far,
                kind: RelocKind::PcRel32,
                addend: -4,
            }])
            .build(&symbols);
        assert!(matches!(
            result,
            Err(CompileError::EncodingRange { bits: 32, .. })
        ));
    }

    #[test]
    fn test_build_is_deterministic() {
        let build = || {
            let mut data = DataSection::new(SectionKind::Data);
            data.append(&[9; 8], 8);
            ExecutableBuilder::new()
                .text(vec![0x90, 0x90, 0xC3])
                .section(data)
                .build(&SymbolTable::new())
                .unwrap()
                .into_bytes()
        };
        assert_eq!(build(), build());
    }

    fn tiny_image() -> ExecutableImage {
        ExecutableBuilder::new()
            .text(vec![0x90, 0xC3])
            .build(&SymbolTable::new())
            .unwrap()
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog");
        std::fs::write(&path, b"stale").unwrap();
        let image = tiny_image();
        image.write_to_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), image.bytes());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        // no temporary left next to the output
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        // renaming a file over a directory fails after the bytes are written
        let target = dir.path().join("out");
        std::fs::create_dir(&target).unwrap();
        let result = tiny_image().write_to_file(&target);
        assert!(matches!(result, Err(CompileError::Io(_))));
        assert!(target.is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let missing = dir.path().join("no-such-dir").join("prog");
        assert!(tiny_image().write_to_file(&missing).is_err());
        assert!(!missing.exists());
    }
}
