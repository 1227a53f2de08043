//! Hand-built ELF32 relocatable objects for tests. The pipeline under test
//! never shells out to a real assembler or linker, so fixtures are built
//! byte-by-byte here rather than compiled from `.c`/`.s` sources.

#![cfg(test)]

use std::fs;
use std::path::Path;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_NOTYPE: u8 = 0;
const STT_FUNC: u8 = 2;
const SHN_UNDEF: u16 = 0;
const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHF_ALLOC: u32 = 0x2;
const SHF_EXECINSTR: u32 = 0x4;
const SHF_WRITE: u32 = 0x1;

struct StrTab {
    bytes: Vec<u8>,
}

impl StrTab {
    fn new() -> Self {
        StrTab { bytes: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        off
    }
}

fn shdr(
    name: u32,
    ty: u32,
    flags: u32,
    offset: u32,
    size: u32,
    link: u32,
    info: u32,
    align: u32,
    entsize: u32,
) -> Vec<u8> {
    let mut v = Vec::with_capacity(40);
    v.extend_from_slice(&name.to_le_bytes());
    v.extend_from_slice(&ty.to_le_bytes());
    v.extend_from_slice(&flags.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes()); // sh_addr
    v.extend_from_slice(&offset.to_le_bytes());
    v.extend_from_slice(&size.to_le_bytes());
    v.extend_from_slice(&link.to_le_bytes());
    v.extend_from_slice(&info.to_le_bytes());
    v.extend_from_slice(&align.to_le_bytes());
    v.extend_from_slice(&entsize.to_le_bytes());
    v
}

fn sym(name: u32, value: u32, info: u8, shndx: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(16);
    v.extend_from_slice(&name.to_le_bytes());
    v.extend_from_slice(&value.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes()); // st_size
    v.push(info);
    v.push(0); // st_other
    v.extend_from_slice(&shndx.to_le_bytes());
    v
}

/// Writes a minimal ET_REL ELF32/LE/EM_386 object at `path` exporting the
/// given `(name, is_global, is_func)` symbols out of `.text`, plus one
/// undefined symbol per entry of `undefined`.
pub fn write_elf32(path: &Path, exported: &[(&str, bool, bool)], undefined: &[&str]) {
    let mut shstrtab = StrTab::new();
    let mut strtab = StrTab::new();

    let name_text = shstrtab.add(".text");
    let name_symtab = shstrtab.add(".symtab");
    let name_strtab = shstrtab.add(".strtab");
    let name_shstrtab = shstrtab.add(".shstrtab");

    let text_content = vec![0x90u8; 4];

    let mut symtab = Vec::new();
    symtab.extend_from_slice(&sym(0, 0, 0, 0)); // null symbol
    for (name, is_global, is_func) in exported {
        let n = strtab.add(name);
        let bind = if *is_global { STB_GLOBAL } else { STB_LOCAL };
        let ty = if *is_func { STT_FUNC } else { STT_NOTYPE };
        symtab.extend_from_slice(&sym(n, 0, (bind << 4) | ty, 1));
    }
    for name in undefined {
        let n = strtab.add(name);
        symtab.extend_from_slice(&sym(n, 0, (STB_GLOBAL << 4) | STT_NOTYPE, SHN_UNDEF));
    }
    let num_local = 1u32; // only the null symbol is local

    // Layout: ELF header (52) | .text | .symtab | .strtab | .shstrtab | shdrs
    let ehdr_size = 52u32;
    let text_off = ehdr_size;
    let symtab_off = text_off + text_content.len() as u32;
    let strtab_off = symtab_off + symtab.len() as u32;
    let shstrtab_off = strtab_off + strtab.bytes.len() as u32;
    let shdr_off = shstrtab_off + shstrtab.bytes.len() as u32;

    // Section indices: 0 NULL, 1 .text, 2 .symtab, 3 .strtab, 4 .shstrtab
    let mut shdrs = Vec::new();
    shdrs.extend_from_slice(&shdr(0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0));
    shdrs.extend_from_slice(&shdr(
        name_text,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        text_off,
        text_content.len() as u32,
        0,
        0,
        4,
        0,
    ));
    shdrs.extend_from_slice(&shdr(
        name_symtab,
        SHT_SYMTAB,
        0,
        symtab_off,
        symtab.len() as u32,
        3, // link to .strtab
        num_local,
        4,
        16,
    ));
    shdrs.extend_from_slice(&shdr(
        name_strtab,
        SHT_STRTAB,
        0,
        strtab_off,
        strtab.bytes.len() as u32,
        0,
        0,
        1,
        0,
    ));
    shdrs.extend_from_slice(&shdr(
        name_shstrtab,
        SHT_STRTAB,
        0,
        shstrtab_off,
        shstrtab.bytes.len() as u32,
        0,
        0,
        1,
        0,
    ));
    let _ = SHF_WRITE;

    let mut ehdr = Vec::with_capacity(52);
    ehdr.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    ehdr.extend_from_slice(&[0u8; 8]); // padding
    ehdr.extend_from_slice(&1u16.to_le_bytes()); // e_type = ET_REL
    ehdr.extend_from_slice(&3u16.to_le_bytes()); // e_machine = EM_386
    ehdr.extend_from_slice(&1u32.to_le_bytes()); // e_version
    ehdr.extend_from_slice(&0u32.to_le_bytes()); // e_entry
    ehdr.extend_from_slice(&0u32.to_le_bytes()); // e_phoff
    ehdr.extend_from_slice(&shdr_off.to_le_bytes()); // e_shoff
    ehdr.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    ehdr.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
    ehdr.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    ehdr.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    ehdr.extend_from_slice(&40u16.to_le_bytes()); // e_shentsize
    ehdr.extend_from_slice(&5u16.to_le_bytes()); // e_shnum
    ehdr.extend_from_slice(&4u16.to_le_bytes()); // e_shstrndx

    let mut out = Vec::new();
    out.extend_from_slice(&ehdr);
    out.extend_from_slice(&text_content);
    out.extend_from_slice(&symtab);
    out.extend_from_slice(&strtab.bytes);
    out.extend_from_slice(&shstrtab.bytes);
    out.extend_from_slice(&shdrs);

    fs::write(path, out).expect("write test object");
}
