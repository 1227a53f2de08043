//! C1: the object reader. Opens a relocatable ELF32 object, enumerates its
//! sections and symbols, and classifies symbols as exported or undefined.
//! Addresses are never resolved here on the first pass — they stay zero
//! until the two-pass loader (C6) has relinked the object at its bound
//! address and this module's [`lookup`] is used a second time.

use std::fs;
use std::path::Path;

use goblin::elf::Elf;
use goblin::elf::sym::{STB_GLOBAL, STT_FUNC};

use crate::consts::MAX_SYMBOL_LEN;
use crate::error::{LoaderError, Result};

/// One symbol exported by a component, with its bound address once known.
#[derive(Debug, Clone)]
pub struct ExportedSymbol {
    pub name: String,
    pub addr: u64,
}

/// One symbol a component leaves undefined for some dependency to supply.
#[derive(Debug, Clone)]
pub struct UndefinedSymbol {
    pub name: String,
    pub addr: u64,
    /// Index, within the caller's dependency list, of the exporter — filled
    /// in by the resolver (C4).
    pub exporter_dep: Option<usize>,
    /// Index of the bound symbol within the exporter's `exported` list.
    pub exported_index: Option<usize>,
}

impl UndefinedSymbol {
    fn new(name: String) -> Self {
        UndefinedSymbol {
            name,
            addr: 0,
            exporter_dep: None,
            exported_index: None,
        }
    }
}

/// File offset and size of one canonical section, as seen pre-link.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionInfo {
    pub file_offset: u64,
    pub size: u64,
    pub align: u64,
}

/// The five canonical sections the loader cares about. Any of them may be
/// absent from a given object except `.text`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionLayout {
    pub text: Option<SectionInfo>,
    pub rodata: Option<SectionInfo>,
    pub data: Option<SectionInfo>,
    pub bss: Option<SectionInfo>,
    pub eh_frame: Option<SectionInfo>,
}

fn read_elf(path: &Path) -> Result<(Vec<u8>, ())> {
    let bytes = fs::read(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((bytes, ()))
}

fn parse<'a>(path: &Path, bytes: &'a [u8]) -> Result<Elf<'a>> {
    let elf = Elf::parse(bytes).map_err(|e| LoaderError::Format {
        path: path.to_path_buf(),
        reason: format!("not a supported object: {e}"),
    })?;
    if elf.is_64 {
        return Err(LoaderError::Format {
            path: path.to_path_buf(),
            reason: "expected a 32-bit little-endian ELF relocatable object".into(),
        });
    }
    if !elf.little_endian {
        return Err(LoaderError::Format {
            path: path.to_path_buf(),
            reason: "expected a little-endian object".into(),
        });
    }
    if elf.header.e_type != goblin::elf::header::ET_REL {
        return Err(LoaderError::Format {
            path: path.to_path_buf(),
            reason: "expected a relocatable (ET_REL) object".into(),
        });
    }
    Ok(elf)
}

fn check_symbol_len(path: &Path, name: &str) -> Result<()> {
    // MAX_SYMBOL_LEN is the buffer width including the NUL terminator, so
    // the longest name that actually fits is one byte shorter.
    if name.len() >= MAX_SYMBOL_LEN {
        return Err(LoaderError::Overflow {
            component: path.display().to_string(),
            bound: "symbol name length",
        });
    }
    Ok(())
}

/// Reads a component's exported and undefined symbols. `main` is excluded
/// from the exported set; the caller is responsible for appending the
/// synthetic `cos_comp_info` export.
pub fn read_symbols(path: &Path) -> Result<(Vec<ExportedSymbol>, Vec<UndefinedSymbol>)> {
    let (bytes, ()) = read_elf(path)?;
    let elf = parse(path, &bytes)?;

    let mut exported = Vec::new();
    let mut undefined = Vec::new();

    for sym in elf.syms.iter() {
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("").to_string();
        if name.is_empty() {
            continue;
        }
        check_symbol_len(path, &name)?;

        if sym.st_shndx == goblin::elf::section_header::SHN_UNDEF as usize {
            undefined.push(UndefinedSymbol::new(name));
            continue;
        }

        let is_global = sym.st_bind() == STB_GLOBAL;
        let is_func = sym.st_type() == STT_FUNC;
        if is_global && is_func && name != "main" {
            exported.push(ExportedSymbol { name, addr: 0 });
            if exported.len() > crate::consts::MAX_SYMBOLS - 1 {
                return Err(LoaderError::Overflow {
                    component: path.display().to_string(),
                    bound: "exported symbol count",
                });
            }
        }
    }

    Ok((exported, undefined))
}

fn section_info(elf: &Elf<'_>, name: &str) -> Option<SectionInfo> {
    elf.section_headers.iter().find_map(|shdr| {
        let sec_name = elf.shdr_strtab.get_at(shdr.sh_name)?;
        if sec_name == name {
            Some(SectionInfo {
                file_offset: shdr.sh_offset,
                size: shdr.sh_size,
                align: shdr.sh_addralign.max(1),
            })
        } else {
            None
        }
    })
}

/// Locates the five canonical sections by name. Every section but `.text`
/// may legitimately be absent (a warning is the caller's responsibility to
/// log); a missing `.text` is a hard `FormatError` since such an object
/// cannot export a usable entry point.
pub fn read_section_layout(path: &Path) -> Result<SectionLayout> {
    let (bytes, ()) = read_elf(path)?;
    let elf = parse(path, &bytes)?;

    let text = section_info(&elf, ".text");
    if text.is_none() {
        return Err(LoaderError::Format {
            path: path.to_path_buf(),
            reason: "object has no .text section".into(),
        });
    }

    Ok(SectionLayout {
        text,
        rodata: section_info(&elf, ".rodata"),
        data: section_info(&elf, ".data"),
        bss: section_info(&elf, ".bss"),
        eh_frame: section_info(&elf, ".eh_frame"),
    })
}

/// Looks up the bound address of a symbol in an already-relinked object
/// (used by C6 pass 2 to fill in exported addresses after relinking at the
/// component's assigned window).
pub fn lookup(path: &Path, name: &str) -> Result<Option<u64>> {
    let (bytes, ()) = read_elf(path)?;
    let elf = parse(path, &bytes)?;

    for sym in elf.syms.iter() {
        let sym_name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        if sym_name == name {
            return Ok(Some(sym.st_value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_elf32;

    #[test]
    fn classifies_exported_and_undefined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.o");
        write_elf32(
            &path,
            &[("exported_fn", true, true), ("local_helper", false, true)],
            &["needed_fn"],
        );

        let (exported, undefined) = read_symbols(&path).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].name, "exported_fn");
        assert_eq!(undefined.len(), 1);
        assert_eq!(undefined[0].name, "needed_fn");
    }

    #[test]
    fn rejects_oversized_symbol_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.o");
        let long_name = "x".repeat(MAX_SYMBOL_LEN + 1);
        write_elf32(&path, &[(long_name.as_str(), true, true)], &[]);

        let err = read_symbols(&path).unwrap_err();
        assert!(matches!(err, LoaderError::Overflow { .. }));
    }

    #[test]
    fn accepts_name_at_the_boundary_and_rejects_one_byte_over() {
        let dir = tempfile::tempdir().unwrap();
        let ok_path = dir.path().join("ok.o");
        let ok_name = "x".repeat(MAX_SYMBOL_LEN - 1);
        write_elf32(&ok_path, &[(ok_name.as_str(), true, true)], &[]);
        let (exported, _) = read_symbols(&ok_path).unwrap();
        assert_eq!(exported[0].name.len(), MAX_SYMBOL_LEN - 1);

        let bad_path = dir.path().join("bad.o");
        let bad_name = "x".repeat(MAX_SYMBOL_LEN);
        write_elf32(&bad_path, &[(bad_name.as_str(), true, true)], &[]);
        let err = read_symbols(&bad_path).unwrap_err();
        assert!(matches!(err, LoaderError::Overflow { .. }));
    }

    #[test]
    fn excludes_main_from_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.o");
        write_elf32(&path, &[("main", true, true)], &[]);

        let (exported, _) = read_symbols(&path).unwrap();
        assert!(exported.is_empty());
    }
}
