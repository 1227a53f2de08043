//! C8: the cobj binary container. Serializes a component's header,
//! section/symbol/capability descriptor tables, and section bodies into
//! the fixed little-endian layout the kernel install adapter (and, for
//! boot-packaged components, the boot image itself) expects; `parse` is
//! the inverse, used to validate round-tripping before concatenating
//! boot-packaged cobjs together.
//!
//! Field layout matches the reference container exactly: every descriptor
//! is a run of packed `u32` fields, header first, then all section
//! descriptors, then all symbol descriptors, then all capability
//! descriptors, then the section bodies themselves. The reference format
//! does not specify where the body region starts beyond "after the
//! descriptor tables"; this implementation rounds that offset up to a
//! cache line so bodies begin on a predictable boundary.

use bitflags::bitflags;

use crate::consts::CACHE_LINE;
use crate::error::{LoaderError, Result};

const HEADER_SIZE: usize = 20;
const SECTION_DESC_SIZE: usize = 16;
const SYMBOL_DESC_SIZE: usize = 8;
const CAP_DESC_SIZE: usize = 24;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const ZEROS = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Undef,
    CompInfo,
    Exported,
}

impl SymbolKind {
    fn as_u32(self) -> u32 {
        match self {
            SymbolKind::Undef => 0,
            SymbolKind::CompInfo => 1,
            SymbolKind::Exported => 2,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SymbolKind::Undef),
            1 => Some(SymbolKind::CompInfo),
            2 => Some(SymbolKind::Exported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectionDesc {
    pub flags: SectionFlags,
    pub offset: u32,
    pub vaddr: u32,
    pub bytes: u32,
}

#[derive(Debug, Clone)]
pub struct SymbolDesc {
    pub kind: SymbolKind,
    pub vaddr: u32,
}

#[derive(Debug, Clone)]
pub struct CapDesc {
    pub cap_off: u32,
    pub dest_id: u32,
    pub fault_num: u32,
    pub sfn: u32,
    pub cstub: u32,
    pub sstub: u32,
}

/// One section's placed bytes, or a pure zero-fill region (bss).
#[derive(Debug, Clone)]
pub enum SectionBody {
    Bytes(Vec<u8>),
    Zeros(u32),
}

impl SectionBody {
    fn len(&self) -> u32 {
        match self {
            SectionBody::Bytes(b) => b.len() as u32,
            SectionBody::Zeros(n) => *n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cobj {
    pub id: u32,
    pub sections: Vec<SectionDesc>,
    pub symbols: Vec<SymbolDesc>,
    pub caps: Vec<CapDesc>,
    pub bodies: Vec<SectionBody>,
}

fn round_up(n: u32, align: u32) -> u32 {
    (n + align - 1) & !(align - 1)
}

impl Cobj {
    /// Builds a cobj from its component parts, computing section offsets
    /// within the body region in the order the sections are given.
    pub fn build(
        id: u32,
        sections: Vec<(SectionFlags, u32, SectionBody)>,
        symbols: Vec<SymbolDesc>,
        caps: Vec<CapDesc>,
    ) -> Self {
        let content_start = round_up(
            (HEADER_SIZE
                + sections.len() * SECTION_DESC_SIZE
                + symbols.len() * SYMBOL_DESC_SIZE
                + caps.len() * CAP_DESC_SIZE) as u32,
            CACHE_LINE as u32,
        );

        let mut descs = Vec::with_capacity(sections.len());
        let mut bodies = Vec::with_capacity(sections.len());
        let mut cursor = content_start;
        for (flags, vaddr, body) in sections {
            let bytes = body.len();
            descs.push(SectionDesc {
                flags,
                offset: cursor,
                vaddr,
                bytes,
            });
            cursor += bytes;
            bodies.push(body);
        }

        Cobj {
            id,
            sections: descs,
            symbols,
            caps,
            bodies,
        }
    }

    fn content_start(&self) -> u32 {
        self.sections.first().map(|s| s.offset).unwrap_or(round_up(
            (HEADER_SIZE
                + self.sections.len() * SECTION_DESC_SIZE
                + self.symbols.len() * SYMBOL_DESC_SIZE
                + self.caps.len() * CAP_DESC_SIZE) as u32,
            CACHE_LINE as u32,
        ))
    }

    pub fn total_size(&self) -> u32 {
        self.content_start() + self.bodies.iter().map(SectionBody::len).sum::<u32>()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size() as usize);

        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.sections.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.symbols.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.caps.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.total_size().to_le_bytes());

        for s in &self.sections {
            out.extend_from_slice(&s.flags.bits().to_le_bytes());
            out.extend_from_slice(&s.offset.to_le_bytes());
            out.extend_from_slice(&s.vaddr.to_le_bytes());
            out.extend_from_slice(&s.bytes.to_le_bytes());
        }
        for s in &self.symbols {
            out.extend_from_slice(&s.kind.as_u32().to_le_bytes());
            out.extend_from_slice(&s.vaddr.to_le_bytes());
        }
        for c in &self.caps {
            out.extend_from_slice(&c.cap_off.to_le_bytes());
            out.extend_from_slice(&c.dest_id.to_le_bytes());
            out.extend_from_slice(&c.fault_num.to_le_bytes());
            out.extend_from_slice(&c.sfn.to_le_bytes());
            out.extend_from_slice(&c.cstub.to_le_bytes());
            out.extend_from_slice(&c.sstub.to_le_bytes());
        }

        out.resize(self.content_start() as usize, 0);
        for (desc, body) in self.sections.iter().zip(&self.bodies) {
            debug_assert_eq!(out.len() as u32, desc.offset);
            match body {
                SectionBody::Bytes(b) => out.extend_from_slice(b),
                SectionBody::Zeros(n) => out.resize(out.len() + *n as usize, 0),
            }
        }

        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let fail = |reason: &str| LoaderError::Format {
            path: "<cobj>".into(),
            reason: reason.to_string(),
        };
        if bytes.len() < HEADER_SIZE {
            return Err(fail("cobj truncated before header"));
        }
        let u32_at = |off: usize| -> u32 {
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
        };

        let id = u32_at(0);
        let nsect = u32_at(4) as usize;
        let nsymb = u32_at(8) as usize;
        let ncap = u32_at(12) as usize;
        let total_size = u32_at(16) as usize;
        if bytes.len() < total_size {
            return Err(fail("cobj shorter than declared size"));
        }

        let mut cursor = HEADER_SIZE;
        let mut sections = Vec::with_capacity(nsect);
        for _ in 0..nsect {
            if cursor + SECTION_DESC_SIZE > bytes.len() {
                return Err(fail("cobj truncated in section table"));
            }
            let flags = u32_at(cursor);
            let offset = u32_at(cursor + 4);
            let vaddr = u32_at(cursor + 8);
            let sect_bytes = u32_at(cursor + 12);
            sections.push(SectionDesc {
                flags: SectionFlags::from_bits_truncate(flags),
                offset,
                vaddr,
                bytes: sect_bytes,
            });
            cursor += SECTION_DESC_SIZE;
        }

        let mut symbols = Vec::with_capacity(nsymb);
        for _ in 0..nsymb {
            if cursor + SYMBOL_DESC_SIZE > bytes.len() {
                return Err(fail("cobj truncated in symbol table"));
            }
            let kind = SymbolKind::from_u32(u32_at(cursor))
                .ok_or_else(|| fail("unknown symbol kind in cobj"))?;
            let vaddr = u32_at(cursor + 4);
            symbols.push(SymbolDesc { kind, vaddr });
            cursor += SYMBOL_DESC_SIZE;
        }

        let mut caps = Vec::with_capacity(ncap);
        for _ in 0..ncap {
            if cursor + CAP_DESC_SIZE > bytes.len() {
                return Err(fail("cobj truncated in capability table"));
            }
            caps.push(CapDesc {
                cap_off: u32_at(cursor),
                dest_id: u32_at(cursor + 4),
                fault_num: u32_at(cursor + 8),
                sfn: u32_at(cursor + 12),
                cstub: u32_at(cursor + 16),
                sstub: u32_at(cursor + 20),
            });
            cursor += CAP_DESC_SIZE;
        }

        let mut bodies = Vec::with_capacity(sections.len());
        for s in &sections {
            let start = s.offset as usize;
            let end = start + s.bytes as usize;
            if end > bytes.len() {
                return Err(fail("section body exceeds cobj bounds"));
            }
            if s.flags.contains(SectionFlags::ZEROS) {
                bodies.push(SectionBody::Zeros(s.bytes));
            } else {
                bodies.push(SectionBody::Bytes(bytes[start..end].to_vec()));
            }
        }

        Ok(Cobj {
            id,
            sections,
            symbols,
            caps,
            bodies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let cobj = Cobj::build(
            7,
            vec![
                (SectionFlags::READ, 0x1000, SectionBody::Bytes(vec![1, 2, 3, 4])),
                (
                    SectionFlags::READ | SectionFlags::WRITE,
                    0x2000,
                    SectionBody::Bytes(vec![9, 9]),
                ),
                (
                    SectionFlags::READ | SectionFlags::WRITE | SectionFlags::ZEROS,
                    0x3000,
                    SectionBody::Zeros(64),
                ),
            ],
            vec![
                SymbolDesc {
                    kind: SymbolKind::CompInfo,
                    vaddr: 0x1000,
                },
                SymbolDesc {
                    kind: SymbolKind::Exported,
                    vaddr: 0x1004,
                },
            ],
            vec![CapDesc {
                cap_off: 0,
                dest_id: 2,
                fault_num: crate::consts::FAULT_NUM_NONE,
                sfn: 0x2000,
                cstub: 0x1000,
                sstub: 0x2004,
            }],
        );

        let bytes = cobj.serialize();
        let parsed = Cobj::parse(&bytes).unwrap();

        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.sections.len(), 3);
        assert_eq!(parsed.symbols.len(), 2);
        assert_eq!(parsed.caps.len(), 1);
        assert!(matches!(parsed.bodies[2], SectionBody::Zeros(64)));
        match &parsed.bodies[0] {
            SectionBody::Bytes(b) => assert_eq!(b, &[1, 2, 3, 4]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn rejects_truncated_input() {
        let err = Cobj::parse(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, LoaderError::Format { .. }));
    }

    #[test]
    fn zeros_section_carries_no_bytes_in_the_wire_image() {
        let cobj = Cobj::build(
            1,
            vec![(SectionFlags::WRITE | SectionFlags::ZEROS, 0, SectionBody::Zeros(4096))],
            vec![],
            vec![],
        );
        let bytes = cobj.serialize();
        assert_eq!(bytes.len(), cobj.total_size() as usize);
    }
}
