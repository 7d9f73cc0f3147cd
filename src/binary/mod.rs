//! Graph binary reader (`SPEC_FULL.md` §4.1).
//!
//! Validates the 16-byte identifier and top header, then produces typed,
//! zero-copy views over each named section. The reader never allocates
//! beyond taking ownership of the input bytes; everything else is an
//! `{offset, size}` pair resolved lazily against that buffer, the same way
//! the teacher crate's `standard` types wrap opaque core handles rather than
//! copying driver-owned memory.

pub mod header;

use thiserror::Error;

pub use header::{GraphVersion, Header, HeaderFlags, HwIdent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BinError {
    #[error("graph binary too short to contain a header")]
    Truncated,
    #[error("unrecognized graph binary identifier")]
    UnknownBin,
    #[error("unsupported graph version {0}")]
    GversionUnsupported(u32),
    #[error("graph binary is corrupt: {0}")]
    InvalidBin(String),
}

/// A named section's location within the binary's byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionView {
    pub offset: usize,
    pub size: usize,
}

impl SectionView {
    pub fn empty() -> SectionView {
        SectionView { offset: 0, size: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Every named section a v3.1 graph binary may carry. Weight sections are
/// numbered `.weight0..n` and stored as a `Vec` in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SectionTable {
    pub text: SectionView,
    pub rodata: SectionView,
    pub dcr: SectionView,
    pub weights: Vec<SectionView>,
    pub bss: SectionView,
    pub remap: SectionView,
    pub gmconfig: SectionView,
    pub segmmu: SectionView,
    pub globalparam: SectionView,
}

impl Default for SectionView {
    fn default() -> SectionView {
        SectionView::empty()
    }
}

/// The parsed, validated graph binary: owned bytes plus the section table
/// resolved against them.
#[derive(Debug, Clone)]
pub struct RawBinary {
    data: Vec<u8>,
    pub graph_version: GraphVersion,
    pub header: Header,
    pub sections: SectionTable,
}

impl RawBinary {
    pub fn section(&self, view: SectionView) -> &[u8] {
        &self.data[view.offset..view.offset + view.size]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// One section-table entry as laid out on disk: a 16-byte name, a `u32`
/// offset, and a `u32` size.
struct RawSectionEntry {
    name: [u8; 16],
    offset: u32,
    size: u32,
}

const SECTION_ENTRY_LEN: usize = 16 + 4 + 4;

fn read_u32_le(data: &[u8], at: usize) -> Result<u32, BinError> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .ok_or(BinError::Truncated)?
        .try_into()
        .map_err(|_| BinError::Truncated)?;
    Ok(u32::from_le_bytes(bytes))
}

fn parse_header(data: &[u8]) -> Result<(GraphVersion, Header), BinError> {
    if data.len() < header::IDENT_LEN {
        return Err(BinError::Truncated);
    }
    let graph_version = GraphVersion::detect(&data[..header::IDENT_LEN])
        .ok_or(BinError::UnknownBin)?;

    if data.len() < Header::ENCODED_LEN {
        return Err(BinError::Truncated);
    }
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&data[0..8]);
    let header = Header {
        magic,
        device: read_u32_le(data, 8)?,
        version: read_u32_le(data, 12)?,
        build_version: read_u32_le(data, 16)?,
        header_size: read_u32_le(data, 20)?,
        file_size: read_u32_le(data, 24)?,
        type_: read_u32_le(data, 28)?,
        flag: read_u32_le(data, 32)?,
    };

    let gv = header.graph_version();
    if !header::is_supported_graph_version(gv) {
        return Err(BinError::GversionUnsupported(gv));
    }

    Ok((graph_version, header))
}

fn parse_section_table(data: &[u8], start: usize) -> Result<SectionTable, BinError> {
    let count = read_u32_le(data, start)? as usize;
    let mut cursor = start + 4;
    let mut table = SectionTable::default();

    for _ in 0..count {
        let entry = parse_section_entry(data, cursor)?;
        cursor += SECTION_ENTRY_LEN;

        let view = SectionView {
            offset: entry.offset as usize,
            size: entry.size as usize,
        };
        if view.offset + view.size > data.len() {
            return Err(BinError::InvalidBin("section out of range".into()));
        }

        let name = trimmed_name(&entry.name);
        match name {
            ".text" => table.text = view,
            ".rodata" => table.rodata = view,
            ".dcr" => table.dcr = view,
            ".bss" => table.bss = view,
            ".remap" => table.remap = view,
            ".note.aipu.gmconfig" => table.gmconfig = view,
            ".note.aipu.segmmu" => table.segmmu = view,
            ".note.aipu.globalparam" => table.globalparam = view,
            n if n.starts_with(".weight") => table.weights.push(view),
            _ => {}
        }
    }

    Ok(table)
}

fn parse_section_entry(data: &[u8], at: usize) -> Result<RawSectionEntry, BinError> {
    let name_bytes = data.get(at..at + 16).ok_or(BinError::Truncated)?;
    let mut name = [0u8; 16];
    name.copy_from_slice(name_bytes);
    Ok(RawSectionEntry {
        name,
        offset: read_u32_le(data, at + 16)?,
        size: read_u32_le(data, at + 20)?,
    })
}

fn trimmed_name(name: &[u8; 16]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    std::str::from_utf8(&name[..end]).unwrap_or("")
}

/// Reads and validates a graph binary, producing a [`RawBinary`] ready for
/// [`crate::parser`] to walk.
pub fn parse(data: Vec<u8>) -> Result<RawBinary, BinError> {
    let (graph_version, header) = parse_header(&data)?;
    let sections = parse_section_table(&data, header.header_size as usize)?;

    Ok(RawBinary { data, graph_version, header, sections })
}
