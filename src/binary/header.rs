//! Top-level graph binary header (`SPEC_FULL.md` §6 "Graph binary").

use bit_field::BitField;

/// 16-byte identifier every graph binary opens with. The first bytes decide
/// which `GraphVersion` the rest of the header is read as.
pub const IDENT_LEN: usize = 16;

const TEXT_MAGIC: &[u8] = b"AIPU_NN\0";
const ELF_MAGIC: &[u8] = &[0x7f, b'E', b'L', b'F'];

/// Graph container format. Only these two are accepted; anything else is
/// `BinError::UnknownBin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphVersion {
    V0005,
    ElfV0,
}

impl GraphVersion {
    pub fn detect(ident: &[u8]) -> Option<GraphVersion> {
        if ident.starts_with(TEXT_MAGIC) {
            Some(GraphVersion::V0005)
        } else if ident.starts_with(ELF_MAGIC) {
            Some(GraphVersion::ElfV0)
        } else {
            None
        }
    }
}

/// The set of graph versions this driver knows how to build a job from.
/// Anything outside this set is `BinError::GversionUnsupported`.
pub fn is_supported_graph_version(version: u32) -> bool {
    matches!(version >> 24, 0x05) || version == 0
}

/// `device` word: packed `arch`/`version`/`config`/`revision` nibbles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwIdent {
    pub arch: u8,
    pub version: u8,
    pub config: u8,
    pub revision: u8,
}

impl HwIdent {
    pub fn from_device_word(word: u32) -> HwIdent {
        HwIdent {
            arch: word.get_bits(24..32) as u8,
            version: word.get_bits(16..24) as u8,
            config: word.get_bits(8..16) as u8,
            revision: word.get_bits(0..8) as u8,
        }
    }
}

bitflags::bitflags! {
    /// Header flag bits (`SPEC_FULL.md` §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const ASID_EN  = 1 << 4;
        const REMAP_EN = 1 << 8;
        const SRAM_EN  = 1 << 12;
    }
}

impl HeaderFlags {
    /// Bits `0..=3`: the ASID index the feature-map region should use.
    pub fn asid(self) -> u8 {
        (self.bits() & 0xF) as u8
    }
}

/// Fixed top header, little-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub magic: [u8; 8],
    pub device: u32,
    pub version: u32,
    pub build_version: u32,
    pub header_size: u32,
    pub file_size: u32,
    pub type_: u32,
    pub flag: u32,
}

impl Header {
    pub const ENCODED_LEN: usize = 8 + 4 * 6;

    pub fn graph_version(&self) -> u32 {
        self.version >> 24
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flag)
    }

    pub fn hw_ident(&self) -> HwIdent {
        HwIdent::from_device_word(self.device)
    }
}
