//! Multi-ASID region allocator (`SPEC_FULL.md` §4.3).
//!
//! A simple region-based allocator: each ASID owns a contiguous physical
//! range and a free-list. Matches the spec's explicit non-goal of "a generic
//! memory allocator (a simple region-based allocator suffices)".

mod region;

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

use crate::util::{align_page, align_up};
use region::Region;

pub type Asid = u8;

pub const ASID0: Asid = 0; // feature-map / shared
pub const ASID1: Asid = 1; // weight
pub const ASID_MAX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("allocation of {size} bytes in asid {asid} failed: region exhausted")]
    BufAllocFail { asid: Asid, size: u64 },
    #[error("asid {0} is not configured")]
    UnknownAsid(Asid),
    #[error("read/write of {size} bytes at {pa:#x} exceeds the owning region")]
    OutOfRange { pa: u64, size: u64 },
    #[error("failed to open dump file")]
    OpenFileFail,
}

/// A physical memory region (`SPEC_FULL.md` §3 "Buffer descriptor").
///
/// Owns its allocation unless it is a view carved out of a larger buffer, in
/// which case `free` only drops the descriptor and the owner keeps the
/// underlying allocation alive.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub base: u64,
    pub size: u64,
    pub requested_size: u64,
    pub asid_base: u64,
    pub align_asid_pa: u64,
    pub name: Option<String>,
    asid: Asid,
    is_view: bool,
}

impl BufferDesc {
    pub fn asid(&self) -> Asid {
        self.asid
    }

    pub fn is_view(&self) -> bool {
        self.is_view
    }

    /// Carves a sub-view of `size` bytes at `offset` from this buffer.
    /// Dropping the view (via `MemoryManager::free_bufferdesc`) never
    /// returns memory to the allocator; only releasing the owning buffer
    /// does.
    pub fn view(&self, offset: u64, size: u64) -> BufferDesc {
        assert!(offset + size <= self.size, "view exceeds owning buffer");
        BufferDesc {
            base: self.base + offset,
            size,
            requested_size: size,
            asid_base: self.asid_base,
            align_asid_pa: self.align_asid_pa + offset,
            name: None,
            asid: self.asid,
            is_view: true,
        }
    }

    fn fmt_info(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BufferDesc")
            .field("name", &self.name.as_deref().unwrap_or("<unnamed>"))
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("asid", &self.asid)
            .field("is_view", &self.is_view)
            .finish()
    }
}

impl std::fmt::Display for BufferDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_info(f)
    }
}

/// Which named region within an ASID a job wants (`SPEC_FULL.md` §4.3
/// "region=DEFAULT chooses ASID0" plus the GM/custom regions §4.5.1
/// references).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Default,
    Weight,
    Gm,
    Custom(u8),
}

struct AsidState {
    region: Region,
    base: u64,
}

/// The process-wide, mutex-protected region allocator (`SPEC_FULL.md` §5:
/// "all allocations go through a single mutex-protected region allocator").
pub struct MemoryManager {
    asids: Mutex<HashMap<Asid, AsidState>>,
    backing: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemoryManager {
    /// Creates a manager with freshly configured ASID0 and ASID1 regions.
    pub fn new(asid0_base: u64, asid0_size: u64, asid1_base: u64, asid1_size: u64) -> MemoryManager {
        let mut asids = HashMap::new();
        asids.insert(ASID0, AsidState { region: Region::new(asid0_base, asid0_size), base: asid0_base });
        asids.insert(ASID1, AsidState { region: Region::new(asid1_base, asid1_size), base: asid1_base });
        MemoryManager { asids: Mutex::new(asids), backing: Mutex::new(HashMap::new()) }
    }

    /// Like [`MemoryManager::new`], but honors `UMD_ASID_BASE`
    /// (`SPEC_FULL.md` §6 "Environment variables") as an override for
    /// ASID0's base, same as the caller had passed it to `reset_asid_base`.
    pub fn new_from_env(asid0_base: u64, asid0_size: u64, asid1_base: u64, asid1_size: u64) -> MemoryManager {
        MemoryManager::new(asid0_base_override(asid0_base), asid0_size, asid1_base, asid1_size)
    }

    /// Configures an additional ASID (e.g. GM or a custom pinned region).
    pub fn configure_asid(&self, asid: Asid, base: u64, size: u64) {
        let mut asids = self.asids.lock().unwrap();
        asids.insert(asid, AsidState { region: Region::new(base, size), base });
    }

    /// Overrides a region's base before any allocation (`reset_asid_base`,
    /// a debug aid per `SPEC_FULL.md` §4.3).
    pub fn reset_asid_base(&self, asid: Asid, base: u64) -> Result<(), MemError> {
        let mut asids = self.asids.lock().unwrap();
        let state = asids.get_mut(&asid).ok_or(MemError::UnknownAsid(asid))?;
        let size = state.region.capacity();
        state.region = Region::new(base, size);
        state.base = base;
        Ok(())
    }

    pub fn get_asid_base(&self, asid: Asid) -> Result<u64, MemError> {
        let asids = self.asids.lock().unwrap();
        Ok(asids.get(&asid).ok_or(MemError::UnknownAsid(asid))?.base)
    }

    /// `malloc(size, align_in_page, name, asid)`. Align of `0` means page
    /// alignment. Returns `BufAllocFail` on exhaustion; never blocks beyond
    /// the allocator mutex.
    pub fn malloc(
        &self,
        size: u64,
        align_in_page: u64,
        name: Option<&str>,
        asid: Asid,
    ) -> Result<BufferDesc, MemError> {
        let align = if align_in_page == 0 { crate::util::PAGE_SIZE } else { align_in_page };
        let aligned_size = align_page(size);

        let mut asids = self.asids.lock().unwrap();
        let state = asids.get_mut(&asid).ok_or(MemError::UnknownAsid(asid))?;
        let base = state
            .region
            .alloc(aligned_size, align)
            .ok_or(MemError::BufAllocFail { asid, size })?;
        let asid_base = state.base;
        drop(asids);

        self.backing.lock().unwrap().insert(base, vec![0u8; aligned_size as usize]);

        Ok(BufferDesc {
            base,
            size: aligned_size,
            requested_size: size,
            asid_base,
            align_asid_pa: asid_base + align_up(base - asid_base, align),
            name: name.map(String::from),
            asid,
            is_view: false,
        })
    }

    /// Releases an owning allocation. Releasing a view via
    /// `free_bufferdesc` only drops the descriptor.
    pub fn free(&self, buf: &BufferDesc) -> Result<(), MemError> {
        if buf.is_view {
            return Ok(());
        }
        let mut asids = self.asids.lock().unwrap();
        let state = asids.get_mut(&buf.asid).ok_or(MemError::UnknownAsid(buf.asid))?;
        state.region.free(buf.base, buf.size);
        drop(asids);
        self.backing.lock().unwrap().remove(&buf.base);
        Ok(())
    }

    /// Releases a view descriptor without touching the underlying
    /// allocation (the owner frees it independently).
    pub fn free_bufferdesc(&self, _buf: &BufferDesc) {}

    pub fn zeroize(&self, pa: u64, size: u64) -> Result<(), MemError> {
        self.write_raw(pa, &vec![0u8; size as usize])
    }

    pub fn mem_bzero(&self, pa: u64, size: u64) -> Result<(), MemError> {
        self.zeroize(pa, size)
    }

    pub fn write(&self, pa: u64, src: &[u8]) -> Result<(), MemError> {
        self.write_raw(pa, src)
    }

    pub fn read(&self, pa: u64, dst: &mut [u8]) -> Result<(), MemError> {
        let backing = self.backing.lock().unwrap();
        let (base, buf) = find_owning(&backing, pa, dst.len() as u64)?;
        let off = (pa - base) as usize;
        dst.copy_from_slice(&buf[off..off + dst.len()]);
        Ok(())
    }

    fn write_raw(&self, pa: u64, src: &[u8]) -> Result<(), MemError> {
        let mut backing = self.backing.lock().unwrap();
        let (base, buf) = find_owning_mut(&mut backing, pa, src.len() as u64)?;
        let off = (pa - base) as usize;
        buf[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn dump_file(&self, pa: u64, path: &Path, size: u64) -> Result<(), MemError> {
        let mut buf = vec![0u8; size as usize];
        self.read(pa, &mut buf)?;
        let mut file = File::create(path).map_err(|_| MemError::OpenFileFail)?;
        file.write_all(&buf).map_err(|_| MemError::OpenFileFail)?;
        Ok(())
    }
}

fn find_owning(
    backing: &HashMap<u64, Vec<u8>>,
    pa: u64,
    size: u64,
) -> Result<(u64, &Vec<u8>), MemError> {
    for (&base, buf) in backing.iter() {
        if pa >= base && pa + size <= base + buf.len() as u64 {
            return Ok((base, buf));
        }
    }
    Err(MemError::OutOfRange { pa, size })
}

fn find_owning_mut(
    backing: &mut HashMap<u64, Vec<u8>>,
    pa: u64,
    size: u64,
) -> Result<(u64, &mut Vec<u8>), MemError> {
    for (&base, buf) in backing.iter_mut() {
        if pa >= base && pa + size <= base + buf.len() as u64 {
            return Ok((base, buf));
        }
    }
    Err(MemError::OutOfRange { pa, size })
}

/// Returns `UMD_ASID_BASE`'s hex physical-address override for ASID0
/// (`SPEC_FULL.md` §6 "Environment variables"), or `default_base` if the
/// variable is unset or not valid hex.
pub fn asid0_base_override(default_base: u64) -> u64 {
    parse_asid0_base_override(std::env::var("UMD_ASID_BASE").ok().as_deref(), default_base)
}

fn parse_asid0_base_override(raw: Option<&str>, default_base: u64) -> u64 {
    match raw {
        Some(s) => u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap_or(default_base),
        None => default_base,
    }
}
