//! The normalized, in-memory graph (`SPEC_FULL.md` §4.4).
//!
//! Owns every parsed byte view produced by [`crate::binary`] and
//! [`crate::parser`]. Outlives every [`crate::job::Job`] built from it by
//! contract (the design-note resolution for the source driver's cyclic
//! Graph/Job ownership): a `Job` borrows its `Graph` for its whole lifetime
//! rather than sharing ownership, and `Graph` keeps only weak handles to
//! live jobs for enumeration during a global dump.

pub mod types;

use std::sync::{Mutex, Weak};

use thiserror::Error;

use crate::binary::{self, BinError, RawBinary};
use crate::job::JobState;
use crate::parser;
use types::{BssBucket, GmConfig, RemapEntry, SegMmuConfig, Subgraph};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Binary(#[from] BinError),
}

/// A per-BSS weight buffer: the static/weight bytes plus an optional
/// zero-copy-const companion, each keyed to their own ASID1 base
/// (`SPEC_FULL.md` §4.4).
#[derive(Debug, Clone, Default)]
pub struct WeightBuffer {
    pub weight: Vec<u8>,
    pub zerocpy_const: Option<Vec<u8>>,
}

/// A token registered with a [`Graph`] for the lifetime of one
/// [`crate::job::Job`], so the graph can enumerate live jobs for a
/// combined dump without owning them.
pub struct JobToken {
    pub id: u64,
    pub state: Mutex<JobState>,
}

/// The parsed, normalized graph. Shared by reference across every job built
/// from it.
pub struct Graph {
    pub hw: binary::HwIdent,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub descriptor: Vec<u8>,
    pub globalparam: Vec<u8>,
    pub weights: Vec<WeightBuffer>,
    pub bss_buckets: Vec<BssBucket>,
    pub subgraphs: Vec<Subgraph>,
    pub gm_config: Option<GmConfig>,
    pub segmmu_configs: Vec<SegMmuConfig>,
    pub remap_entries: Vec<RemapEntry>,

    pub(crate) next_job_id: std::sync::atomic::AtomicU64,
    pub(crate) jobs: Mutex<Vec<Weak<JobToken>>>,
}

impl Graph {
    /// Parses a raw graph binary into its normalized form. `bss_layout`
    /// tells the parser how many BSS buckets the `.bss` section holds and
    /// where each one starts (this driver's own on-disk convention; see
    /// `DESIGN.md`).
    pub fn load(raw: RawBinary, bss_offsets: &[usize]) -> Result<Graph, GraphError> {
        let hw = raw.header.hw_ident();
        let text = raw.section(raw.sections.text).to_vec();
        let rodata = raw.section(raw.sections.rodata).to_vec();
        let descriptor = raw.section(raw.sections.dcr).to_vec();
        let globalparam = raw.section(raw.sections.globalparam).to_vec();

        let weights = raw
            .sections
            .weights
            .iter()
            .map(|view| WeightBuffer { weight: raw.section(*view).to_vec(), zerocpy_const: None })
            .collect();

        let bss_bytes = raw.section(raw.sections.bss);
        let mut bss_buckets = Vec::with_capacity(bss_offsets.len().max(1));
        let offsets: Vec<usize> = if bss_offsets.is_empty() { vec![0] } else { bss_offsets.to_vec() };
        for (i, &start) in offsets.iter().enumerate() {
            let end = offsets.get(i + 1).copied().unwrap_or(bss_bytes.len());
            bss_buckets.push(parser::parse_bss_section(&bss_bytes[start..end], i)?);
        }

        let remap_entries = if raw.sections.remap.is_empty() {
            Vec::new()
        } else {
            parser::parse_remap_section(raw.section(raw.sections.remap))?
        };

        let subgraphs = if descriptor.is_empty() {
            Vec::new()
        } else {
            parser::parse_subgraph_table(&descriptor)?
        };

        let gm_config = if raw.sections.gmconfig.is_empty() {
            None
        } else {
            Some(parser::parse_gmconfig_section(raw.section(raw.sections.gmconfig))?)
        };

        let segmmu_configs = if raw.sections.segmmu.is_empty() {
            Vec::new()
        } else {
            parser::parse_segmmu_section(raw.section(raw.sections.segmmu))?
        };

        Ok(Graph {
            hw,
            text,
            rodata,
            descriptor,
            globalparam,
            weights,
            bss_buckets,
            subgraphs,
            gm_config,
            segmmu_configs,
            remap_entries,
            next_job_id: std::sync::atomic::AtomicU64::new(0),
            jobs: Mutex::new(Vec::new()),
        })
    }

    /// Registers a new job token for enumeration, returning the id the
    /// caller's `Job` should use.
    pub(crate) fn register_job(&self) -> (u64, std::sync::Arc<JobToken>) {
        use std::sync::atomic::Ordering;
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let token = std::sync::Arc::new(JobToken { id, state: Mutex::new(JobState::Created) });
        self.jobs.lock().unwrap().push(std::sync::Arc::downgrade(&token));
        (id, token)
    }

    /// Live job tokens at the time of the call, for a combined dump
    /// (`SPEC_FULL.md` §4.8).
    pub fn live_jobs(&self) -> Vec<std::sync::Arc<JobToken>> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|w| w.strong_count() > 0);
        jobs.iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn subgraph_count(&self) -> usize {
        self.subgraphs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_raw() -> RawBinary {
        binary::parse(minimal_binary_bytes()).unwrap()
    }

    fn minimal_binary_bytes() -> Vec<u8> {
        let header_size = binary::Header::ENCODED_LEN as u32 + 4;
        let mut data = vec![0u8; header_size as usize];
        data[0..8].copy_from_slice(b"AIPU_NN\0");
        data[12..16].copy_from_slice(&(0x05u32 << 24).to_le_bytes());
        data[20..24].copy_from_slice(&header_size.to_le_bytes());
        data[24..28].copy_from_slice(&(data.len() as u32).to_le_bytes());
        data
    }

    #[test]
    fn load_empty_graph_has_no_subgraphs() {
        let graph = Graph::load(empty_raw(), &[]).unwrap();
        assert_eq!(graph.subgraph_count(), 0);
    }

    #[test]
    fn job_tokens_are_weak_and_drop_with_owner() {
        let graph = Graph::load(empty_raw(), &[]).unwrap();
        {
            let (_id, token) = graph.register_job();
            assert_eq!(graph.live_jobs().len(), 1);
            drop(token);
        }
        assert_eq!(graph.live_jobs().len(), 0);
    }
}
