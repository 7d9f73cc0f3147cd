//! SegMMU per-core control table patching (`SPEC_FULL.md` §4.5.4).
//!
//! Each `SectionKind::SegMmu` sub-section found while walking a subgraph's
//! BSS bucket encodes, in its `id` field, which `{seg_idx, ctrl_idx}` slot of
//! the per-core control table should receive the owning reuse buffer's
//! physical address, and which cores (`core_mask`) the entry applies to.

use std::collections::HashMap;

use bit_field::BitField;

use crate::graph::types::{SectionKind, SegMmuConfig};
use crate::graph::Graph;
use crate::mem::BufferDesc;

use super::JobError;

/// Builds one patched [`SegMmuConfig`] per core, per subgraph, seeded from
/// the graph-wide template in `graph.segmmu_configs`: a single shared table
/// when the graph declares `num <= 1` (or nothing), otherwise one table per
/// core indexed directly by core id (`SPEC_FULL.md` §4.5.4).
pub(crate) fn patch_segmmu_configs(
    graph: &Graph,
    reuse_buffers: &HashMap<usize, Vec<BufferDesc>>,
) -> Result<Vec<Vec<SegMmuConfig>>, JobError> {
    let mut out = Vec::with_capacity(graph.subgraphs.len());

    for subgraph in &graph.subgraphs {
        let mut cores: Vec<SegMmuConfig> = if graph.segmmu_configs.len() > 1 {
            graph.segmmu_configs.clone()
        } else {
            vec![graph.segmmu_configs.first().cloned().unwrap_or_else(|| SegMmuConfig::new(1))]
        };
        let shared = cores.len() <= 1;

        let bucket = &graph.bss_buckets[subgraph.bss_idx];
        let views = reuse_buffers.get(&subgraph.bss_idx);

        for section in &bucket.reuse_sections {
            for sub in &section.sub_sections {
                if sub.kind != SectionKind::SegMmu {
                    continue;
                }
                let (seg_idx, ctrl_idx, core_mask) = decode_segmmu_id(sub.id)?;
                if core_mask == 0 {
                    return Err(JobError::InvalidSegMmuCoreMask);
                }

                let pa = views
                    .and_then(|v| v.get(section.slot_index))
                    .map(|b| b.base + sub.offset_in_section_exec as u64)
                    .unwrap_or(0);

                if shared {
                    // A single shared table covers every selected core.
                    patch_one(&mut cores[0], seg_idx, ctrl_idx, pa);
                } else {
                    for core in 0..16u32 {
                        if core_mask & (1 << core) == 0 {
                            continue;
                        }
                        if let Some(cfg) = cores.get_mut(core as usize) {
                            patch_one(cfg, seg_idx, ctrl_idx, pa);
                        }
                    }
                }
            }
        }

        out.push(cores);
    }

    Ok(out)
}

fn patch_one(cfg: &mut SegMmuConfig, seg_idx: usize, ctrl_idx: usize, pa: u64) {
    let existing = cfg.control(seg_idx, ctrl_idx);
    let value = (crate::util::lo(pa) & !0x3FFF) | (existing & 0x3FFF);
    cfg.set_control(seg_idx, ctrl_idx, value);
}

fn decode_segmmu_id(id: u32) -> Result<(usize, usize, u16), JobError> {
    let ctrl_idx = id.get_bits(0..8) as usize;
    let seg_idx = id.get_bits(8..16) as usize;
    let core_mask = id.get_bits(16..32) as u16;
    if seg_idx >= SegMmuConfig::SEGS || ctrl_idx >= SegMmuConfig::CTRLS {
        return Err(JobError::InvalidSegMmuIndex { seg_idx, ctrl_idx });
    }
    Ok((seg_idx, ctrl_idx, core_mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_segmmu_id_unpacks_fields() {
        let id = 1u32 | (2u32 << 8) | (0xFFFFu32 << 16);
        let (seg_idx, ctrl_idx, core_mask) = decode_segmmu_id(id).unwrap();
        assert_eq!(ctrl_idx, 1);
        assert_eq!(seg_idx, 2);
        assert_eq!(core_mask, 0xFFFF);
    }

    #[test]
    fn decode_segmmu_id_rejects_out_of_range_seg_idx() {
        let id = 0u32 | (9u32 << 8) | (1u32 << 16);
        let err = decode_segmmu_id(id).unwrap_err();
        assert!(matches!(err, JobError::InvalidSegMmuIndex { seg_idx: 9, ctrl_idx: 0 }));
    }

    #[test]
    fn patch_segmmu_configs_is_empty_without_segmmu_sections() {
        let graph = crate::graph::Graph {
            hw: Default::default(),
            text: Vec::new(),
            rodata: Vec::new(),
            descriptor: Vec::new(),
            globalparam: Vec::new(),
            weights: Vec::new(),
            bss_buckets: vec![Default::default()],
            subgraphs: vec![crate::graph::types::Subgraph {
                id: 0,
                bss_idx: 0,
                text_offset: 0,
                text_size: 0,
                printfifo_size: 0,
                profiler_buf_size: 0,
                private_data_size: 0,
                warmup_len: 0,
                precursors: crate::graph::types::Precursors::None,
                private_buffers: Vec::new(),
                private_buffers_map: Vec::new(),
            }],
            gm_config: None,
            segmmu_configs: Vec::new(),
            remap_entries: Vec::new(),
            next_job_id: std::sync::atomic::AtomicU64::new(0),
            jobs: std::sync::Mutex::new(Vec::new()),
        };
        let configs = patch_segmmu_configs(&graph, &HashMap::new()).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].len(), 1);
        assert!(configs[0][0].seg_control.iter().all(|&c| c == 0));
    }

    fn graph_with_segmmu_configs(segmmu_configs: Vec<SegMmuConfig>) -> crate::graph::Graph {
        crate::graph::Graph {
            hw: Default::default(),
            text: Vec::new(),
            rodata: Vec::new(),
            descriptor: Vec::new(),
            globalparam: Vec::new(),
            weights: Vec::new(),
            bss_buckets: vec![crate::graph::types::BssBucket::default()],
            subgraphs: vec![crate::graph::types::Subgraph {
                id: 0,
                bss_idx: 0,
                text_offset: 0,
                text_size: 0,
                printfifo_size: 0,
                profiler_buf_size: 0,
                private_data_size: 0,
                warmup_len: 0,
                precursors: crate::graph::types::Precursors::None,
                private_buffers: Vec::new(),
                private_buffers_map: Vec::new(),
            }],
            gm_config: None,
            segmmu_configs,
            remap_entries: Vec::new(),
            next_job_id: std::sync::atomic::AtomicU64::new(0),
            jobs: std::sync::Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn patch_segmmu_configs_fans_a_write_out_across_core_mask_bits() {
        let mut bucket = crate::graph::types::BssBucket::default();
        let sub = crate::graph::types::SubSectionDescriptor {
            kind: SectionKind::SegMmu,
            size: 4,
            id: 0u32 | (1u32 << 8) | (0b101u32 << 16), // ctrl_idx=0 seg_idx=1 core_mask=0b101
            offset_in_section_exec: 0,
            addr_mask: 0xFFFF_FFFF,
            scale: 1.0,
            zero_point: 0,
            data_type: crate::graph::types::DataType::U8,
            offsets_in_ro: Vec::new(),
        };
        bucket.reuse_sections.push(crate::graph::types::SectionDescriptor {
            size: 4,
            align_in_page: 4,
            offset_in_file: 0,
            kind: SectionKind::SegMmu,
            relative_addr: 0,
            load_src: None,
            sub_sections: vec![sub],
            slot_index: 0,
        });

        let mut graph = graph_with_segmmu_configs(vec![SegMmuConfig::new(3); 3]);
        graph.bss_buckets = vec![bucket];

        let mem = crate::mem::MemoryManager::new(0x1000_0000, 1 << 20, 0x2000_0000, 1 << 20);
        let buf = mem.malloc(64, 0, None, crate::mem::ASID0).unwrap();
        let mut reuse_buffers: HashMap<usize, Vec<BufferDesc>> = HashMap::new();
        reuse_buffers.insert(0usize, vec![buf]);

        let configs = patch_segmmu_configs(&graph, &reuse_buffers).unwrap();
        assert_eq!(configs[0].len(), 3);
        // core_mask 0b101 selects cores 0 and 2, not core 1.
        assert_ne!(configs[0][0].control(1, 0), 0);
        assert_eq!(configs[0][1].control(1, 0), 0);
        assert_ne!(configs[0][2].control(1, 0), 0);
    }
}
