//! Allocation planning, rodata relocation, and TCB chain construction
//! (`SPEC_FULL.md` §4.5.1-§4.5.5).
//!
//! The source driver unwinds partial allocations with `goto finish` on every
//! failure path. The design-note resolution used here is scoped resource
//! acquisition: [`InitGuard`] owns every buffer allocated so far and frees
//! them on drop unless explicitly disarmed after a fully successful build.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::graph::types::{LoadType, Precursors};
use crate::graph::Graph;
use crate::mem::{BufferDesc, MemoryManager, ASID0, ASID1};
use crate::tcb::{
    self, GridInitFields, GroupInitFields, TaskFields, TcbRecord, DEP_TYPE_GROUP, DEP_TYPE_NONE,
    DEP_TYPE_PRE_ALL, EN_GROUP_DEPEND, END_TYPE_GRID_END, END_TYPE_GROUP_END, GROUP_DEP_MASK,
    GRID_DONE, GRID_GM_FAULT, L2D_FLUSH, TEC_ALL, TEC_SIGNAL,
};
use crate::util::align_page;

use super::{segmmu, JobConfig, JobError, SubGraphTask};

/// Fixed per `SPEC_FULL.md` §4.5.3: four tasks per subgraph in v3.1.
pub const TASKS_PER_SUBGRAPH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPlan {
    Centralized,
    Scatter,
    Hybrid,
}

pub(crate) struct InitGuard {
    mem: Arc<MemoryManager>,
    bufs: Vec<BufferDesc>,
    armed: bool,
}

impl InitGuard {
    pub fn new(mem: Arc<MemoryManager>) -> InitGuard {
        InitGuard { mem, bufs: Vec::new(), armed: true }
    }

    fn track(&mut self, buf: BufferDesc) -> BufferDesc {
        self.bufs.push(buf.clone());
        buf
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        if self.armed {
            for buf in &self.bufs {
                let _ = self.mem.free(buf);
            }
        }
    }
}

pub(crate) struct BuiltJob {
    pub rodata_buf: BufferDesc,
    pub rodata_bytes: Vec<u8>,
    pub descriptor_buf: Option<BufferDesc>,
    pub tcb_buf: BufferDesc,
    pub tcb_records: Vec<TcbRecord>,
    pub subgraph_tasks: Vec<SubGraphTask>,
    pub reuse_buffers: HashMap<usize, Vec<BufferDesc>>,
    pub gm_buffer: Option<BufferDesc>,
    pub printf_fifo: Option<BufferDesc>,
    pub globalparam_buf: Option<BufferDesc>,
    pub alloc_plan: AllocPlan,
    pub allocated: Vec<BufferDesc>,
}

/// Builds the complete working set for a job: allocation, rodata
/// relocation, and the TCB chain, in that order (`SPEC_FULL.md` §4.5).
pub(crate) fn build_job(
    graph: &Graph,
    mem: &Arc<MemoryManager>,
    config: &JobConfig,
    start_group_id: u16,
    grid_id: u16,
    guard: &mut InitGuard,
) -> Result<BuiltJob, JobError> {
    let wants_scatter = config.fm_mem_region.is_some() || !config.fm_idxes.is_empty();

    let weight_bufs = allocate_weight_buffers(graph, mem, guard)?;
    let (reuse_buffers, alloc_plan) = allocate_reuse_buffers(graph, mem, config, wants_scatter, guard)?;
    let subgraph_tasks = allocate_subgraph_buffers(graph, mem, guard)?;

    let mut rodata_bytes = graph.rodata.clone();
    setup_rodata(
        graph,
        &mut rodata_bytes,
        &weight_bufs,
        &reuse_buffers,
        &subgraph_tasks,
        config,
    )?;

    let rodata_buf = guard.track(mem.malloc(
        rodata_bytes.len().max(1) as u64,
        0,
        Some("rodata"),
        ASID0,
    )?);
    mem.write(rodata_buf.base, &rodata_bytes)?;

    let descriptor_buf = if graph.descriptor.is_empty() {
        None
    } else {
        let buf = guard.track(mem.malloc(graph.descriptor.len() as u64, 0, Some("dcr"), ASID0)?);
        mem.write(buf.base, &graph.descriptor)?;
        Some(buf)
    };

    let globalparam_buf = if !config.input_shapes.is_empty() && !graph.globalparam.is_empty() {
        let mut bytes = graph.globalparam.clone();
        crate::dynshape::patch_input_shapes(graph, &mut bytes, config)?;
        let buf = guard.track(mem.malloc(bytes.len() as u64, 0, Some("globalparam"), ASID0)?);
        mem.write(buf.base, &bytes)?;
        Some(buf)
    } else {
        None
    };

    let printf_fifo = if config.enable_printf {
        let size: u32 = graph.subgraphs.iter().map(|s| s.printfifo_size).max().unwrap_or(0);
        if size > 0 {
            Some(guard.track(mem.malloc(size as u64, 0, Some("printf"), ASID0)?))
        } else {
            None
        }
    } else {
        None
    };

    let gm_buffer = match graph.gm_config {
        Some(gm) if gm.size > 0 => {
            Some(guard.track(mem.malloc(gm.size, 0, Some("gm"), ASID0)?))
        }
        _ => None,
    };

    let segmmu_configs = segmmu::patch_segmmu_configs(graph, &reuse_buffers)?;
    let mut segmmu_ctrl = HashMap::new();
    for (i, cores) in segmmu_configs.iter().enumerate() {
        if cores.iter().any(|cfg| cfg.seg_control.iter().any(|&v| v != 0)) {
            let bytes: Vec<u8> = cores
                .iter()
                .flat_map(|cfg| cfg.seg_control.iter().flat_map(|w| w.to_le_bytes()))
                .collect();
            let buf = guard.track(mem.malloc(bytes.len() as u64, 0, Some("segmmu"), ASID0)?);
            mem.write(buf.base, &bytes)?;
            segmmu_ctrl.insert(i, crate::util::lo(buf.base));
        }
    }

    let text_buf = guard.track(mem.malloc(graph.text.len().max(1) as u64, 0, Some("text"), ASID0)?);
    mem.write(text_buf.base, &graph.text)?;

    let tcb_records = build_tcb_chain(
        graph,
        mem,
        config,
        start_group_id,
        grid_id,
        text_buf.base,
        rodata_buf.base,
        descriptor_buf.as_ref().map(|b| b.base),
        &subgraph_tasks,
        &segmmu_ctrl,
        &weight_bufs,
        globalparam_buf.as_ref().map(|b| b.base),
        printf_fifo.as_ref().map(|b| b.base),
        gm_buffer.as_ref(),
    )?;

    let tcb_buf = guard.track(mem.malloc(
        (tcb_records.len() * tcb::TCB_SIZE) as u64,
        0,
        Some("tcb"),
        ASID0,
    )?);
    write_tcb_chain(mem, &tcb_buf, &tcb_records)?;

    Ok(BuiltJob {
        rodata_buf,
        rodata_bytes,
        descriptor_buf,
        tcb_buf,
        tcb_records,
        subgraph_tasks,
        reuse_buffers,
        gm_buffer,
        printf_fifo,
        globalparam_buf,
        alloc_plan,
        allocated: guard.bufs.clone(),
    })
}

fn write_tcb_chain(
    mem: &MemoryManager,
    tcb_buf: &BufferDesc,
    records: &[TcbRecord],
) -> Result<(), JobError> {
    let mut offset = 0u64;
    for record in records {
        mem.write(tcb_buf.base + offset, &record.encode())?;
        offset += tcb::TCB_SIZE as u64;
    }
    Ok(())
}

/// Residency for the graph's static weight bytes. The source driver loads
/// weights once per graph; this driver keeps `Graph::weights` as host bytes
/// and commits them to an ASID1 buffer per job (documented trade-off, see
/// `DESIGN.md`).
fn allocate_weight_buffers(
    graph: &Graph,
    mem: &Arc<MemoryManager>,
    guard: &mut InitGuard,
) -> Result<HashMap<usize, BufferDesc>, JobError> {
    let mut bufs = HashMap::new();
    for (bss_idx, weight) in graph.weights.iter().enumerate() {
        if weight.weight.is_empty() {
            continue;
        }
        let buf = guard.track(mem.malloc(weight.weight.len() as u64, 0, Some("weight"), ASID1)?);
        mem.write(buf.base, &weight.weight)?;
        bufs.insert(bss_idx, buf);
    }
    Ok(bufs)
}

/// §4.5.1 allocation plan for reuse sections: try centralized first, fall
/// back to scatter on exhaustion; pinned sections always scatter.
fn allocate_reuse_buffers(
    graph: &Graph,
    mem: &Arc<MemoryManager>,
    config: &JobConfig,
    force_scatter: bool,
    guard: &mut InitGuard,
) -> Result<(HashMap<usize, Vec<BufferDesc>>, AllocPlan), JobError> {
    let mut reuse_buffers = HashMap::new();
    let mut overall_plan = AllocPlan::Centralized;

    let referenced_bss: Vec<usize> = {
        let mut set: Vec<usize> = graph.subgraphs.iter().map(|s| s.bss_idx).collect();
        set.sort_unstable();
        set.dedup();
        set
    };

    for bss_idx in referenced_bss {
        let bucket = &graph.bss_buckets[bss_idx];
        let pinned: HashSet<usize> = config.fm_idxes.clone();

        let try_centralized = !force_scatter
            && bucket.reuse_sections.iter().all(|s| !pinned.contains(&s.slot_index));

        if try_centralized {
            let total: u64 = bucket.reuse_sections.iter().map(|s| align_page(s.size as u64)).sum();
            if let Ok(owner) = mem.malloc(total.max(1), 0, Some("tot_reuse"), ASID0) {
                guard.track(owner.clone());
                let mut offset = 0u64;
                let mut views = Vec::with_capacity(bucket.reuse_sections.len());
                for section in &bucket.reuse_sections {
                    let size = align_page(section.size as u64);
                    views.push(owner.view(offset, size.max(1)));
                    offset += size;
                }
                reuse_buffers.insert(bss_idx, views);
                continue;
            }
            overall_plan = AllocPlan::Scatter;
        } else {
            overall_plan = AllocPlan::Hybrid;
        }

        // Scatter (or hybrid) path: one allocation per reuse section.
        let mut views = Vec::with_capacity(bucket.reuse_sections.len());
        for section in &bucket.reuse_sections {
            let asid = if pinned.contains(&section.slot_index) {
                config.fm_mem_region.unwrap_or(ASID0)
            } else {
                ASID0
            };
            let buf = guard.track(mem.malloc(section.size.max(1) as u64, 0, None, asid)?);
            views.push(buf);
        }
        reuse_buffers.insert(bss_idx, views);
    }

    Ok((reuse_buffers, overall_plan))
}

/// Stacks (scatter-allocated per subgraph) and private-data buffers
/// (centralized, reset at `PRE_ALL` barriers, `SPEC_FULL.md` §4.5.1).
fn allocate_subgraph_buffers(
    graph: &Graph,
    mem: &Arc<MemoryManager>,
    guard: &mut InitGuard,
) -> Result<Vec<SubGraphTask>, JobError> {
    // First pass: compute the peak private-buffer footprint across
    // PRE_ALL-delimited chains so a single `tot_priv` buffer can be shared.
    let mut chain_offset = 0u64;
    let mut peak = 0u64;
    for subgraph in &graph.subgraphs {
        for pb in &subgraph.private_buffers {
            chain_offset += align_page(pb.size as u64);
        }
        peak = peak.max(chain_offset);
        if subgraph.precursors == Precursors::PreAll {
            chain_offset = 0;
        }
    }

    let tot_priv = if peak > 0 {
        Some(guard.track(mem.malloc(peak, 0, Some("tot_priv"), ASID0)?))
    } else {
        None
    };

    let mut tasks = Vec::with_capacity(graph.subgraphs.len());
    let mut chain_offset = 0u64;
    for subgraph in &graph.subgraphs {
        let bucket = &graph.bss_buckets[subgraph.bss_idx];
        let stack_size = (bucket.stack_size as u64) * TASKS_PER_SUBGRAPH as u64;
        let stack = guard.track(mem.malloc(
            stack_size.max(1),
            bucket.stack_align as u64,
            Some("stack"),
            ASID0,
        )?);

        let mut private_data = Vec::with_capacity(subgraph.private_buffers.len());
        if let Some(owner) = &tot_priv {
            for pb in &subgraph.private_buffers {
                let size = align_page(pb.size as u64);
                private_data.push(owner.view(chain_offset, size.max(1)));
                chain_offset += size;
            }
        }
        if subgraph.precursors == Precursors::PreAll {
            chain_offset = 0;
        }

        tasks.push(SubGraphTask { stack, private_data });
    }

    Ok(tasks)
}

/// `setup_rodata` (`SPEC_FULL.md` §4.5.2): patches every parameter
/// relocation entry's resolved physical address into the rodata copy, then
/// patches subgraph-private-buffer addresses via `private_buffers_map`.
fn setup_rodata(
    graph: &Graph,
    rodata: &mut [u8],
    weight_bufs: &HashMap<usize, BufferDesc>,
    reuse_buffers: &HashMap<usize, Vec<BufferDesc>>,
    subgraph_tasks: &[SubGraphTask],
    config: &JobConfig,
) -> Result<(), JobError> {
    let referenced_bss: HashSet<usize> = graph.subgraphs.iter().map(|s| s.bss_idx).collect();

    for &bss_idx in &referenced_bss {
        let bucket = &graph.bss_buckets[bss_idx];
        for entry in &bucket.reloc_entries {
            let pa = match entry.load_type {
                LoadType::Static => {
                    let base = weight_bufs.get(&bss_idx).map(|b| b.base).unwrap_or(0);
                    base + entry.offset_in_section as u64
                }
                LoadType::Reuse => {
                    let slot = entry.buf_index;
                    if let Some(&dma_pa) = dma_override_for_slot(bucket, slot, config) {
                        dma_pa + entry.offset_in_section as u64
                    } else {
                        let views = reuse_buffers.get(&bss_idx);
                        let base = views.and_then(|v| v.get(slot)).map(|b| b.base).unwrap_or(0);
                        base + entry.offset_in_section as u64
                    }
                }
            };
            patch_masked(rodata, entry.offset_in_ro as usize, pa, entry.addr_mask);
        }
    }

    for (subgraph, task) in graph.subgraphs.iter().zip(subgraph_tasks.iter()) {
        for (pb_idx, ro_offset) in subgraph.private_buffers_map.iter().enumerate() {
            if let Some(buf) = task.private_data.get(pb_idx) {
                patch_masked(rodata, *ro_offset as usize, buf.base, u32::MAX);
            }
        }
    }

    Ok(())
}

fn dma_override_for_slot<'c>(
    bucket: &crate::graph::types::BssBucket,
    slot: usize,
    config: &'c JobConfig,
) -> Option<&'c u64> {
    let tensor = bucket
        .io
        .inputs
        .iter()
        .find(|t| t.ref_section_iter == slot)?;
    config.dmabuf_inputs.get(&tensor.id)
}

fn patch_masked(rodata: &mut [u8], offset_in_ro: usize, pa: u64, addr_mask: u32) {
    if offset_in_ro + 4 > rodata.len() {
        return;
    }
    let existing = u32::from_le_bytes(rodata[offset_in_ro..offset_in_ro + 4].try_into().unwrap());
    let patched = (crate::util::lo(pa) & addr_mask) | (existing & !addr_mask);
    rodata[offset_in_ro..offset_in_ro + 4].copy_from_slice(&patched.to_le_bytes());
}

/// Resolves a subgraph's GROUP_INIT dependency flag and `group_deps` table
/// (`SPEC_FULL.md` §4.5.3 "Dependency encoding").
fn resolve_dependency(
    precursors: Precursors,
    start_group_id: u16,
) -> Result<(u32, [u16; 4]), JobError> {
    match precursors {
        Precursors::None => Ok((DEP_TYPE_NONE, [0u16; 4])),
        Precursors::PreAll => Ok((DEP_TYPE_PRE_ALL, [0u16; 4])),
        Precursors::Explicit(raw, count) => {
            let mut deps = [0u16; 4];
            for i in 0..count {
                let p = raw[i];
                if p < 0 || p as u32 > 0x7FFF {
                    return Err(JobError::InvalidPrecursor(p));
                }
                let group = (p as u32 + start_group_id as u32) & GROUP_DEP_MASK as u32;
                deps[i] = EN_GROUP_DEPEND | group as u16;
            }
            Ok((DEP_TYPE_GROUP, deps))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_tcb_chain(
    graph: &Graph,
    mem: &Arc<MemoryManager>,
    config: &JobConfig,
    start_group_id: u16,
    grid_id: u16,
    text_base: u64,
    rodata_base: u64,
    dcr_base: Option<u64>,
    subgraph_tasks: &[SubGraphTask],
    segmmu_ctrl: &HashMap<usize, u32>,
    weight_bufs: &HashMap<usize, BufferDesc>,
    global_param_pa: Option<u64>,
    printf_pa: Option<u64>,
    gm_buffer: Option<&BufferDesc>,
) -> Result<Vec<TcbRecord>, JobError> {
    let asid0_base = mem.get_asid_base(ASID0)?;
    let subgraph_count = graph.subgraphs.len() as u32;
    let mut records = Vec::with_capacity(1 + graph.subgraphs.len() * (1 + TASKS_PER_SUBGRAPH));

    let (gm_ctrl, gm_addr, gm_sync) = match (graph.gm_config, gm_buffer) {
        (Some(gm), Some(buf)) if gm.remap_en => {
            let ctrl = (((gm.size >> 18).saturating_sub(1)) & 0xFF) << 8 | tcb::GM_REMAP_EN as u64;
            let sync = if gm.initial_sync { Some(tcb::DDR_TO_GM) } else { None };
            (Some(ctrl as u32), Some(buf.base), sync)
        }
        _ => (None, None, None),
    };

    records.push(TcbRecord::GridInit {
        end_flags: L2D_FLUSH,
        fields: GridInitFields {
            group_num: subgraph_count,
            grid_interrupt_en: GRID_DONE | GRID_GM_FAULT,
            grid_gridid: grid_id,
            grid_groupid: start_group_id,
            gm_ctrl,
            gm_addr,
            gm_sync,
        },
    });

    for (i, subgraph) in graph.subgraphs.iter().enumerate() {
        let group_id = start_group_id + i as u16;
        let (dep_type, group_deps) = resolve_dependency(subgraph.precursors, start_group_id)?;

        let weight_base = weight_bufs.get(&subgraph.bss_idx).map(|b| b.base).unwrap_or(0);
        let mut asids = [0u32; 8];
        asids[0] = tcb::rdwr_asid_slot(asid0_base);
        asids[1] = tcb::rdwr_asid_slot(asid0_base);
        asids[2] = tcb::rdwr_asid_slot(weight_base);
        asids[3] = tcb::rdwr_asid_slot(weight_base);

        records.push(TcbRecord::GroupInit {
            end_flags: 0,
            fields: GroupInitFields {
                group_gridid: grid_id,
                group_groupid: group_id,
                dep_type,
                group_deps,
                segmmu_ctrl: segmmu_ctrl.get(&i).copied().unwrap_or(0),
                asids,
            },
        });

        let task_buffers = &subgraph_tasks[i];
        for t in 0..TASKS_PER_SUBGRAPH {
            let mut end_flags = 0u32;
            let is_last_task_in_group = t == TASKS_PER_SUBGRAPH - 1;
            let is_last_subgraph = i == graph.subgraphs.len() - 1;
            if is_last_task_in_group {
                end_flags |= END_TYPE_GROUP_END;
            }
            if is_last_task_in_group && is_last_subgraph {
                end_flags |= END_TYPE_GRID_END;
            }

            let stack_pa = task_buffers.stack.base + (t as u64) * (task_buffers.stack.size / TASKS_PER_SUBGRAPH as u64);
            let private_pa = task_buffers.private_data.get(0).map(|b| b.base).unwrap_or(0);

            let tcb_index = 1 + i * (1 + TASKS_PER_SUBGRAPH) + 1 + t;
            let mut interrupt_en = TEC_ALL;
            if config.enable_printf {
                interrupt_en |= TEC_SIGNAL;
            }

            records.push(TcbRecord::Task {
                end_flags,
                fields: TaskFields {
                    groupid: group_id,
                    gridid: grid_id,
                    taskid: t as u8,
                    spc: text_base + subgraph.text_offset as u64,
                    ica_warmup_len: if t == 0 { subgraph.warmup_len } else { 0 },
                    grid_dim: [1, 1, 1],
                    group_dim: [TASKS_PER_SUBGRAPH as u16, 1, 1],
                    group_id: [1, 0, 0],
                    task_id: [t as u16, 0, 0],
                    tcbp: (tcb_index * tcb::TCB_SIZE) as u32,
                    sp: crate::util::lo(stack_pa),
                    pp: crate::util::lo(rodata_base),
                    dp: crate::util::lo(private_pa),
                    cp: crate::util::lo(dcr_base.unwrap_or(rodata_base)),
                    pprofiler: if subgraph.profiler_buf_size > 0 { Some(0) } else { None },
                    pprint: printf_pa.map(crate::util::lo),
                    global_param: if t == 0 { global_param_pa.map(crate::util::lo) } else { None },
                    interrupt_en,
                },
            });
        }
    }

    Ok(records)
}
