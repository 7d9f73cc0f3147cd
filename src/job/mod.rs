//! Job construction (`SPEC_FULL.md` §4.5) — the core of this driver.
//!
//! A [`Job`] owns every buffer allocated for one run of a [`crate::graph::Graph`]:
//! the rodata/descriptor copies, the TCB chain, per-subgraph stacks and
//! private-data buffers, the shared reuse buffers, the GM buffer, the printf
//! fifo, and (when dynamic shape is active) the model-global-param buffer.
//! `destroy()` returns every one of them to the [`crate::mem::MemoryManager`].

mod builder;
mod segmmu;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::graph::{Graph, JobToken};
use crate::mem::{BufferDesc, MemError, MemoryManager};
use crate::tcb::TcbRecord;

pub use builder::AllocPlan;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error("precursor group id {0} exceeds 0x7FFF")]
    InvalidPrecursor(i32),
    #[error("subgraph has an invalid precursor_cnt")]
    InvalidPrecursorCnt,
    #[error("tensor {0} is configured as both a dma-buf input and an output")]
    DmabufSharedIo(u32),
    #[error("segmmu seg_idx {seg_idx} or ctrl_idx {ctrl_idx} out of range")]
    InvalidSegMmuIndex { seg_idx: usize, ctrl_idx: usize },
    #[error("segmmu core_mask must not be zero")]
    InvalidSegMmuCoreMask,
    #[error("operation not valid in job state {0:?}")]
    InvalidState(JobState),
    #[error(transparent)]
    Shape(#[from] crate::dynshape::ShapeError),
}

/// Job lifecycle (`SPEC_FULL.md` §3 "Job"): `CREATED -> INIT -> SCHED ->
/// DONE | EXCEPTION`, or `INIT -> BIND` for a deferred `debugger_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Init,
    Bind,
    Sched,
    Done,
    Exception,
}

/// Per-job configuration, built with the teacher crate's builder idiom
/// (`ContextBuilder`, `BufferBuilder`, ...): optional fields with sensible
/// defaults, consumed by `Graph::create_job`.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub partition: u8,
    pub qos: u8,
    pub enable_printf: bool,
    pub enable_profiler: bool,
    /// Dynamic input shapes, keyed by input tensor id (`SPEC_FULL.md` §4.7).
    pub input_shapes: HashMap<u32, Vec<u32>>,
    /// Imported dma-buf physical addresses, keyed by input tensor id.
    pub dmabuf_inputs: HashMap<u32, u64>,
    /// Tensor ids configured as outputs, used only to detect a dma-buf
    /// input simultaneously used as an output (`DMABUF_SHARED_IO`).
    pub output_tensor_ids: HashSet<u32>,
    /// Forces every reuse section in this set, and anything GM-backed, onto
    /// the scatter path (`SPEC_FULL.md` §4.5.1 "hybrid" policy).
    pub fm_idxes: HashSet<usize>,
    pub fm_mem_region: Option<crate::mem::Asid>,
}

impl JobConfig {
    pub fn new() -> JobConfig {
        JobConfig::default()
    }

    /// Like [`JobConfig::new`], but defaults `partition` to `UMD_PART_MODE`
    /// (`SPEC_FULL.md` §6 "Environment variables") instead of `0`. Still
    /// overridable with `.partition(..)`.
    pub fn from_env() -> JobConfig {
        JobConfig { partition: partition_mode_from_env(), ..JobConfig::default() }
    }

    pub fn partition(mut self, partition: u8) -> JobConfig {
        self.partition = partition;
        self
    }

    pub fn qos(mut self, qos: u8) -> JobConfig {
        self.qos = qos;
        self
    }

    pub fn enable_printf(mut self, enable: bool) -> JobConfig {
        self.enable_printf = enable;
        self
    }

    pub fn input_shape(mut self, tensor_id: u32, dims: Vec<u32>) -> JobConfig {
        self.input_shapes.insert(tensor_id, dims);
        self
    }

    pub fn dmabuf_input(mut self, tensor_id: u32, pa: u64) -> JobConfig {
        self.dmabuf_inputs.insert(tensor_id, pa);
        self
    }

    fn validate(&self) -> Result<(), JobError> {
        for id in self.dmabuf_inputs.keys() {
            if self.output_tensor_ids.contains(id) {
                return Err(JobError::DmabufSharedIo(*id));
            }
        }
        Ok(())
    }
}

/// Per-subgraph-task buffers: one stack and one private-data buffer region
/// per task, plus the subgraph's private "reuse" accumulator slot
/// (`SPEC_FULL.md` §3 "Job").
#[derive(Debug)]
pub struct SubGraphTask {
    pub stack: BufferDesc,
    pub private_data: Vec<BufferDesc>,
}

/// A job's fully built state: every buffer allocated during `init()`, the
/// relocated rodata, and the backed-up TCB chain ready for (re)submission.
pub struct Job<'g> {
    pub graph: &'g Graph,
    token: Arc<JobToken>,
    mem: Arc<MemoryManager>,
    pub config: JobConfig,
    state: JobState,

    pub rodata_buf: BufferDesc,
    pub rodata_bytes: Vec<u8>,
    pub descriptor_buf: Option<BufferDesc>,
    pub tcb_buf: BufferDesc,
    pub tcb_records: Vec<TcbRecord>,
    pub subgraph_tasks: Vec<SubGraphTask>,
    /// Reuse buffers shared by every subgraph of the same BSS bucket,
    /// keyed by `bss_idx`.
    pub reuse_buffers: HashMap<usize, Vec<BufferDesc>>,
    pub gm_buffer: Option<BufferDesc>,
    pub printf_fifo: Option<BufferDesc>,
    pub globalparam_buf: Option<BufferDesc>,
    pub alloc_plan: AllocPlan,
    pub start_group_id: u16,
    pub grid_id: u16,
    pub command_pool_id: Option<u8>,
    /// Resolved output sizes discovered after completion
    /// (`SPEC_FULL.md` §4.7), keyed by output-shape tensor id.
    pub resolved_output_sizes: HashMap<u32, u32>,

    allocated: Vec<BufferDesc>,
}

impl<'g> Job<'g> {
    pub fn id(&self) -> u64 {
        self.token.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
        *self.token.state.lock().unwrap() = state;
    }

    /// Builds a job from `graph`: runs the allocation plan, relocates
    /// rodata, and constructs the TCB chain. On any failure every buffer
    /// allocated so far is returned to `mem` before the error propagates
    /// (`SPEC_FULL.md` §7: "any failure unwinds previously-allocated
    /// buffers").
    pub fn init(
        graph: &'g Graph,
        mem: Arc<MemoryManager>,
        config: JobConfig,
        start_group_id: u16,
        grid_id: u16,
    ) -> Result<Job<'g>, JobError> {
        config.validate()?;
        let (_id, token) = graph.register_job();

        let mut guard = builder::InitGuard::new(mem.clone());
        let built = builder::build_job(graph, &mem, &config, start_group_id, grid_id, &mut guard);

        match built {
            Ok(inner) => {
                guard.disarm();
                Ok(Job {
                    graph,
                    token,
                    mem,
                    config,
                    state: JobState::Init,
                    rodata_buf: inner.rodata_buf,
                    rodata_bytes: inner.rodata_bytes,
                    descriptor_buf: inner.descriptor_buf,
                    tcb_buf: inner.tcb_buf,
                    tcb_records: inner.tcb_records,
                    subgraph_tasks: inner.subgraph_tasks,
                    reuse_buffers: inner.reuse_buffers,
                    gm_buffer: inner.gm_buffer,
                    printf_fifo: inner.printf_fifo,
                    globalparam_buf: inner.globalparam_buf,
                    alloc_plan: inner.alloc_plan,
                    start_group_id,
                    grid_id,
                    command_pool_id: None,
                    resolved_output_sizes: HashMap::new(),
                    allocated: inner.allocated,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Re-primes the TCB chain from the host-side backup and re-writes it
    /// to device memory (`SPEC_FULL.md` §4.5.5: "Re-scheduling a job first
    /// restores the chain from backup").
    pub fn restore_tcb_chain(&self) -> Result<(), JobError> {
        let mut offset = 0u64;
        for record in &self.tcb_records {
            let bytes = record.encode();
            self.mem.write(self.tcb_buf.base + offset, &bytes)?;
            offset += crate::tcb::TCB_SIZE as u64;
        }
        Ok(())
    }

    pub fn total_tcb_count(&self) -> usize {
        self.tcb_records.len()
    }

    /// Resolves every dynamic output tensor's shape from the model-global-
    /// param buffer once the job has completed (`SPEC_FULL.md` §4.7). Safe
    /// to call more than once; each call re-reads device memory rather than
    /// trusting a cached value.
    pub fn resolve_output_shapes(&mut self) -> Result<&HashMap<u32, u32>, JobError> {
        let buf = match &self.globalparam_buf {
            Some(buf) => buf.clone(),
            None => return Ok(&self.resolved_output_sizes),
        };
        let mut bytes = vec![0u8; buf.size as usize];
        self.mem.read(buf.base, &mut bytes)?;

        let mut seen_bss = HashSet::new();
        for subgraph in &self.graph.subgraphs {
            if !seen_bss.insert(subgraph.bss_idx) {
                continue;
            }
            let bucket = &self.graph.bss_buckets[subgraph.bss_idx];
            let sizes = crate::dynshape::resolve_output_sizes(&bytes, &bucket.io.outputs_shape)?;
            self.resolved_output_sizes.extend(sizes);
        }
        Ok(&self.resolved_output_sizes)
    }

    /// Releases every buffer this job owns back to the memory manager
    /// (`SPEC_FULL.md` §5 "Resource discipline").
    pub fn destroy(mut self) -> Result<(), JobError> {
        self.release_buffers()?;
        self.state = JobState::Done;
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<(), JobError> {
        for buf in self.allocated.drain(..) {
            self.mem.free(&buf)?;
        }
        Ok(())
    }
}

impl<'g> Drop for Job<'g> {
    fn drop(&mut self) {
        let _ = self.release_buffers();
    }
}

/// Returns the partition selected by `UMD_PART_MODE` ('0', '1', or '2';
/// `SPEC_FULL.md` §6 "Environment variables"), or `0` if unset or not one
/// of those three values.
pub fn partition_mode_from_env() -> u8 {
    parse_partition_mode(std::env::var("UMD_PART_MODE").ok().as_deref())
}

fn parse_partition_mode(raw: Option<&str>) -> u8 {
    match raw {
        Some("0") => 0,
        Some("1") => 1,
        Some("2") => 2,
        _ => 0,
    }
}
