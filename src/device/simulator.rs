//! In-process simulator backend (`SPEC_FULL.md` §4.6, feature `simulator`).
//!
//! Mirrors the real device's submit-queue-plus-commit-map model
//! (`spec.md` §4.6 "Simulator back end"): each hardware command pool
//! (one per distinct `(partition, qos)`, keyed here by `command_pool_id`)
//! has its own buffer queue and its own one-deep "busy" slot, so a burst of
//! submissions to one pool never blocks or serializes against another pool
//! — only `spec.md`'s "inter-pool order is unspecified" guarantee applies.
//! Within one pool, jobs still dispatch in FIFO order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::mem::MemoryManager;

use super::ids::{CommandPoolRegistry, GridIdAllocator, GroupIdAllocator};
use super::{DeviceBackend, DeviceError, JobDesc, JobStatus};

/// The simulated `TSM_CMD_*` register block a real device programs to
/// submit a TCB chain (`SPEC_FULL.md` §4.6).
const TSM_CMD_SCHED_ADDR_HI: u32 = 0x00;
const TSM_CMD_SCHED_ADDR_LO: u32 = 0x04;
const TSM_CMD_TCB_NUMBER: u32 = 0x08;
const TSM_CMD_SCHED_CTRL: u32 = 0x0C;
/// Readable: bit map of full (busy, one-deep) pools, bit index = pool id
/// (`SPEC_FULL.md` §6 "Command-pool registers").
const TSM_STATUS: u32 = 0x10;
/// Readable: bits 16..19 = `max_cmdpool_count - 1` (`SPEC_FULL.md` §6).
const TSM_BUILD_INFO: u32 = 0x14;
/// Matches `TSM_CMD_SCHED_CTRL`'s 3-bit `pool[16..18]` field.
const MAX_CMD_POOLS: u8 = 8;

#[derive(Default)]
struct Registers {
    sched_addr_hi: u32,
    sched_addr_lo: u32,
    tcb_number: u32,
    sched_ctrl: u32,
}

/// One hardware command pool's buffer queue and in-flight slot
/// (`spec.md` §4.6: "push the job onto a buffer queue... if no batch is
/// currently in flight... pop the head job").
#[derive(Default)]
struct PoolState {
    queue: VecDeque<JobDesc>,
    busy: bool,
}

#[derive(Default)]
struct State {
    pools: HashMap<u8, PoolState>,
    /// Jobs a pool has dispatched but not yet retired, keyed by grid id
    /// (`spec.md`'s `commit_map`).
    commit_map: HashMap<u16, JobDesc>,
    statuses: HashMap<u16, JobStatus>,
    registers: Registers,
    completion_callback: Option<Box<dyn Fn(u16) + Send + Sync>>,
}

impl State {
    /// `TSM_STATUS`'s bit map of full pools: bit `i` set means pool id `i`
    /// currently has a batch in flight.
    fn pool_status_bitmap(&self) -> u32 {
        self.pools.iter().filter(|(_, pool)| pool.busy).fold(0u32, |mask, (&id, _)| mask | (1 << id))
    }
}

/// The boundary to the opaque instruction-accurate simulator engine named
/// in `SPEC_FULL.md` §1's out-of-scope list: "the opaque instruction-
/// simulator engine (modeled as a black box that exposes register
/// reads/writes, memory, and a completion callback)". This crate never
/// implements that engine; [`Simulator`] is the in-process stand-in that
/// satisfies this boundary for tests and the default `simulator` feature.
pub trait SimulatorHandle: Send + Sync {
    fn read_register(&self, reg: u32) -> u32;
    fn write_register(&self, reg: u32, value: u32);
    fn write_memory(&self, pa: u64, bytes: &[u8]);
    fn read_memory(&self, pa: u64, out: &mut [u8]);
    /// Registers a callback the engine invokes (on its own thread, for a
    /// real engine) when a grid completes.
    fn set_completion_callback(&self, callback: Box<dyn Fn(u16) + Send + Sync>);
}

pub struct Simulator {
    core_count: u32,
    partition_count: u8,
    mem: Arc<MemoryManager>,
    grid_ids: GridIdAllocator,
    group_ids: GroupIdAllocator,
    pools: CommandPoolRegistry,
    state: Mutex<State>,
    completed: Condvar,
}

impl Simulator {
    pub fn new(
        mem: Arc<MemoryManager>,
        core_count: u32,
        partition_count: u8,
        group_capacity: u16,
    ) -> Simulator {
        Simulator {
            core_count,
            partition_count,
            mem,
            grid_ids: GridIdAllocator::default(),
            group_ids: GroupIdAllocator::new(group_capacity),
            pools: CommandPoolRegistry::default(),
            state: Mutex::new(State::default()),
            completed: Condvar::new(),
        }
    }

    pub fn command_pool_id(&self, partition: u8, qos: u8) -> u8 {
        self.pools.get_or_create(partition, qos)
    }

    pub fn mem(&self) -> &Arc<MemoryManager> {
        &self.mem
    }

    /// Dispatches every job it can from `pool`'s buffer queue: while the
    /// pool isn't busy and has a queued job, pop the head, program the
    /// shared `TSM_CMD_*` registers, and retire it immediately (this
    /// simulator has no execution pipeline to drive — a dispatched chain
    /// completes the instant its registers are written). Appends each
    /// retired grid id to `completed` for the caller to deliver completion
    /// callbacks for, once the state lock is released.
    fn drain_pool(&self, state: &mut State, pool_id: u8, completed: &mut Vec<u16>) {
        loop {
            let pool = state.pools.entry(pool_id).or_default();
            if pool.busy {
                break;
            }
            let Some(desc) = pool.queue.pop_front() else { break };
            pool.busy = true;

            state.registers = Registers {
                sched_addr_hi: crate::util::hi(desc.tcb_base),
                sched_addr_lo: crate::util::lo(desc.tcb_base),
                tcb_number: desc.tcb_count,
                sched_ctrl: 1,
            };
            debug!(
                "simulator: pool {} scheduled grid {} ({} tcbs)",
                pool_id, desc.grid_id, desc.tcb_count
            );
            state.commit_map.insert(desc.grid_id, desc);

            state.commit_map.remove(&desc.grid_id);
            state.statuses.insert(desc.grid_id, JobStatus::Done);
            completed.push(desc.grid_id);

            state.pools.get_mut(&pool_id).unwrap().busy = false;
        }
    }
}

impl DeviceBackend for Simulator {
    fn get_core_count(&self) -> u32 {
        self.core_count
    }

    fn get_partition_count(&self) -> u8 {
        self.partition_count
    }

    fn get_cluster_id(&self, partition: u8) -> Result<u8, DeviceError> {
        Ok(partition % self.partition_count.max(1))
    }

    fn get_grid_id(&self) -> Result<u16, DeviceError> {
        self.grid_ids.alloc()
    }

    fn get_start_group_id(&self, count: u16) -> Result<u16, DeviceError> {
        self.group_ids.alloc(count)
    }

    fn put_start_group_id(&self, start: u16, count: u16) {
        self.group_ids.free(start, count);
    }

    fn schedule(&self, desc: JobDesc) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.pools.entry(desc.command_pool_id).or_default().queue.push_back(desc);

        let mut completed = Vec::new();
        self.drain_pool(&mut state, desc.command_pool_id, &mut completed);
        self.completed.notify_all();
        drop(state);

        // Invoke the registered completion callback for each retired grid,
        // mirroring the real engine's `AIPU_EV_GRID_END` delivery, with the
        // state lock already released so a callback that calls back into
        // the simulator cannot deadlock.
        if !completed.is_empty() {
            let state = self.state.lock().unwrap();
            if let Some(cb) = &state.completion_callback {
                for grid_id in completed {
                    cb(grid_id);
                }
            }
        }
        Ok(())
    }

    fn ioctl_cmd(&self, cmd: u32, arg: u64) -> Result<u64, DeviceError> {
        let state = self.state.lock().unwrap();
        match cmd {
            TSM_CMD_SCHED_ADDR_HI => Ok(state.registers.sched_addr_hi as u64),
            TSM_CMD_SCHED_ADDR_LO => Ok(state.registers.sched_addr_lo as u64),
            TSM_CMD_TCB_NUMBER => Ok(state.registers.tcb_number as u64),
            TSM_CMD_SCHED_CTRL => Ok(state.registers.sched_ctrl as u64),
            TSM_STATUS => Ok(state.pool_status_bitmap() as u64),
            TSM_BUILD_INFO => Ok(((MAX_CMD_POOLS - 1) as u64) << 16),
            other => Err(DeviceError::IoctlFailed(format!("unknown simulator register {other:#x} (arg {arg:#x})"))),
        }
    }

    fn poll_status(&self, grid_id: u16, timeout: Duration) -> Result<JobStatus, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = state.statuses.get(&grid_id) {
                return Ok(*status);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DeviceError::Timeout(timeout));
            }
            let (guard, result) = self.completed.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if result.timed_out() {
                return Err(DeviceError::Timeout(timeout));
            }
        }
    }
}

impl SimulatorHandle for Simulator {
    fn read_register(&self, reg: u32) -> u32 {
        self.ioctl_cmd(reg, 0).unwrap_or(0) as u32
    }

    fn write_register(&self, reg: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        match reg {
            TSM_CMD_SCHED_ADDR_HI => state.registers.sched_addr_hi = value,
            TSM_CMD_SCHED_ADDR_LO => state.registers.sched_addr_lo = value,
            TSM_CMD_TCB_NUMBER => state.registers.tcb_number = value,
            TSM_CMD_SCHED_CTRL => state.registers.sched_ctrl = value,
            _ => {}
        }
    }

    fn write_memory(&self, pa: u64, bytes: &[u8]) {
        let _ = self.mem.write(pa, bytes);
    }

    fn read_memory(&self, pa: u64, out: &mut [u8]) {
        let _ = self.mem.read(pa, out);
    }

    fn set_completion_callback(&self, callback: Box<dyn Fn(u16) + Send + Sync>) {
        self.state.lock().unwrap().completion_callback = Some(callback);
    }
}
