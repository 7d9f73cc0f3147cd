//! Device/scheduler abstraction (`SPEC_FULL.md` §4.6).
//!
//! [`DeviceBackend`] is the seam between a [`crate::job::Job`] and whatever
//! actually runs its TCB chain: the in-process [`simulator`] (default,
//! feature `simulator`) or the [`kernel`] ioctl stub. Both hand back a
//! [`JobDesc`] handle a caller polls to completion.

pub mod ids;
#[cfg(feature = "simulator")]
pub mod simulator;

pub mod kernel;

use std::time::Duration;

use thiserror::Error;

use crate::job::Job;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no grid id is available")]
    NoGridIdAvailable,
    #[error("no contiguous run of {0} group ids is available")]
    NoGroupIdAvailable(u16),
    #[error("command pool {0} is not registered for partition {1}/qos {2}")]
    UnknownCommandPool(u8, u8, u8),
    #[error("device ioctl failed: {0}")]
    IoctlFailed(String),
    #[error("schedule rejected: command queue is full")]
    QueueFull,
    #[error("poll timed out after {0:?}")]
    Timeout(Duration),
    #[error("job finished with exception status {0:#x}")]
    Exception(u32),
}

/// Completion status a backend reports back through [`DeviceBackend::poll_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
    Exception(u32),
}

/// What one `schedule` call submits to a backend: the TCB chain's base
/// address and length, plus the scheduling-class fields a real device's
/// command descriptor carries (`SPEC_FULL.md` §4.6 "submission").
#[derive(Debug, Clone, Copy)]
pub struct JobDesc {
    pub grid_id: u16,
    pub tcb_base: u64,
    pub tcb_count: u32,
    pub partition: u8,
    pub qos: u8,
    pub command_pool_id: u8,
}

impl JobDesc {
    pub fn from_job(job: &Job<'_>, command_pool_id: u8) -> JobDesc {
        JobDesc {
            grid_id: job.grid_id,
            tcb_base: job.tcb_buf.base,
            tcb_count: job.total_tcb_count() as u32,
            partition: job.config.partition,
            qos: job.config.qos,
            command_pool_id,
        }
    }

    fn fmt_info(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("JobDesc")
            .field("grid_id", &self.grid_id)
            .field("tcb_base", &format_args!("{:#x}", self.tcb_base))
            .field("tcb_count", &self.tcb_count)
            .field("partition", &self.partition)
            .field("qos", &self.qos)
            .field("command_pool_id", &self.command_pool_id)
            .finish()
    }
}

impl std::fmt::Display for JobDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_info(f)
    }
}

/// The seam a job submits through. Implemented by [`simulator::Simulator`]
/// and [`kernel::KernelBackend`] (`SPEC_FULL.md` §4.6).
pub trait DeviceBackend: Send + Sync {
    fn get_core_count(&self) -> u32;
    fn get_partition_count(&self) -> u8;
    fn get_cluster_id(&self, partition: u8) -> Result<u8, DeviceError>;

    /// Allocates the next monotonic grid id for a new job chain.
    fn get_grid_id(&self) -> Result<u16, DeviceError>;

    /// Allocates `count` contiguous group ids for a job's subgraphs.
    fn get_start_group_id(&self, count: u16) -> Result<u16, DeviceError>;

    /// Releases a previously allocated contiguous group-id run.
    fn put_start_group_id(&self, start: u16, count: u16);

    /// Submits a job descriptor for execution; returns immediately.
    fn schedule(&self, desc: JobDesc) -> Result<(), DeviceError>;

    /// A raw escape hatch for backend-specific control operations
    /// (`SPEC_FULL.md` §4.6 "vendor ioctls"), keyed by a numeric command id.
    fn ioctl_cmd(&self, cmd: u32, arg: u64) -> Result<u64, DeviceError>;

    /// Blocks (up to `timeout`) until the job identified by `grid_id`
    /// reaches a terminal status.
    fn poll_status(&self, grid_id: u16, timeout: Duration) -> Result<JobStatus, DeviceError>;
}
