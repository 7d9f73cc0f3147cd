//! Kernel-mode backend (`SPEC_FULL.md` §4.6 non-goal: "the kernel driver
//! and its ioctl wire format are out of scope"). This crate only defines
//! the trait boundary a platform integration implements; [`KernelBackend`]
//! translates [`super::DeviceBackend`] calls into an injected
//! [`IoctlChannel`] so this crate never depends on kernel headers or a real
//! file descriptor.

use std::time::Duration;

use super::ids::{CommandPoolRegistry, GridIdAllocator, GroupIdAllocator};
use super::{DeviceBackend, DeviceError, JobDesc, JobStatus};

/// The narrow boundary a real kernel-mode transport implements: one ioctl
/// call in, one `u64` result out.
pub trait IoctlChannel: Send + Sync {
    fn ioctl(&self, cmd: u32, arg: u64) -> Result<u64, DeviceError>;
}

const IOCTL_SCHEDULE: u32 = 1;
const IOCTL_POLL: u32 = 2;

pub struct KernelBackend<C: IoctlChannel> {
    channel: C,
    core_count: u32,
    partition_count: u8,
    grid_ids: GridIdAllocator,
    group_ids: GroupIdAllocator,
    pools: CommandPoolRegistry,
}

impl<C: IoctlChannel> KernelBackend<C> {
    pub fn new(channel: C, core_count: u32, partition_count: u8, group_capacity: u16) -> KernelBackend<C> {
        KernelBackend {
            channel,
            core_count,
            partition_count,
            grid_ids: GridIdAllocator::default(),
            group_ids: GroupIdAllocator::new(group_capacity),
            pools: CommandPoolRegistry::default(),
        }
    }

    pub fn command_pool_id(&self, partition: u8, qos: u8) -> u8 {
        self.pools.get_or_create(partition, qos)
    }
}

impl<C: IoctlChannel> DeviceBackend for KernelBackend<C> {
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
        // The wire format a real driver expects for this ioctl is out of
        // scope; this packs just enough for a test `IoctlChannel` to
        // observe what was submitted.
        let packed = (desc.tcb_base << 16) | desc.tcb_count as u64;
        self.channel.ioctl(IOCTL_SCHEDULE, packed)?;
        Ok(())
    }

    fn ioctl_cmd(&self, cmd: u32, arg: u64) -> Result<u64, DeviceError> {
        self.channel.ioctl(cmd, arg)
    }

    fn poll_status(&self, grid_id: u16, _timeout: Duration) -> Result<JobStatus, DeviceError> {
        let raw = self.channel.ioctl(IOCTL_POLL, grid_id as u64)?;
        match raw {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Done),
            code => Ok(JobStatus::Exception(code as u32)),
        }
    }
}
