//! Grid-id, group-id and command-pool-id allocation (`SPEC_FULL.md` §5
//! "Concurrency & Resource Model"). Shared by every [`super::DeviceBackend`]
//! implementation so two backends never hand out colliding ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use super::DeviceError;

/// Ever-increasing grid id source. Wraps at `u16::MAX` back to `1` (`0` is
/// reserved as "no grid"), matching the source driver's id space.
pub struct GridIdAllocator {
    next: AtomicU16,
}

impl Default for GridIdAllocator {
    fn default() -> GridIdAllocator {
        GridIdAllocator { next: AtomicU16::new(1) }
    }
}

impl GridIdAllocator {
    pub fn alloc(&self) -> Result<u16, DeviceError> {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let next = if current == u16::MAX { 1 } else { current + 1 };
            if self
                .next
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }
}

/// A bitmap allocator for contiguous group-id runs
/// (`SPEC_FULL.md` §5, testable-property 7: "a concurrent burst of
/// `get_start_group_id` calls never hands out overlapping ranges").
pub struct GroupIdAllocator {
    capacity: u16,
    used: Mutex<Vec<bool>>,
}

impl GroupIdAllocator {
    pub fn new(capacity: u16) -> GroupIdAllocator {
        GroupIdAllocator { capacity, used: Mutex::new(vec![false; capacity as usize]) }
    }

    /// Finds and reserves the first contiguous run of `count` free ids.
    pub fn alloc(&self, count: u16) -> Result<u16, DeviceError> {
        if count == 0 || count > self.capacity {
            return Err(DeviceError::NoGroupIdAvailable(count));
        }
        let mut used = self.used.lock().unwrap();
        let count = count as usize;
        let mut run_start = None;
        let mut run_len = 0usize;
        for i in 0..used.len() {
            if !used[i] {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for slot in used.iter_mut().take(start + count).skip(start) {
                        *slot = true;
                    }
                    return Ok(start as u16);
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }
        Err(DeviceError::NoGroupIdAvailable(count as u16))
    }

    pub fn free(&self, start: u16, count: u16) {
        let mut used = self.used.lock().unwrap();
        let start = start as usize;
        let count = count as usize;
        for slot in used.iter_mut().take((start + count).min(used.len())).skip(start) {
            *slot = false;
        }
    }
}

/// Per `(partition, qos)` command-pool id registry. A real device exposes a
/// small fixed number of hardware command pools; this driver hands out ids
/// on first use and reuses them on every later request for the same key
/// (`SPEC_FULL.md` §4.6).
#[derive(Default)]
pub struct CommandPoolRegistry {
    pools: Mutex<HashMap<(u8, u8), u8>>,
    next_id: Mutex<u8>,
}

impl CommandPoolRegistry {
    pub fn get_or_create(&self, partition: u8, qos: u8) -> u8 {
        let mut pools = self.pools.lock().unwrap();
        *pools.entry((partition, qos)).or_insert_with(|| {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next = next.wrapping_add(1);
            id
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_id_allocator_is_monotonic() {
        let alloc = GridIdAllocator::default();
        assert_eq!(alloc.alloc().unwrap(), 1);
        assert_eq!(alloc.alloc().unwrap(), 2);
    }

    #[test]
    fn group_id_allocator_finds_contiguous_run() {
        let alloc = GroupIdAllocator::new(8);
        let start = alloc.alloc(3).unwrap();
        assert_eq!(start, 0);
        let start2 = alloc.alloc(2).unwrap();
        assert_eq!(start2, 3);
    }

    #[test]
    fn group_id_allocator_reuses_freed_run() {
        let alloc = GroupIdAllocator::new(4);
        let start = alloc.alloc(4).unwrap();
        alloc.free(start, 4);
        assert_eq!(alloc.alloc(4).unwrap(), 0);
    }

    #[test]
    fn group_id_allocator_rejects_oversized_request() {
        let alloc = GroupIdAllocator::new(2);
        assert!(matches!(alloc.alloc(3), Err(DeviceError::NoGroupIdAvailable(3))));
    }

    #[test]
    fn command_pool_registry_reuses_same_key() {
        let registry = CommandPoolRegistry::default();
        let a = registry.get_or_create(0, 1);
        let b = registry.get_or_create(0, 1);
        assert_eq!(a, b);
        let c = registry.get_or_create(1, 1);
        assert_ne!(a, c);
    }
}
