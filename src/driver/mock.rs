//! Host-only mock driver for unit and integration testing
//!
//! No GPU is touched: every allocation class is backed by aligned host
//! memory, and each mock stream keeps a FIFO of pending operations
//! (memcpys, host callbacks) that only execute on `synchronize_stream`.
//! That models the property the pool depends on: a host callback observes
//! all work enqueued on the stream before it.
//!
//! Call counters and an out-of-memory fuse let tests assert driver-level
//! behavior (trim idempotence, trim-and-retry on OOM) without a device.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::driver::{
    sys, Driver, DriverError, DriverResult, HostCallback, Ptr, StreamHandle,
};

/// Which mock allocator produced a block; freeing through the wrong release
/// routine is reported as an API error, like the real driver would.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockClass {
    Device,
    Pinned,
    Managed,
    Host,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    class: BlockClass,
}

enum MockOp {
    Memcpy { dst: Ptr, src: Ptr, size: usize },
    HostFunc(HostCallback),
}

/// Per-operation call counters, readable from tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub dev_alloc: usize,
    pub dev_free: usize,
    pub pin_alloc: usize,
    pub pin_free: usize,
    pub pin_register: usize,
    pub pin_unregister: usize,
    pub managed_alloc: usize,
    pub host_alloc: usize,
    pub host_free: usize,
    pub memcpy: usize,
    pub prefetch: usize,
    pub sync: usize,
}

impl CallCounts {
    /// Total number of allocate/release driver calls (copies and syncs are
    /// not counted; trim idempotence is about memory traffic).
    pub fn release_calls(&self) -> usize {
        self.dev_free + self.pin_free + self.host_free + self.pin_unregister
    }
}

struct MockState {
    device_count: usize,
    next_stream: usize,
    streams: HashMap<usize, Vec<MockOp>>,
    blocks: HashMap<Ptr, Block>,
    registered: HashSet<Ptr>,
    dev_oom_fuse: usize,
    counts: CallCounts,
}

/// Mock implementation of [`Driver`].
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    pub fn with_devices(device_count: usize) -> Self {
        MockDriver {
            state: Mutex::new(MockState {
                device_count,
                next_stream: 1,
                streams: HashMap::new(),
                blocks: HashMap::new(),
                registered: HashSet::new(),
                dev_oom_fuse: 0,
                counts: CallCounts::default(),
            }),
        }
    }

    fn lock(&self) -> DriverResult<MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|_| DriverError::Api {
            call: "mock",
            code: -1,
            message: "mock state lock poisoned".to_string(),
        })
    }

    /// Make the next `n` device allocations fail with `OutOfMemory`.
    pub fn fail_next_dev_allocs(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.dev_oom_fuse = n;
        }
    }

    /// Snapshot of the per-operation call counters.
    pub fn counts(&self) -> CallCounts {
        self.state.lock().map(|s| s.counts).unwrap_or_default()
    }

    /// Number of blocks allocated through the mock and not yet released.
    pub fn outstanding(&self) -> usize {
        self.state.lock().map(|s| s.blocks.len()).unwrap_or(0)
    }

    /// Number of host ranges currently pin-registered.
    pub fn registered_count(&self) -> usize {
        self.state.lock().map(|s| s.registered.len()).unwrap_or(0)
    }

    /// Number of operations still queued on a stream.
    pub fn pending_ops(&self, stream: StreamHandle) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.streams.get(&stream.as_raw()).map(Vec::len))
            .unwrap_or(0)
    }

    fn alloc_block(&self, size: usize, class: BlockClass) -> DriverResult<Ptr> {
        let ptr = sys::aligned_alloc(size).ok_or(DriverError::OutOfMemory)?;
        let mut state = self.lock()?;
        state.blocks.insert(ptr, Block { size, class });
        Ok(ptr)
    }

    fn free_block(&self, ptr: Ptr, classes: &[BlockClass], call: &'static str) -> DriverResult<()> {
        let size = {
            let mut state = self.lock()?;
            let block = state.blocks.remove(&ptr).ok_or(DriverError::Api {
                call,
                code: 1,
                message: format!("unknown block {:?}", ptr),
            })?;
            if !classes.contains(&block.class) {
                // Put it back so the caller can diagnose without corrupting state.
                state.blocks.insert(ptr, block);
                return Err(DriverError::Api {
                    call,
                    code: 1,
                    message: format!("block {:?} was allocated as {:?}", ptr, block.class),
                });
            }
            block.size
        };
        sys::aligned_free(ptr, size);
        Ok(())
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn device_count(&self) -> usize {
        self.state.lock().map(|s| s.device_count).unwrap_or(0)
    }

    fn set_device(&self, device: i32) -> DriverResult<()> {
        let state = self.lock()?;
        if device < 0 || device as usize >= state.device_count {
            return Err(DriverError::InvalidDevice(device));
        }
        Ok(())
    }

    fn create_stream(&self, device: i32) -> DriverResult<StreamHandle> {
        let mut state = self.lock()?;
        if device < 0 || device as usize >= state.device_count {
            return Err(DriverError::InvalidDevice(device));
        }
        let id = state.next_stream;
        state.next_stream += 1;
        state.streams.insert(id, Vec::new());
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        self.synchronize_stream(stream)?;
        self.lock()?.streams.remove(&stream.as_raw());
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        // Drain in FIFO order. Ops run outside the state lock because host
        // callbacks re-enter the pool's cache lock.
        loop {
            let ops = {
                let mut state = self.lock()?;
                state.counts.sync += 1;
                match state.streams.get_mut(&stream.as_raw()) {
                    Some(pending) if !pending.is_empty() => std::mem::take(pending),
                    Some(_) => return Ok(()),
                    None => {
                        return Err(DriverError::Api {
                            call: "mock_synchronize_stream",
                            code: 1,
                            message: format!("unknown stream {:?}", stream),
                        })
                    }
                }
            };
            for op in ops {
                match op {
                    MockOp::Memcpy { dst, src, size } => {
                        // SAFETY: both blocks are live mock allocations of at
                        // least `size` bytes (the pool only copies within the
                        // rounded sizes it allocated).
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                src.as_raw() as *const u8,
                                dst.as_raw() as *mut u8,
                                size,
                            );
                        }
                    }
                    MockOp::HostFunc(callback) => callback(),
                }
            }
        }
    }

    fn launch_host_func(&self, stream: StreamHandle, callback: HostCallback) -> DriverResult<()> {
        let mut state = self.lock()?;
        state
            .streams
            .get_mut(&stream.as_raw())
            .ok_or(DriverError::Api {
                call: "mock_launch_host_func",
                code: 1,
                message: format!("unknown stream {:?}", stream),
            })?
            .push(MockOp::HostFunc(callback));
        Ok(())
    }

    fn dev_alloc(&self, size: usize) -> DriverResult<Ptr> {
        {
            let mut state = self.lock()?;
            state.counts.dev_alloc += 1;
            if state.dev_oom_fuse > 0 {
                state.dev_oom_fuse -= 1;
                return Err(DriverError::OutOfMemory);
            }
        }
        self.alloc_block(size, BlockClass::Device)
    }

    fn dev_free(&self, ptr: Ptr) -> DriverResult<()> {
        self.lock()?.counts.dev_free += 1;
        // hipFree releases both device and managed allocations.
        self.free_block(
            ptr,
            &[BlockClass::Device, BlockClass::Managed],
            "mock_dev_free",
        )
    }

    fn pin_alloc(&self, size: usize) -> DriverResult<Ptr> {
        self.lock()?.counts.pin_alloc += 1;
        self.alloc_block(size, BlockClass::Pinned)
    }

    fn pin_free(&self, ptr: Ptr) -> DriverResult<()> {
        self.lock()?.counts.pin_free += 1;
        self.free_block(ptr, &[BlockClass::Pinned], "mock_pin_free")
    }

    fn pin_register(&self, ptr: Ptr, _size: usize) -> DriverResult<()> {
        let mut state = self.lock()?;
        state.counts.pin_register += 1;
        if !state.registered.insert(ptr) {
            return Err(DriverError::Api {
                call: "mock_pin_register",
                code: 1,
                message: format!("{:?} is already registered", ptr),
            });
        }
        Ok(())
    }

    fn pin_unregister(&self, ptr: Ptr) -> DriverResult<()> {
        let mut state = self.lock()?;
        state.counts.pin_unregister += 1;
        if !state.registered.remove(&ptr) {
            return Err(DriverError::Api {
                call: "mock_pin_unregister",
                code: 1,
                message: format!("{:?} is not registered", ptr),
            });
        }
        Ok(())
    }

    fn managed_alloc(&self, size: usize, _read_mostly: bool) -> DriverResult<Ptr> {
        self.lock()?.counts.managed_alloc += 1;
        self.alloc_block(size, BlockClass::Managed)
    }

    fn host_alloc(&self, size: usize) -> DriverResult<Ptr> {
        self.lock()?.counts.host_alloc += 1;
        self.alloc_block(size, BlockClass::Host)
    }

    fn host_free(&self, ptr: Ptr, _size: usize) -> DriverResult<()> {
        self.lock()?.counts.host_free += 1;
        self.free_block(ptr, &[BlockClass::Host], "mock_host_free")
    }

    fn memcpy_async(
        &self,
        dst: Ptr,
        src: Ptr,
        size: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.lock()?;
        state.counts.memcpy += 1;
        state
            .streams
            .get_mut(&stream.as_raw())
            .ok_or(DriverError::Api {
                call: "mock_memcpy_async",
                code: 1,
                message: format!("unknown stream {:?}", stream),
            })?
            .push(MockOp::Memcpy { dst, src, size });
        Ok(())
    }

    fn prefetch_async(
        &self,
        _ptr: Ptr,
        _size: usize,
        device: i32,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.lock()?;
        state.counts.prefetch += 1;
        if device < -1 || device as i64 >= state.device_count as i64 {
            return Err(DriverError::InvalidDevice(device));
        }
        if !state.streams.contains_key(&stream.as_raw()) {
            return Err(DriverError::Api {
                call: "mock_prefetch_async",
                code: 1,
                message: format!("unknown stream {:?}", stream),
            });
        }
        Ok(())
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        // Release anything a test left behind so the process-global allocator
        // stays balanced even when a test asserts leak counts.
        if let Ok(mut state) = self.state.lock() {
            for (ptr, block) in state.blocks.drain() {
                sys::aligned_free(ptr, block.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn host_func_deferred_until_sync() {
        let driver = MockDriver::new();
        let stream = driver.create_stream(0).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        driver
            .launch_host_func(stream, Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        driver.synchronize_stream(stream).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memcpy_runs_on_sync_in_order() {
        let driver = MockDriver::new();
        let stream = driver.create_stream(0).unwrap();
        let src = driver.host_alloc(64).unwrap();
        let dst = driver.dev_alloc(64).unwrap();

        // SAFETY: both are live 64-byte mock blocks.
        unsafe {
            std::ptr::write_bytes(src.as_raw() as *mut u8, 0x5A, 64);
            std::ptr::write_bytes(dst.as_raw() as *mut u8, 0, 64);
        }
        driver.memcpy_async(dst, src, 64, stream).unwrap();

        // Not copied yet.
        // SAFETY: dst is a live 64-byte mock block.
        let before = unsafe { *(dst.as_raw() as *const u8) };
        assert_eq!(before, 0);

        driver.synchronize_stream(stream).unwrap();
        // SAFETY: dst is a live 64-byte mock block.
        let after = unsafe { *(dst.as_raw() as *const u8) };
        assert_eq!(after, 0x5A);

        driver.dev_free(dst).unwrap();
        driver.host_free(src, 64).unwrap();
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn oom_fuse_fails_then_recovers() {
        let driver = MockDriver::new();
        driver.fail_next_dev_allocs(1);
        assert!(matches!(
            driver.dev_alloc(128),
            Err(DriverError::OutOfMemory)
        ));
        let ptr = driver.dev_alloc(128).unwrap();
        driver.dev_free(ptr).unwrap();
    }

    #[test]
    fn wrong_release_routine_is_an_error() {
        let driver = MockDriver::new();
        let ptr = driver.pin_alloc(64).unwrap();
        assert!(driver.dev_free(ptr).is_err());
        driver.pin_free(ptr).unwrap();
    }

    #[test]
    fn register_tracks_ranges() {
        let driver = MockDriver::new();
        let ptr = driver.host_alloc(64).unwrap();
        driver.pin_register(ptr, 64).unwrap();
        assert_eq!(driver.registered_count(), 1);
        assert!(driver.pin_register(ptr, 64).is_err());
        driver.pin_unregister(ptr).unwrap();
        assert!(driver.pin_unregister(ptr).is_err());
        driver.host_free(ptr, 64).unwrap();
    }
}
