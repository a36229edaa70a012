//! Pool API: alloc, free, flush, migrate, prefetch, trim, shutdown
//!
//! Two locks guard the allocator. The main lock covers the live table,
//! accounting, and the stream registry; the cache lock covers the global
//! free cache, every release chain, and the unmap queue. Lock order is
//! main then cache. Neither lock is held across a driver call, and the
//! drain callbacks scheduled on streams take only the cache lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::{Driver, DriverError, HostCallback, Ptr};
use crate::error::{AllocError, AllocResult};

use super::accounting::{mem_string, LeakReport};
use super::release_chain::ReleaseChain;
use super::size_class;
use super::state::{CacheState, MainState, StreamBackend, StreamId, StreamInfo};
use super::task_queue::TaskQueue;
use super::{AllocKey, AllocKind, PoolConfig};

/// `prefetch` target for host memory.
pub const PREFETCH_HOST: i32 = -1;
/// `prefetch` target meaning "every known device".
pub const PREFETCH_ALL_DEVICES: i32 = -2;

pub(crate) struct PoolShared {
    pub driver: Arc<dyn Driver>,
    pub config: PoolConfig,
    pub main: Mutex<MainState>,
    pub cache: Mutex<CacheState>,
    pub trim_warned: AtomicBool,
}

/// Asynchronous multi-pool caching allocator.
///
/// Freed blocks are cached keyed by `(kind, device, size class)` and reused
/// instead of going back to the driver. Frees on a stream are deferred
/// through that stream's release chain: the block only becomes globally
/// reusable after the stream has drained the work that was pending when the
/// chain was flushed.
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

enum FreeRoute {
    /// Plain host memory: straight into the global cache.
    Global,
    /// A matching active stream exists: defer on its release chain.
    Stream { id: StreamId, drain_unmap: bool },
    /// No matching stream; drain everything, then the block is safe.
    SyncAllThenGlobal,
}

impl MemoryPool {
    pub fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> Self {
        MemoryPool {
            shared: Arc::new(PoolShared {
                driver,
                config,
                main: Mutex::new(MainState::new()),
                cache: Mutex::new(CacheState::new()),
                trim_warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_defaults(driver: Arc<dyn Driver>) -> Self {
        Self::new(driver, PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    // ---- streams -------------------------------------------------------

    /// Create a HIP stream on `device` and register it with the pool.
    pub fn create_stream(&self, device: i32) -> AllocResult<StreamId> {
        let device_count = self.shared.driver.device_count();
        if device < 0 || device as usize >= device_count {
            return Err(AllocError::Precondition(format!(
                "create_stream: invalid device index {} ({} device(s) available)",
                device, device_count
            )));
        }
        let handle = self.shared.driver.create_stream(device)?;
        let mut main = self.shared.main.lock()?;
        let id = StreamId(main.next_stream);
        main.next_stream += 1;
        main.streams
            .insert(id, StreamInfo { backend: StreamBackend::Hip { handle, device } });
        tracing::debug!("create_stream: stream {:?} on device {}", id, device);
        Ok(id)
    }

    /// Create a host-async stream backed by a FIFO task queue.
    pub fn create_host_queue(&self) -> AllocResult<StreamId> {
        if !self.shared.config.host_async {
            return Err(AllocError::Precondition(
                "create_host_queue: host-async support is disabled".to_string(),
            ));
        }
        let queue = Arc::new(TaskQueue::spawn());
        let mut main = self.shared.main.lock()?;
        let id = StreamId(main.next_stream);
        main.next_stream += 1;
        main.streams
            .insert(id, StreamInfo { backend: StreamBackend::HostAsync { queue } });
        tracing::debug!("create_host_queue: stream {:?}", id);
        Ok(id)
    }

    /// Select the stream subsequent alloc/free/flush calls operate on.
    pub fn set_active_stream(&self, stream: Option<StreamId>) -> AllocResult<()> {
        let mut main = self.shared.main.lock()?;
        if let Some(id) = stream {
            if !main.streams.contains_key(&id) {
                return Err(AllocError::Precondition(format!(
                    "set_active_stream: unknown stream {:?}",
                    id
                )));
            }
        }
        main.active = stream;
        Ok(())
    }

    pub fn active_stream(&self) -> Option<StreamId> {
        self.shared.main.lock().ok().and_then(|m| m.active)
    }

    /// Block until all work enqueued on `stream` has completed.
    pub fn sync_stream(&self, stream: StreamId) -> AllocResult<()> {
        let backend = {
            let main = self.shared.main.lock()?;
            main.streams
                .get(&stream)
                .map(|info| info.backend.clone())
                .ok_or_else(|| {
                    AllocError::Precondition(format!("sync_stream: unknown stream {:?}", stream))
                })?
        };
        self.sync_backend(&backend)
    }

    /// Drain every stream the pool knows about. Deliberately heavyweight;
    /// only the bad free path and shutdown use it.
    pub fn sync_all_streams(&self) -> AllocResult<()> {
        let backends: Vec<StreamBackend> = {
            let main = self.shared.main.lock()?;
            main.streams.values().map(|info| info.backend.clone()).collect()
        };
        for backend in &backends {
            self.sync_backend(backend)?;
        }
        Ok(())
    }

    fn sync_backend(&self, backend: &StreamBackend) -> AllocResult<()> {
        match backend {
            StreamBackend::Hip { handle, .. } => {
                self.shared.driver.synchronize_stream(*handle)?;
            }
            StreamBackend::HostAsync { queue } => queue.synchronize(),
        }
        Ok(())
    }

    // ---- alloc ---------------------------------------------------------

    /// Allocate `size` bytes of `kind` memory. Size 0 returns a null
    /// pointer with no side effects.
    pub fn alloc(&self, kind: AllocKind, size: usize) -> AllocResult<Ptr> {
        if size == 0 {
            return Ok(Ptr::NULL);
        }
        let kind = self.effective_kind(kind);
        let rounded = size_class::round_size(kind, size, self.shared.config.vector_width);

        // Resolve the stream and target device under the main lock.
        let (key, stream) = {
            let main = self.shared.main.lock()?;
            let mut device = 0;
            let mut stream = None;
            if kind.stream_local_reuse() {
                let id = main.active.ok_or_else(|| {
                    AllocError::Precondition(format!(
                        "alloc: an active stream must be set before allocating {} memory",
                        kind
                    ))
                })?;
                let info = main.streams.get(&id).ok_or_else(|| {
                    AllocError::Precondition(format!("alloc: active stream {:?} is unknown", id))
                })?;
                if info.is_hip() != (kind == AllocKind::Device) {
                    return Err(AllocError::Precondition(format!(
                        "alloc: the active stream backend does not match {} memory",
                        kind
                    )));
                }
                device = info.device();
                stream = Some(id);
            }
            (AllocKey::new(kind, device, rounded), stream)
        };

        // Cache lookup: blocks freed earlier on this same stream are safe
        // to reuse without synchronization (any kernel still using them is
        // ordered before the new use), then the global cache.
        let cached = {
            let mut cache = self.shared.cache.lock()?;
            let mut hit = None;
            if let Some(id) = stream {
                if let Some(chain) = cache.chains.get_mut(&id) {
                    if let Some(ptr) = chain.pop_local(key) {
                        hit = Some((ptr, "reused local"));
                    }
                }
            }
            if hit.is_none() {
                if let Some(list) = cache.free.get_mut(&key) {
                    if let Some(ptr) = list.pop() {
                        hit = Some((ptr, "reused global"));
                    }
                }
            }
            hit
        };

        // Fresh allocations run with both locks released so other threads
        // can make progress while this one blocks in the driver.
        let (ptr, provenance) = match cached {
            Some(hit) => hit,
            None => (self.fresh_alloc(key)?, "new allocation"),
        };

        {
            let mut main = self.shared.main.lock()?;
            main.live.insert(ptr, key);
            main.accounting.charge(key.kind, key.size);
        }

        if key.kind == AllocKind::Device {
            tracing::trace!(
                "alloc(kind={}, device={}, size={}): {:?} ({})",
                key.kind,
                key.device,
                key.size,
                ptr,
                provenance
            );
        } else {
            tracing::trace!(
                "alloc(kind={}, size={}): {:?} ({})",
                key.kind,
                key.size,
                ptr,
                provenance
            );
        }
        Ok(ptr)
    }

    fn effective_kind(&self, kind: AllocKind) -> AllocKind {
        if kind == AllocKind::HostAsync && !self.shared.config.host_async {
            AllocKind::Host
        } else {
            kind
        }
    }

    fn fresh_alloc(&self, key: AllocKey) -> AllocResult<Ptr> {
        match self.raw_alloc(key) {
            Ok(ptr) => Ok(ptr),
            Err(DriverError::OutOfMemory) => {
                // One recovery attempt: drop every cached block and retry.
                self.trim(true)?;
                match self.raw_alloc(key) {
                    Ok(ptr) => Ok(ptr),
                    Err(DriverError::OutOfMemory) => Err(AllocError::OutOfMemory {
                        kind: key.kind,
                        size: key.size,
                    }),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn raw_alloc(&self, key: AllocKey) -> Result<Ptr, DriverError> {
        let driver = &self.shared.driver;
        match key.kind {
            AllocKind::Host | AllocKind::HostAsync => driver.host_alloc(key.size),
            AllocKind::HostPinned => driver.pin_alloc(key.size),
            AllocKind::Device => {
                driver.set_device(key.device)?;
                driver.dev_alloc(key.size)
            }
            AllocKind::Managed => driver.managed_alloc(key.size, false),
            AllocKind::ManagedReadMostly => driver.managed_alloc(key.size, true),
        }
    }

    fn raw_release(&self, key: AllocKey, ptr: Ptr) -> Result<(), DriverError> {
        let driver = &self.shared.driver;
        match key.kind {
            AllocKind::Host | AllocKind::HostAsync => driver.host_free(ptr, key.size),
            AllocKind::HostPinned => driver.pin_free(ptr),
            AllocKind::Device | AllocKind::Managed | AllocKind::ManagedReadMostly => {
                driver.dev_free(ptr)
            }
        }
    }

    // ---- free ----------------------------------------------------------

    /// Return a block to the pool. Null is a no-op; an address the pool
    /// does not know is a fatal precondition violation.
    pub fn free(&self, ptr: Ptr) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        // The unmap drain can request follow-up frees; they are processed
        // iteratively so no lock or live-table borrow is outstanding when
        // they run.
        let mut worklist = vec![ptr];
        while let Some(next) = worklist.pop() {
            let followups = self.free_one(next)?;
            worklist.extend(followups);
        }
        Ok(())
    }

    fn free_one(&self, ptr: Ptr) -> AllocResult<Vec<Ptr>> {
        // Resolve the record, pick the route, and settle accounting in one
        // critical section; after this the pointer is no longer live.
        let (key, route) = {
            let mut main = self.shared.main.lock()?;
            let key = *main.live.get(&ptr).ok_or_else(|| {
                AllocError::Precondition(format!("free: unknown address {:?}", ptr))
            })?;

            let route = if key.kind == AllocKind::Host {
                FreeRoute::Global
            } else {
                let wants_hip = key.kind.uses_hip_backend();
                let active = main
                    .active
                    .and_then(|id| main.streams.get(&id).map(|info| (id, info.is_hip())));
                match active {
                    Some((id, is_hip)) if is_hip == wants_hip => FreeRoute::Stream {
                        id,
                        drain_unmap: is_hip,
                    },
                    _ => FreeRoute::SyncAllThenGlobal,
                }
            };

            main.live.remove(&ptr);
            main.accounting.release(key.kind, key.size);
            (key, route)
        };

        let mut followups = Vec::new();
        match route {
            FreeRoute::Global => {
                self.shared.cache.lock()?.push_free(key, ptr);
            }
            FreeRoute::Stream { id, drain_unmap } => {
                let unmap = {
                    let mut cache = self.shared.cache.lock()?;
                    cache
                        .chains
                        .entry(id)
                        .or_insert_with(ReleaseChain::new)
                        .push(key, ptr);
                    if drain_unmap {
                        std::mem::take(&mut cache.unmap)
                    } else {
                        Vec::new()
                    }
                };
                // Unregister outside the cache lock; hipHostUnregister is a
                // host-thread call and may be slow.
                for (free_after, mapped) in unmap {
                    self.shared.driver.pin_unregister(mapped)?;
                    if free_after {
                        followups.push(mapped);
                    }
                }
            }
            FreeRoute::SyncAllThenGlobal => {
                // Freeing without a matching active stream: the pointer may
                // still be referenced by an in-flight kernel somewhere, so
                // drain everything before making it reusable.
                self.sync_all_streams()?;
                self.shared.cache.lock()?.push_free(key, ptr);
            }
        }

        if key.kind == AllocKind::Device {
            tracing::trace!(
                "free({:?}, kind={}, device={}, size={})",
                ptr,
                key.kind,
                key.device,
                key.size
            );
        } else {
            tracing::trace!("free({:?}, kind={}, size={})", ptr, key.kind, key.size);
        }
        Ok(followups)
    }

    // ---- flush ---------------------------------------------------------

    /// Seal the active stream's release chain and schedule its drain into
    /// the global cache once the stream has completed the work enqueued so
    /// far. A no-op when nothing is pending.
    pub fn flush(&self) -> AllocResult<()> {
        let (id, backend) = {
            let main = self.shared.main.lock()?;
            let Some(id) = main.active else {
                return Ok(());
            };
            let Some(info) = main.streams.get(&id) else {
                return Ok(());
            };
            (id, info.backend.clone())
        };

        let node = {
            let mut cache = self.shared.cache.lock()?;
            let Some(chain) = cache.chains.get_mut(&id) else {
                return Ok(());
            };
            let pending = chain.pending();
            if pending == 0 {
                return Ok(());
            }
            tracing::trace!(
                "flush: scheduling {} deallocation{} on stream {:?}",
                pending,
                if pending > 1 { "s" } else { "" },
                id
            );
            chain.seal()
        };

        let shared = Arc::clone(&self.shared);
        let callback: HostCallback = Box::new(move || drain_sealed(&shared, id, node));
        match backend {
            StreamBackend::Hip { handle, .. } => {
                self.shared.driver.launch_host_func(handle, callback)?;
            }
            StreamBackend::HostAsync { queue } => queue.enqueue(callback),
        }
        Ok(())
    }

    // ---- migrate -------------------------------------------------------

    /// Move or copy a block to another kind, returning the new pointer
    /// (or the same pointer for relabels and no-ops). With `move_source`
    /// the source follows the regular free path, ordered after the copy.
    pub fn migrate(&self, ptr: Ptr, new_kind: AllocKind, move_source: bool) -> AllocResult<Ptr> {
        let new_kind = self.effective_kind(new_kind);

        let (key, backend) = {
            let mut main = self.shared.main.lock()?;
            let id = main.active.ok_or_else(|| {
                AllocError::Precondition(
                    "migrate: an active stream must be set before migrating memory".to_string(),
                )
            })?;
            let key = *main.live.get(&ptr).ok_or_else(|| {
                AllocError::Precondition(format!("migrate: unknown address {:?}", ptr))
            })?;

            // Host <-> host-async: same bytes, only the scheduling domain
            // changes, so a move is a relabel.
            if move_source
                && key.kind.is_host_family()
                && new_kind.is_host_family()
                && key.kind != new_kind
            {
                main.live.insert(ptr, AllocKey::new(new_kind, 0, key.size));
                main.accounting.transfer(key.kind, new_kind, key.size);
                tracing::trace!("migrate({:?}): relabel {} -> {}", ptr, key.kind, new_kind);
                return Ok(ptr);
            }

            let info = main.streams.get(&id).ok_or_else(|| {
                AllocError::Precondition(format!("migrate: active stream {:?} is unknown", id))
            })?;

            // Nothing to do when the kind (and device, for device memory)
            // already matches.
            if key.kind == new_kind
                && (new_kind != AllocKind::Device || key.device == info.device())
            {
                return Ok(ptr);
            }

            (key, info.backend.clone())
        };

        // Transfers between the host-async domain and HIP-owned memory
        // would need cross-backend ordering no single stream can provide.
        if (key.kind == AllocKind::HostAsync && new_kind.uses_hip_backend())
            || (new_kind == AllocKind::HostAsync && key.kind.uses_hip_backend())
        {
            return Err(AllocError::Precondition(format!(
                "migrate: migrations between {} and {} memory are not supported",
                key.kind, new_kind
            )));
        }

        if key.kind.is_host_family() && new_kind.is_host_family() {
            return self.migrate_host_family(ptr, key, new_kind, move_source, backend);
        }

        let handle = match backend {
            StreamBackend::Hip { handle, .. } => handle,
            StreamBackend::HostAsync { .. } => {
                return Err(AllocError::Precondition(format!(
                    "migrate: an active HIP stream is required to migrate {} memory",
                    key.kind
                )));
            }
        };

        let new_ptr = self.alloc(new_kind, key.size)?;
        tracing::trace!(
            "migrate({:?} -> {:?}, {} -> {})",
            ptr,
            new_ptr,
            key.kind,
            new_kind
        );

        let driver = &self.shared.driver;
        if key.kind == AllocKind::Host {
            // Host -> HIP kind: transiently pin the source so the async
            // copy can read it; the unpin is queued behind the copy and
            // executed later on a host thread via the unmap queue.
            driver.pin_register(ptr, key.size)?;
            driver.memcpy_async(new_ptr, ptr, key.size, handle)?;
            let shared = Arc::clone(&self.shared);
            let source = ptr;
            driver.launch_host_func(
                handle,
                Box::new(move || queue_unmap(&shared, move_source, source)),
            )?;
        } else if new_kind == AllocKind::Host {
            // HIP kind -> host: pin the fresh destination for the copy.
            driver.pin_register(new_ptr, key.size)?;
            driver.memcpy_async(new_ptr, ptr, key.size, handle)?;
            let shared = Arc::clone(&self.shared);
            let dest = new_ptr;
            driver.launch_host_func(handle, Box::new(move || queue_unmap(&shared, false, dest)))?;
            if move_source {
                // Device-kind source: this lands on the stream chain,
                // correctly ordered after the copy.
                self.free(ptr)?;
            }
        } else {
            driver.memcpy_async(new_ptr, ptr, key.size, handle)?;
            if move_source {
                self.free(ptr)?;
            }
        }

        Ok(new_ptr)
    }

    /// Copy between the host scheduling domains. The copy is ordered on the
    /// active stream like any other transfer: through `memcpy_async` on a
    /// HIP stream, or behind the pending tasks of the host-async queue.
    fn migrate_host_family(
        &self,
        ptr: Ptr,
        key: AllocKey,
        new_kind: AllocKind,
        move_source: bool,
        backend: StreamBackend,
    ) -> AllocResult<Ptr> {
        let new_ptr = self.alloc(new_kind, key.size)?;
        tracing::trace!(
            "migrate({:?} -> {:?}, {} -> {})",
            ptr,
            new_ptr,
            key.kind,
            new_kind
        );

        match backend {
            StreamBackend::Hip { handle, .. } => {
                self.shared.driver.memcpy_async(new_ptr, ptr, key.size, handle)?;
            }
            StreamBackend::HostAsync { queue } => {
                // The queue's FIFO places the copy behind any task still
                // writing the source, the same ordering flush relies on for
                // its drain callback.
                let src = ptr.addr();
                let dst = new_ptr.addr();
                let size = key.size;
                queue.enqueue(Box::new(move || {
                    // SAFETY: both blocks stay allocated until the queue
                    // drains: the source is live or parked on this stream's
                    // release chain, and the destination cannot leave the
                    // chain before the drain callback enqueued behind us.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
                    }
                }));
            }
        }

        if move_source {
            self.free(ptr)?;
        }
        Ok(new_ptr)
    }

    // ---- prefetch ------------------------------------------------------

    /// Asynchronously prefetch a managed block to `device`
    /// ([`PREFETCH_HOST`] for the host, [`PREFETCH_ALL_DEVICES`] to fan out
    /// to every device).
    pub fn prefetch(&self, ptr: Ptr, device: i32) -> AllocResult<()> {
        let device_count = self.shared.driver.device_count();

        let (key, handle) = {
            let main = self.shared.main.lock()?;
            let id = main.active.ok_or_else(|| {
                AllocError::Precondition(
                    "prefetch: an active HIP stream must be set before prefetching".to_string(),
                )
            })?;
            let info = main.streams.get(&id).ok_or_else(|| {
                AllocError::Precondition(format!("prefetch: active stream {:?} is unknown", id))
            })?;
            let handle = match &info.backend {
                StreamBackend::Hip { handle, .. } => *handle,
                StreamBackend::HostAsync { .. } => {
                    return Err(AllocError::Precondition(
                        "prefetch: the active stream is not a HIP stream".to_string(),
                    ));
                }
            };
            let key = *main.live.get(&ptr).ok_or_else(|| {
                AllocError::Precondition(format!("prefetch: unknown address {:?}", ptr))
            })?;
            (key, handle)
        };

        if !matches!(key.kind, AllocKind::Managed | AllocKind::ManagedReadMostly) {
            return Err(AllocError::Precondition(format!(
                "prefetch: expected managed memory, got {} for {:?}",
                key.kind, ptr
            )));
        }

        match device {
            PREFETCH_HOST => {
                self.shared
                    .driver
                    .prefetch_async(ptr, key.size, PREFETCH_HOST, handle)?;
            }
            PREFETCH_ALL_DEVICES => {
                for target in 0..device_count as i32 {
                    self.shared
                        .driver
                        .prefetch_async(ptr, key.size, target, handle)?;
                }
            }
            target if target >= 0 && (target as usize) < device_count => {
                self.shared
                    .driver
                    .prefetch_async(ptr, key.size, target, handle)?;
            }
            target => {
                return Err(AllocError::Precondition(format!(
                    "prefetch: invalid device index {}",
                    target
                )));
            }
        }
        Ok(())
    }

    // ---- trim / shutdown ----------------------------------------------

    /// Release every cached block back to the driver / OS and drain the
    /// unmap backlog. Always safe: cached blocks are by construction not
    /// in use. With `warn`, the first call logs a memory-pressure warning.
    pub fn trim(&self, warn: bool) -> AllocResult<()> {
        if warn && !self.shared.trim_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "trim: the allocation cache was flushed to recover from memory \
                 pressure. This is an expensive operation; consider reducing the \
                 working set. This warning is only displayed once."
            );
        }

        let (free_map, unmap) = {
            let mut cache = self.shared.cache.lock()?;
            (
                std::mem::take(&mut cache.free),
                std::mem::take(&mut cache.unmap),
            )
        };

        // Reverse outstanding transient pinnings first; flagged entries
        // route back through free() once unregistered.
        let mut followups = Vec::new();
        for (free_after, ptr) in unmap {
            self.shared.driver.pin_unregister(ptr)?;
            if free_after {
                followups.push(ptr);
            }
        }
        for ptr in followups {
            self.free(ptr)?;
        }

        let mut trim_count = [0usize; AllocKind::COUNT];
        let mut trim_bytes = [0usize; AllocKind::COUNT];
        for (key, ptrs) in free_map {
            trim_count[key.kind.index()] += ptrs.len();
            trim_bytes[key.kind.index()] += key.size * ptrs.len();
            for ptr in ptrs {
                self.raw_release(key, ptr)?;
            }
        }

        let total: usize = trim_count.iter().sum();
        if total > 0 {
            tracing::debug!("trim: freed");
            for kind in AllocKind::ALL {
                let i = kind.index();
                if trim_count[i] == 0 {
                    continue;
                }
                tracing::debug!(
                    " - {} memory: {} in {} allocation{}",
                    kind,
                    mem_string(trim_bytes[i]),
                    trim_count[i],
                    if trim_count[i] > 1 { "s" } else { "" }
                );
            }
        }
        Ok(())
    }

    /// Drain all streams, trim the caches, and report anything still live
    /// as a leak. The pool's streams are destroyed.
    pub fn shutdown(&self) -> AllocResult<LeakReport> {
        // Let every pending drain callback run, then fold what is still
        // parked in a chain into the global cache: the streams are idle,
        // so those blocks are safe to reuse and to trim.
        self.sync_all_streams()?;
        {
            let mut cache = self.shared.cache.lock()?;
            let chains = std::mem::take(&mut cache.chains);
            for (_, chain) in chains {
                for (key, ptrs) in chain.into_entries() {
                    cache.free.entry(key).or_default().extend(ptrs);
                }
            }
        }

        self.trim(false)?;

        let (report, streams) = {
            let mut main = self.shared.main.lock()?;
            let mut report = LeakReport::default();
            for key in main.live.values() {
                report.record(key.kind, key.size);
            }
            main.active = None;
            (report, std::mem::take(&mut main.streams))
        };

        if !report.is_empty() {
            tracing::warn!("shutdown: leaked");
            for kind in AllocKind::ALL {
                let i = kind.index();
                if report.count[i] == 0 {
                    continue;
                }
                tracing::warn!(
                    " - {} memory: {} in {} allocation{}",
                    kind,
                    mem_string(report.bytes[i]),
                    report.count[i],
                    if report.count[i] > 1 { "s" } else { "" }
                );
            }
        }

        for (_, info) in streams {
            if let StreamBackend::Hip { handle, .. } = info.backend {
                self.shared.driver.destroy_stream(handle)?;
            }
            // Host-async queues shut down when their last Arc drops.
        }

        Ok(report)
    }

    // ---- accounting / instrumentation ----------------------------------

    /// Live bytes currently charged to `kind`.
    pub fn usage(&self, kind: AllocKind) -> usize {
        self.shared
            .main
            .lock()
            .map(|m| m.accounting.usage[kind.index()])
            .unwrap_or(0)
    }

    /// Historical peak of [`usage`](Self::usage) for `kind`.
    pub fn watermark(&self, kind: AllocKind) -> usize {
        self.shared
            .main
            .lock()
            .map(|m| m.accounting.watermark[kind.index()])
            .unwrap_or(0)
    }

    /// Number of outstanding client-held blocks.
    pub fn live_blocks(&self) -> usize {
        self.shared.main.lock().map(|m| m.live.len()).unwrap_or(0)
    }

    /// Total bytes across outstanding blocks (sums the live table, unlike
    /// [`usage`](Self::usage) which reads the per-kind counters).
    pub fn live_bytes(&self) -> usize {
        self.shared
            .main
            .lock()
            .map(|m| m.live.values().map(|key| key.size).sum::<usize>())
            .unwrap_or(0)
    }

    /// Number of blocks of `kind` parked in the global cache.
    pub fn cached_blocks(&self, kind: AllocKind) -> usize {
        self.shared
            .cache
            .lock()
            .map(|c| {
                c.free
                    .iter()
                    .filter(|(key, _)| key.kind == kind)
                    .map(|(_, list)| list.len())
                    .sum::<usize>()
            })
            .unwrap_or(0)
    }

    /// Total blocks parked in the global cache.
    pub fn cached_total(&self) -> usize {
        self.shared.cache.lock().map(|c| c.cached_total()).unwrap_or(0)
    }
}

/// Runs after the stream has drained the work that existed when `node` was
/// sealed; moves the sealed batches into the global cache. Takes only the
/// cache lock.
fn drain_sealed(shared: &PoolShared, stream: StreamId, node: u64) {
    let Ok(mut cache) = shared.cache.lock() else {
        return;
    };
    let drained = match cache.chains.get_mut(&stream) {
        Some(chain) => chain.drain_after(node),
        None => return,
    };
    for (key, ptrs) in drained {
        cache.free.entry(key).or_default().extend(ptrs);
    }
}

/// Stream callback target: park a pinned range on the unmap queue for the
/// next host-side drain.
fn queue_unmap(shared: &PoolShared, free_after: bool, ptr: Ptr) {
    if let Ok(mut cache) = shared.cache.lock() {
        cache.unmap.push((free_after, ptr));
    }
}
