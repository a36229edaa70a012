//! Allocator state behind the two pool locks
//!
//! `MainState` sits behind the main lock: the live table, accounting, and
//! the stream registry. `CacheState` sits behind the cache lock: the global
//! free cache, every stream's release chain, and the unmap queue. Lock
//! order is main then cache; neither lock is ever held across a driver
//! call, and drain callbacks take only the cache lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::{Ptr, StreamHandle};

use super::accounting::Accounting;
use super::release_chain::ReleaseChain;
use super::task_queue::TaskQueue;
use super::AllocKey;

/// Pool-scoped stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u32);

/// Backend a stream schedules its work on.
#[derive(Clone)]
pub(crate) enum StreamBackend {
    /// A HIP stream on a specific device.
    Hip { handle: StreamHandle, device: i32 },
    /// The host-async task queue.
    HostAsync { queue: Arc<TaskQueue> },
}

pub(crate) struct StreamInfo {
    pub backend: StreamBackend,
}

impl StreamInfo {
    pub fn is_hip(&self) -> bool {
        matches!(self.backend, StreamBackend::Hip { .. })
    }

    pub fn device(&self) -> i32 {
        match self.backend {
            StreamBackend::Hip { device, .. } => device,
            StreamBackend::HostAsync { .. } => 0,
        }
    }
}

/// State behind the main lock.
pub(crate) struct MainState {
    /// Every pointer currently held by a client, with its cache key.
    pub live: HashMap<Ptr, AllocKey>,
    pub accounting: Accounting,
    pub streams: HashMap<StreamId, StreamInfo>,
    pub active: Option<StreamId>,
    pub next_stream: u32,
}

impl MainState {
    pub fn new() -> Self {
        MainState {
            live: HashMap::new(),
            accounting: Accounting::default(),
            streams: HashMap::new(),
            active: None,
            next_stream: 0,
        }
    }
}

/// State behind the cache lock.
pub(crate) struct CacheState {
    /// Blocks that are reusable right now: no outstanding asynchronous use.
    pub free: HashMap<AllocKey, Vec<Ptr>>,
    /// Release chains, one per stream, created lazily on first stream free.
    pub chains: HashMap<StreamId, ReleaseChain>,
    /// Host ranges whose `pin_unregister` must run on the host thread;
    /// the flag requests a follow-up free once unregistered.
    pub unmap: Vec<(bool, Ptr)>,
}

impl CacheState {
    pub fn new() -> Self {
        CacheState {
            free: HashMap::new(),
            chains: HashMap::new(),
            unmap: Vec::new(),
        }
    }

    pub fn push_free(&mut self, key: AllocKey, ptr: Ptr) {
        self.free.entry(key).or_default().push(ptr);
    }

    /// Total pointers parked in the global cache (test instrumentation).
    pub fn cached_total(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}
