//! rocpool - stream-ordered caching memory allocator for ROCm/HIP JIT runtimes
//!
//! rocpool sits between a JIT runtime and the underlying HIP / system
//! allocators. It amortizes expensive driver allocations by caching freed
//! blocks keyed by kind, device, and power-of-two size class, and makes it
//! safe to free a pointer that may still be in use by an asynchronous
//! kernel: the block returns to the cache only after the owning stream has
//! drained all previously enqueued work.
//!
//! ```rust
//! use std::sync::Arc;
//! use rocpool::{AllocKind, MemoryPool, MockDriver, PoolConfig};
//!
//! # fn main() -> rocpool::AllocResult<()> {
//! let pool = MemoryPool::new(Arc::new(MockDriver::new()), PoolConfig::default());
//! let stream = pool.create_stream(0)?;
//! pool.set_active_stream(Some(stream))?;
//!
//! let ptr = pool.alloc(AllocKind::Device, 4096)?;
//! pool.free(ptr)?;
//! // Same stream, same size class: served from the release chain without
//! // any synchronization.
//! let again = pool.alloc(AllocKind::Device, 4096)?;
//! assert_eq!(ptr, again);
//!
//! pool.free(again)?;
//! pool.flush()?;
//! pool.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod logging;
pub mod pool;

pub use driver::{Driver, DriverError, DriverResult, MockDriver, Ptr, StreamHandle};
pub use error::{AllocError, AllocResult};
pub use pool::{
    mem_string, AllocKey, AllocKind, LeakReport, MemoryPool, PoolConfig, StreamId,
    PREFETCH_ALL_DEVICES, PREFETCH_HOST,
};

#[cfg(feature = "rocm")]
pub use driver::hip::HipDriver;
