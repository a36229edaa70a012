//! Driver abstraction over the HIP runtime
//!
//! The pool never talks to HIP directly; it goes through the [`Driver`]
//! trait so the caching logic can be exercised against [`MockDriver`]
//! without a GPU. [`HipDriver`] is the production implementation, compiled
//! behind the `rocm` feature.

use std::ffi::c_void;
use std::fmt;

use thiserror::Error;

#[cfg(feature = "rocm")]
pub mod hip;
pub mod mock;
pub(crate) mod sys;

pub use mock::MockDriver;

/// Raw allocation address.
///
/// Stored as an integer so the live table and free cache can be shared
/// across threads without `unsafe impl Send` on every container.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptr(usize);

impl Ptr {
    pub const NULL: Ptr = Ptr(0);

    pub fn from_raw(ptr: *mut c_void) -> Self {
        Ptr(ptr as usize)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Opaque stream handle issued by a driver.
///
/// For `HipDriver` this is the raw `hipStream_t`; the mock hands out small
/// integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) usize);

impl StreamHandle {
    pub fn from_raw(raw: usize) -> Self {
        StreamHandle(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

/// Host callback scheduled behind all work currently enqueued on a stream.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// Driver-level failures.
///
/// `OutOfMemory` is split out from the generic API error because the pool
/// recovers from it once (trim and retry) before giving up.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid device index {0}")]
    InvalidDevice(i32),
    #[error("{call} failed with code {code}: {message}")]
    Api {
        call: &'static str,
        code: i32,
        message: String,
    },
}

pub type DriverResult<T> = Result<T, DriverError>;

/// The CUDA-like driver surface the pool consumes.
///
/// Streams created here execute enqueued work in order; `launch_host_func`
/// runs its callback on some thread only after everything enqueued on the
/// stream so far has completed. `host_alloc`/`host_free` sit on the trait
/// (rather than being called directly) so test drivers can observe them.
pub trait Driver: Send + Sync {
    fn device_count(&self) -> usize;
    fn set_device(&self, device: i32) -> DriverResult<()>;

    fn create_stream(&self, device: i32) -> DriverResult<StreamHandle>;
    fn destroy_stream(&self, stream: StreamHandle) -> DriverResult<()>;
    /// Block until all work enqueued on the stream has completed, including
    /// host callbacks.
    fn synchronize_stream(&self, stream: StreamHandle) -> DriverResult<()>;
    fn launch_host_func(&self, stream: StreamHandle, callback: HostCallback) -> DriverResult<()>;

    fn dev_alloc(&self, size: usize) -> DriverResult<Ptr>;
    fn dev_free(&self, ptr: Ptr) -> DriverResult<()>;

    fn pin_alloc(&self, size: usize) -> DriverResult<Ptr>;
    fn pin_free(&self, ptr: Ptr) -> DriverResult<()>;
    /// Page-lock an existing host range for fast async transfers.
    fn pin_register(&self, ptr: Ptr, size: usize) -> DriverResult<()>;
    /// Host-thread-only call; the pool defers it through the unmap queue.
    fn pin_unregister(&self, ptr: Ptr) -> DriverResult<()>;

    /// Unified memory, optionally with read-mostly advice applied on the
    /// fresh allocation.
    fn managed_alloc(&self, size: usize, read_mostly: bool) -> DriverResult<Ptr>;

    /// 64-byte-aligned system allocation for the plain host kinds.
    fn host_alloc(&self, size: usize) -> DriverResult<Ptr>;
    fn host_free(&self, ptr: Ptr, size: usize) -> DriverResult<()>;

    fn memcpy_async(
        &self,
        dst: Ptr,
        src: Ptr,
        size: usize,
        stream: StreamHandle,
    ) -> DriverResult<()>;
    fn prefetch_async(
        &self,
        ptr: Ptr,
        size: usize,
        device: i32,
        stream: StreamHandle,
    ) -> DriverResult<()>;
}
