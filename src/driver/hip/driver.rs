//! HIP implementation of the Driver trait

use std::ffi::{c_void, CStr};
use std::ptr;

use crate::driver::{
    sys, Driver, DriverError, DriverResult, HostCallback, Ptr, StreamHandle,
};

use super::ffi;

/// Map a HIP return code onto `DriverResult`, keeping out-of-memory
/// distinguishable so the pool can trim and retry.
fn check(call: &'static str, code: i32) -> DriverResult<()> {
    match code {
        ffi::HIP_SUCCESS => Ok(()),
        ffi::HIP_ERROR_OUT_OF_MEMORY => Err(DriverError::OutOfMemory),
        _ => Err(DriverError::Api {
            call,
            code,
            message: error_string(code),
        }),
    }
}

/// Get the HIP error string for an error code.
fn error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a static string or null.
    unsafe {
        let raw = ffi::hipGetErrorString(code);
        if raw.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        }
    }
}

/// Fixed trampoline handed to hipLaunchHostFunc; the payload is a boxed
/// callback produced by `launch_host_func`.
extern "C" fn host_func_trampoline(user_data: *mut c_void) {
    // SAFETY: user_data came from Box::into_raw in launch_host_func and is
    // consumed exactly once (HIP invokes each host function once).
    let callback = unsafe { Box::from_raw(user_data as *mut HostCallback) };
    callback();
}

/// Driver backend for AMD GPUs via the HIP runtime.
pub struct HipDriver {
    device_count: usize,
}

impl HipDriver {
    /// Initialize the HIP runtime and enumerate devices.
    pub fn new() -> DriverResult<Self> {
        // SAFETY: plain runtime initialization calls.
        let count = unsafe {
            check("hipInit", ffi::hipInit(0))?;
            let mut count: i32 = 0;
            check("hipGetDeviceCount", ffi::hipGetDeviceCount(&mut count))?;
            count
        };

        tracing::debug!("HipDriver::new: {} device(s) available", count);
        Ok(HipDriver {
            device_count: count.max(0) as usize,
        })
    }
}

impl Driver for HipDriver {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn set_device(&self, device: i32) -> DriverResult<()> {
        if device < 0 || device as usize >= self.device_count {
            return Err(DriverError::InvalidDevice(device));
        }
        // SAFETY: validated device index.
        check("hipSetDevice", unsafe { ffi::hipSetDevice(device) })
    }

    fn create_stream(&self, device: i32) -> DriverResult<StreamHandle> {
        self.set_device(device)?;
        let mut stream: *mut c_void = ptr::null_mut();
        // SAFETY: stream is a valid out-pointer.
        check("hipStreamCreate", unsafe {
            ffi::hipStreamCreate(&mut stream)
        })?;
        tracing::debug!(
            "HipDriver::create_stream: created stream {:?} on device {}",
            stream,
            device
        );
        Ok(StreamHandle(stream as usize))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        // SAFETY: handle was issued by create_stream.
        check("hipStreamDestroy", unsafe {
            ffi::hipStreamDestroy(stream.as_raw() as *mut c_void)
        })
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        // SAFETY: handle was issued by create_stream.
        check("hipStreamSynchronize", unsafe {
            ffi::hipStreamSynchronize(stream.as_raw() as *mut c_void)
        })
    }

    fn launch_host_func(&self, stream: StreamHandle, callback: HostCallback) -> DriverResult<()> {
        let payload = Box::into_raw(Box::new(callback)) as *mut c_void;
        // SAFETY: payload ownership transfers to the trampoline.
        let code = unsafe {
            ffi::hipLaunchHostFunc(stream.as_raw() as *mut c_void, host_func_trampoline, payload)
        };
        if code != ffi::HIP_SUCCESS {
            // Enqueue failed: reclaim the payload so it is not leaked.
            // SAFETY: HIP did not take ownership on failure.
            drop(unsafe { Box::from_raw(payload as *mut HostCallback) });
        }
        check("hipLaunchHostFunc", code)
    }

    fn dev_alloc(&self, size: usize) -> DriverResult<Ptr> {
        let mut raw: *mut c_void = ptr::null_mut();
        // SAFETY: raw is a valid out-pointer.
        check("hipMalloc", unsafe { ffi::hipMalloc(&mut raw, size) })?;
        if raw.is_null() {
            return Err(DriverError::OutOfMemory);
        }
        Ok(Ptr::from_raw(raw))
    }

    fn dev_free(&self, ptr: Ptr) -> DriverResult<()> {
        // SAFETY: ptr was returned by hipMalloc.
        check("hipFree", unsafe { ffi::hipFree(ptr.as_raw()) })
    }

    fn pin_alloc(&self, size: usize) -> DriverResult<Ptr> {
        let mut raw: *mut c_void = ptr::null_mut();
        // SAFETY: raw is a valid out-pointer.
        check("hipHostMalloc", unsafe {
            ffi::hipHostMalloc(&mut raw, size, ffi::HIP_HOST_MALLOC_DEFAULT)
        })?;
        if raw.is_null() {
            return Err(DriverError::OutOfMemory);
        }
        Ok(Ptr::from_raw(raw))
    }

    fn pin_free(&self, ptr: Ptr) -> DriverResult<()> {
        // SAFETY: ptr was returned by hipHostMalloc.
        check("hipHostFree", unsafe { ffi::hipHostFree(ptr.as_raw()) })
    }

    fn pin_register(&self, ptr: Ptr, size: usize) -> DriverResult<()> {
        // SAFETY: caller guarantees [ptr, ptr+size) is a live host range.
        check("hipHostRegister", unsafe {
            ffi::hipHostRegister(ptr.as_raw(), size, ffi::HIP_HOST_REGISTER_DEFAULT)
        })
    }

    fn pin_unregister(&self, ptr: Ptr) -> DriverResult<()> {
        // SAFETY: ptr was previously registered.
        check("hipHostUnregister", unsafe {
            ffi::hipHostUnregister(ptr.as_raw())
        })
    }

    fn managed_alloc(&self, size: usize, read_mostly: bool) -> DriverResult<Ptr> {
        let mut raw: *mut c_void = ptr::null_mut();
        // SAFETY: raw is a valid out-pointer.
        check("hipMallocManaged", unsafe {
            ffi::hipMallocManaged(&mut raw, size, ffi::HIP_MEM_ATTACH_GLOBAL)
        })?;
        if raw.is_null() {
            return Err(DriverError::OutOfMemory);
        }
        if read_mostly {
            // SAFETY: raw is a fresh managed allocation of `size` bytes.
            check("hipMemAdvise", unsafe {
                ffi::hipMemAdvise(raw, size, ffi::HIP_MEM_ADVISE_SET_READ_MOSTLY, 0)
            })?;
        }
        Ok(Ptr::from_raw(raw))
    }

    fn host_alloc(&self, size: usize) -> DriverResult<Ptr> {
        sys::aligned_alloc(size).ok_or(DriverError::OutOfMemory)
    }

    fn host_free(&self, ptr: Ptr, size: usize) -> DriverResult<()> {
        sys::aligned_free(ptr, size);
        Ok(())
    }

    fn memcpy_async(
        &self,
        dst: Ptr,
        src: Ptr,
        size: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        // SAFETY: caller guarantees both ranges are live for `size` bytes;
        // hipMemcpyDefault infers the direction from unified addressing.
        check("hipMemcpyAsync", unsafe {
            ffi::hipMemcpyAsync(
                dst.as_raw(),
                src.as_raw(),
                size,
                ffi::HIP_MEMCPY_DEFAULT,
                stream.as_raw() as *mut c_void,
            )
        })
    }

    fn prefetch_async(
        &self,
        ptr: Ptr,
        size: usize,
        device: i32,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        let target = if device < 0 { ffi::HIP_CPU_DEVICE_ID } else { device };
        // SAFETY: ptr is a live managed range of `size` bytes.
        check("hipMemPrefetchAsync", unsafe {
            ffi::hipMemPrefetchAsync(ptr.as_raw(), size, target, stream.as_raw() as *mut c_void)
        })
    }
}
