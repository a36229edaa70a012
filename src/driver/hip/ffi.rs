//! HIP FFI bindings
//!
//! FFI declarations below are bound to the ROCm HIP API. All functions are
//! actively used through wrapper methods in HipDriver; the dead_code
//! allowance is needed because FFI symbols appear unused to the compiler
//! (they're only called through unsafe blocks).

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(device_id: i32) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;

    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipHostRegister(ptr: *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostUnregister(ptr: *mut c_void) -> i32;
    pub fn hipMallocManaged(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipMemAdvise(ptr: *const c_void, count: usize, advice: i32, device: i32) -> i32;

    pub fn hipMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: i32,
        stream: *mut c_void,
    ) -> i32;
    pub fn hipMemPrefetchAsync(
        ptr: *const c_void,
        count: usize,
        device: i32,
        stream: *mut c_void,
    ) -> i32;

    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipLaunchHostFunc(
        stream: *mut c_void,
        func: extern "C" fn(*mut c_void),
        user_data: *mut c_void,
    ) -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// hipErrorOutOfMemory
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

/// hipMemcpyDefault - direction inferred from unified addressing
pub const HIP_MEMCPY_DEFAULT: i32 = 4;

/// hipMemAttachGlobal - managed memory visible to every stream
pub const HIP_MEM_ATTACH_GLOBAL: u32 = 1;

/// hipMemAdviseSetReadMostly
pub const HIP_MEM_ADVISE_SET_READ_MOSTLY: i32 = 1;

/// hipCpuDeviceId - prefetch target for host memory
pub const HIP_CPU_DEVICE_ID: i32 = -1;

/// Default flags for hipHostMalloc / hipHostRegister
pub const HIP_HOST_MALLOC_DEFAULT: u32 = 0;
pub const HIP_HOST_REGISTER_DEFAULT: u32 = 0;
