//! ROCm/HIP driver backend
//!
//! Compiled only with the `rocm` feature; links against `amdhip64`.

mod driver;
mod ffi;

pub use driver::HipDriver;
