//! Pool configuration
//!
//! # Environment Variables
//!
//! - `ROCPOOL_VECTOR_WIDTH`: the JIT's advertised SIMD vector width
//!   (doubles per packet); widths >= 16 switch the host kinds to
//!   packet-granular size rounding.
//! - `ROCPOOL_HOST_ASYNC`: "0"/"false" disables the host-async task queue;
//!   `HostAsync` requests then silently fall back to `Host`.

/// Environment variable for the vector width override.
const VECTOR_WIDTH_ENV: &str = "ROCPOOL_VECTOR_WIDTH";

/// Environment variable toggling host-async support.
const HOST_ASYNC_ENV: &str = "ROCPOOL_HOST_ASYNC";

/// Default vector width when the runtime does not advertise one.
const DEFAULT_VECTOR_WIDTH: u32 = 8;

/// Allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// SIMD vector width the JIT advertises (doubles per packet).
    pub vector_width: u32,
    /// Whether host-async streams are available; when false, `HostAsync`
    /// is remapped to `Host`.
    pub host_async: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            vector_width: DEFAULT_VECTOR_WIDTH,
            host_async: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised vector width.
    pub fn with_vector_width(mut self, width: u32) -> Self {
        self.vector_width = width;
        self
    }

    /// Enable or disable the host-async scheduling domain.
    pub fn with_host_async(mut self, enabled: bool) -> Self {
        self.host_async = enabled;
        self
    }

    /// Build a configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(width) = std::env::var(VECTOR_WIDTH_ENV)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            config.vector_width = width;
        }
        if let Ok(flag) = std::env::var(HOST_ASYNC_ENV) {
            config.host_async = !matches!(flag.to_lowercase().as_str(), "0" | "false" | "off");
        }
        config
    }
}
