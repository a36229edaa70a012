//! Allocation kinds and cache keys

use std::fmt;

/// Memory class and provenance of an allocation.
///
/// Each kind maps to a distinct underlying allocator and release routine in
/// the driver layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocKind {
    /// Plain 64-byte-aligned host memory.
    Host,
    /// Host memory whose frees are ordered on the host-async task queue.
    HostAsync,
    /// Page-locked host memory allocated through the driver.
    HostPinned,
    /// Device-resident memory.
    Device,
    /// Unified memory visible to host and device.
    Managed,
    /// Unified memory with read-mostly advice.
    ManagedReadMostly,
}

impl AllocKind {
    /// Number of kinds; accounting arrays are indexed by [`AllocKind::index`].
    pub const COUNT: usize = 6;

    pub const ALL: [AllocKind; Self::COUNT] = [
        AllocKind::Host,
        AllocKind::HostAsync,
        AllocKind::HostPinned,
        AllocKind::Device,
        AllocKind::Managed,
        AllocKind::ManagedReadMostly,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Display name used in log lines and reports.
    pub fn name(self) -> &'static str {
        match self {
            AllocKind::Host => "host",
            AllocKind::HostAsync => "host-async",
            AllocKind::HostPinned => "host-pinned",
            AllocKind::Device => "device",
            AllocKind::Managed => "managed",
            AllocKind::ManagedReadMostly => "managed/rm",
        }
    }

    /// Kinds whose pointers are owned by the HIP backend. `Host` and
    /// `HostAsync` live in system memory.
    pub fn uses_hip_backend(self) -> bool {
        !matches!(self, AllocKind::Host | AllocKind::HostAsync)
    }

    /// Kinds eligible for per-stream release-chain reuse on `alloc`. The
    /// other flavors (host-pinned, managed) are reachable from both CPU and
    /// GPU and may still be in use until their chain drains.
    pub fn stream_local_reuse(self) -> bool {
        matches!(self, AllocKind::Device | AllocKind::HostAsync)
    }

    /// Host-family kinds share bytes and differ only in scheduling domain.
    pub fn is_host_family(self) -> bool {
        matches!(self, AllocKind::Host | AllocKind::HostAsync)
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cache key: `(kind, device, rounded size)`.
///
/// Two pointers with an equal key are interchangeable at the cache level.
/// `device` is meaningful only for `Device` memory and is normalized to 0
/// for every other kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocKey {
    pub kind: AllocKind,
    pub device: i32,
    pub size: usize,
}

impl AllocKey {
    pub fn new(kind: AllocKind, device: i32, size: usize) -> Self {
        let device = if kind == AllocKind::Device { device } else { 0 };
        AllocKey { kind, device, size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_report_format() {
        assert_eq!(AllocKind::Host.name(), "host");
        assert_eq!(AllocKind::HostAsync.name(), "host-async");
        assert_eq!(AllocKind::HostPinned.name(), "host-pinned");
        assert_eq!(AllocKind::Device.name(), "device");
        assert_eq!(AllocKind::Managed.name(), "managed");
        assert_eq!(AllocKind::ManagedReadMostly.name(), "managed/rm");
    }

    #[test]
    fn indexes_are_dense() {
        for (i, kind) in AllocKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn backend_routing() {
        assert!(!AllocKind::Host.uses_hip_backend());
        assert!(!AllocKind::HostAsync.uses_hip_backend());
        assert!(AllocKind::HostPinned.uses_hip_backend());
        assert!(AllocKind::Device.uses_hip_backend());
        assert!(AllocKind::Managed.uses_hip_backend());
        assert!(AllocKind::ManagedReadMostly.uses_hip_backend());
    }

    #[test]
    fn only_stream_ordered_kinds_reuse_locally() {
        let eligible: Vec<_> = AllocKind::ALL
            .iter()
            .filter(|k| k.stream_local_reuse())
            .collect();
        assert_eq!(eligible, [&AllocKind::HostAsync, &AllocKind::Device]);
    }

    #[test]
    fn key_normalizes_device() {
        assert_eq!(AllocKey::new(AllocKind::Device, 3, 256).device, 3);
        assert_eq!(AllocKey::new(AllocKind::Managed, 3, 256).device, 0);
        assert_eq!(AllocKey::new(AllocKind::HostPinned, 1, 256).device, 0);
        assert_eq!(AllocKey::new(AllocKind::Host, 7, 256).device, 0);
    }
}
