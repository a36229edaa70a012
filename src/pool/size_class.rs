//! Power-of-two size classes
//!
//! Requests are rounded up to the kind's quantum and then to the next power
//! of two. That is somewhat wasteful, but it keeps the number of distinct
//! sizes small enough that freed blocks actually get reused.

use super::AllocKind;

/// Baseline rounding quantum: one cache line.
pub const MIN_QUANTUM: usize = 64;

/// Vector width at which the batched host kinds switch from cache-line
/// rounding to packet rounding.
pub const PACKET_WIDTH_THRESHOLD: u32 = 16;

/// Rounding quantum for a kind given the JIT's advertised vector width.
///
/// Batched host kernels process full SIMD packets of doubles, so their
/// buffers must not end mid-packet once the width is large enough to matter.
pub fn quantum(kind: AllocKind, vector_width: u32) -> usize {
    if kind.is_host_family() && vector_width >= PACKET_WIDTH_THRESHOLD {
        vector_width as usize * std::mem::size_of::<f64>()
    } else {
        MIN_QUANTUM
    }
}

/// Rounded allocation size for a nonzero request. Zero-size requests are
/// handled by the caller (null pointer, no side effects) before rounding.
pub fn round_size(kind: AllocKind, requested: usize, vector_width: u32) -> usize {
    let q = quantum(kind, vector_width);
    let quantized = requested.div_ceil(q) * q;
    quantized.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_defaults_to_cache_line() {
        assert_eq!(quantum(AllocKind::Device, 8), 64);
        assert_eq!(quantum(AllocKind::Device, 32), 64);
        assert_eq!(quantum(AllocKind::HostPinned, 32), 64);
        assert_eq!(quantum(AllocKind::Managed, 32), 64);
    }

    #[test]
    fn host_quantum_tracks_packet_size() {
        assert_eq!(quantum(AllocKind::Host, 8), 64);
        assert_eq!(quantum(AllocKind::Host, 16), 128);
        assert_eq!(quantum(AllocKind::HostAsync, 32), 256);
    }

    #[test]
    fn rounds_to_pow2_with_floor() {
        assert_eq!(round_size(AllocKind::Host, 1, 8), 64);
        assert_eq!(round_size(AllocKind::Host, 33, 8), 64);
        assert_eq!(round_size(AllocKind::Host, 65, 8), 128);
        assert_eq!(round_size(AllocKind::Device, 100, 8), 128);
        assert_eq!(round_size(AllocKind::Device, 1 << 20, 8), 1 << 20);
        assert_eq!(round_size(AllocKind::Device, (1 << 20) + 1, 8), 1 << 21);
    }

    #[test]
    fn packet_rounding_widens_the_floor() {
        // width 16 -> 128-byte packets: a 1-byte request still gets a full
        // packet, and 129 bytes round through 256.
        assert_eq!(round_size(AllocKind::Host, 1, 16), 128);
        assert_eq!(round_size(AllocKind::Host, 129, 16), 256);
        // Non-host kinds are unaffected by the vector width.
        assert_eq!(round_size(AllocKind::Device, 1, 16), 64);
    }

    #[test]
    fn sizes_are_powers_of_two() {
        for req in [1usize, 63, 64, 65, 1000, 4096, 100_000] {
            for width in [4u32, 8, 16, 32] {
                let size = round_size(AllocKind::Host, req, width);
                assert!(size.is_power_of_two(), "size {} for req {}", size, req);
                assert!(size >= MIN_QUANTUM);
                assert!(size >= req);
            }
        }
    }
}
