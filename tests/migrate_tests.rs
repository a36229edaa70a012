//! Migration: relabels, cross-kind copies, pin/unpin ordering, prefetch

mod common;

use common::{assert_no_leak, mock_pool, mock_pool_with};
use rand::{RngCore, SeedableRng};
use rocpool::{
    AllocError, AllocKind, PoolConfig, Ptr, PREFETCH_ALL_DEVICES, PREFETCH_HOST,
};

/// Fill a live block with a deterministic pattern.
fn write_pattern(ptr: Ptr, len: usize, seed: u64) -> Vec<u8> {
    let mut pattern = vec![0u8; len];
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    rng.fill_bytes(&mut pattern);
    // SAFETY: the block is live and at least `len` bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(pattern.as_ptr(), ptr.as_raw() as *mut u8, len);
    }
    pattern
}

fn read_block(ptr: Ptr, len: usize) -> Vec<u8> {
    // SAFETY: the block is live and at least `len` bytes.
    unsafe { std::slice::from_raw_parts(ptr.as_raw() as *const u8, len).to_vec() }
}

#[test]
fn host_to_device_move_pins_copies_and_unpins() {
    // Scenario: migrate a written host block to the device; after the
    // stream drains, the device copy holds the pattern and the source is
    // eventually unregistered and returned to the host cache.
    let (pool, driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let src = pool.alloc(AllocKind::Host, 4096).expect("alloc failed");
    let pattern = write_pattern(src, 4096, 7);

    let dst = pool.migrate(src, AllocKind::Device, true).expect("migrate failed");
    assert_ne!(dst, src);
    assert_eq!(driver.counts().pin_register, 1);
    assert_eq!(driver.registered_count(), 1, "source is pinned for the copy");

    // The copy and the unpin request are queued behind the stream.
    pool.sync_stream(stream).expect("sync failed");
    assert_eq!(read_block(dst, 4096), pattern);

    // The unregister itself is deferred to the next host-side drain; a free
    // on the HIP stream performs it and then frees the moved source.
    pool.free(dst).expect("free failed");
    assert_eq!(driver.registered_count(), 0, "unmap queue was drained");
    assert_eq!(driver.counts().pin_unregister, 1);
    assert_eq!(
        pool.cached_blocks(AllocKind::Host),
        1,
        "moved source lands in the host cache"
    );

    pool.flush().expect("flush failed");
    let report = pool.shutdown().expect("shutdown failed");
    assert!(report.is_empty());
    assert_no_leak(&pool, &driver);
}

#[test]
fn migration_round_trip_preserves_contents() {
    // P6: host -> device -> host with move semantics reproduces the bytes.
    let (pool, driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let original = pool.alloc(AllocKind::Host, 1024).expect("alloc failed");
    let pattern = write_pattern(original, 1024, 99);

    let on_device = pool
        .migrate(original, AllocKind::Device, true)
        .expect("migrate to device failed");
    pool.sync_stream(stream).expect("sync failed");

    let back = pool
        .migrate(on_device, AllocKind::Host, true)
        .expect("migrate to host failed");
    pool.sync_stream(stream).expect("sync failed");

    assert_eq!(read_block(back, 1024), pattern);

    pool.free(back).expect("free failed");
    pool.flush().expect("flush failed");
    pool.sync_stream(stream).expect("sync failed");
    pool.trim(false).expect("trim failed");
    let report = pool.shutdown().expect("shutdown failed");
    assert!(report.is_empty());
    assert_no_leak(&pool, &driver);
}

#[test]
fn device_to_device_copy_keeps_source_without_move() {
    let (pool, driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let src = pool.alloc(AllocKind::Device, 256).expect("alloc failed");
    let copy = pool
        .migrate(src, AllocKind::Managed, false)
        .expect("migrate failed");
    assert_ne!(copy, src);
    assert_eq!(pool.live_blocks(), 2, "copy semantics keep the source live");
    assert_eq!(driver.counts().memcpy, 1);
    assert_eq!(driver.counts().pin_register, 0, "no pinning between HIP kinds");

    pool.free(src).expect("free failed");
    pool.free(copy).expect("free failed");
    pool.flush().expect("flush failed");
    pool.shutdown().expect("shutdown failed");
    assert_no_leak(&pool, &driver);
}

#[test]
fn migrate_same_kind_is_noop() {
    let (pool, driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let ptr = pool.alloc(AllocKind::Device, 128).expect("alloc failed");
    let same = pool.migrate(ptr, AllocKind::Device, true).expect("migrate failed");
    assert_eq!(same, ptr);
    assert_eq!(driver.counts().memcpy, 0);
    assert_eq!(pool.live_blocks(), 1);

    pool.free(ptr).expect("free failed");
    pool.shutdown().expect("shutdown failed");
}

#[test]
fn host_relabel_moves_bytes_between_domains() {
    let (pool, _driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let ptr = pool.alloc(AllocKind::Host, 512).expect("alloc failed");
    assert_eq!(pool.usage(AllocKind::Host), 512);

    // A move between the host domains is a pure relabel: same pointer,
    // usage shifts to the other counter.
    let relabeled = pool
        .migrate(ptr, AllocKind::HostAsync, true)
        .expect("migrate failed");
    assert_eq!(relabeled, ptr);
    assert_eq!(pool.usage(AllocKind::Host), 0);
    assert_eq!(pool.usage(AllocKind::HostAsync), 512);

    let back = pool
        .migrate(ptr, AllocKind::Host, true)
        .expect("migrate failed");
    assert_eq!(back, ptr);
    assert_eq!(pool.usage(AllocKind::Host), 512);
    assert_eq!(pool.usage(AllocKind::HostAsync), 0);

    pool.free(ptr).expect("free failed");
    pool.shutdown().expect("shutdown failed");
}

#[test]
fn host_family_copy_duplicates_bytes() {
    // Copy (not move) between the host scheduling domains goes through
    // memcpy_async on the active HIP stream like any other transfer.
    let (pool, driver) = mock_pool();
    let queue = pool.create_host_queue().expect("create_host_queue failed");
    pool.set_active_stream(Some(queue)).expect("set_active failed");

    let src = pool.alloc(AllocKind::HostAsync, 256).expect("alloc failed");
    let pattern = write_pattern(src, 256, 3);

    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let copy = pool.migrate(src, AllocKind::Host, false).expect("migrate failed");
    assert_ne!(copy, src);
    assert_eq!(driver.counts().memcpy, 1);
    assert_eq!(pool.live_blocks(), 2);

    // The copy is stream-ordered; it lands once the stream drains.
    pool.sync_stream(stream).expect("sync failed");
    assert_eq!(read_block(copy, 256), pattern);

    pool.free(copy).expect("free failed");
    pool.free(src).expect("free failed");
    pool.flush().expect("flush failed");
    pool.shutdown().expect("shutdown failed");
    assert_no_leak(&pool, &driver);
}

#[test]
fn host_family_copy_rides_the_active_queue() {
    // With a host-async stream active there is no HIP handle; the copy is
    // enqueued on the queue's FIFO behind any task still writing the source.
    let (pool, driver) = mock_pool();
    let queue = pool.create_host_queue().expect("create_host_queue failed");
    pool.set_active_stream(Some(queue)).expect("set_active failed");

    let src = pool.alloc(AllocKind::HostAsync, 256).expect("alloc failed");
    let pattern = write_pattern(src, 256, 5);

    let copy = pool.migrate(src, AllocKind::Host, false).expect("migrate failed");
    assert_ne!(copy, src);
    assert_eq!(driver.counts().memcpy, 0, "no HIP stream is involved");

    pool.sync_stream(queue).expect("sync failed");
    assert_eq!(read_block(copy, 256), pattern);
    assert_eq!(pool.live_blocks(), 2);

    pool.free(copy).expect("free failed");
    pool.free(src).expect("free failed");
    pool.flush().expect("flush failed");
    pool.shutdown().expect("shutdown failed");
    assert_no_leak(&pool, &driver);
}

#[test]
fn host_async_to_hip_kinds_is_unsupported() {
    let (pool, _driver) = mock_pool();
    let queue = pool.create_host_queue().expect("create_host_queue failed");
    pool.set_active_stream(Some(queue)).expect("set_active failed");

    let ptr = pool.alloc(AllocKind::HostAsync, 64).expect("alloc failed");
    let err = pool
        .migrate(ptr, AllocKind::Device, false)
        .expect_err("should be unsupported");
    assert!(matches!(err, AllocError::Precondition(_)));

    pool.free(ptr).expect("free failed");
    pool.shutdown().expect("shutdown failed");
}

#[test]
fn migrate_unknown_pointer_is_fatal() {
    let (pool, _driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let bogus = Ptr::from_raw(0x4000_usize as *mut std::ffi::c_void);
    let err = pool
        .migrate(bogus, AllocKind::Device, false)
        .expect_err("should fail");
    assert!(matches!(err, AllocError::Precondition(_)));
    pool.shutdown().expect("shutdown failed");
}

#[test]
fn prefetch_targets_host_device_or_everything() {
    let (pool, driver) = mock_pool_with(PoolConfig::default(), 2);
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let managed = pool.alloc(AllocKind::Managed, 8192).expect("alloc failed");

    pool.prefetch(managed, PREFETCH_HOST).expect("prefetch failed");
    assert_eq!(driver.counts().prefetch, 1);

    pool.prefetch(managed, 1).expect("prefetch failed");
    assert_eq!(driver.counts().prefetch, 2);

    // Fan out to both devices.
    pool.prefetch(managed, PREFETCH_ALL_DEVICES).expect("prefetch failed");
    assert_eq!(driver.counts().prefetch, 4);

    // Invalid device index.
    let err = pool.prefetch(managed, 5).expect_err("should fail");
    assert!(matches!(err, AllocError::Precondition(_)));

    pool.free(managed).expect("free failed");
    pool.flush().expect("flush failed");
    pool.shutdown().expect("shutdown failed");
    assert_no_leak(&pool, &driver);
}

#[test]
fn prefetch_rejects_non_managed_memory() {
    let (pool, _driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let device = pool.alloc(AllocKind::Device, 64).expect("alloc failed");
    let err = pool.prefetch(device, PREFETCH_HOST).expect_err("should fail");
    assert!(matches!(err, AllocError::Precondition(_)));

    let host = pool.alloc(AllocKind::Host, 64).expect("alloc failed");
    let err = pool.prefetch(host, 0).expect_err("should fail");
    assert!(matches!(err, AllocError::Precondition(_)));

    pool.free(device).expect("free failed");
    pool.free(host).expect("free failed");
    pool.flush().expect("flush failed");
    pool.shutdown().expect("shutdown failed");
}

#[test]
fn read_mostly_advice_reaches_the_driver() {
    let (pool, driver) = mock_pool();
    let stream = pool.create_stream(0).expect("create_stream failed");
    pool.set_active_stream(Some(stream)).expect("set_active failed");

    let ptr = pool
        .alloc(AllocKind::ManagedReadMostly, 4096)
        .expect("alloc failed");
    assert_eq!(driver.counts().managed_alloc, 1);
    assert_eq!(pool.usage(AllocKind::ManagedReadMostly), 4096);

    pool.free(ptr).expect("free failed");
    pool.flush().expect("flush failed");
    pool.shutdown().expect("shutdown failed");
    assert_no_leak(&pool, &driver);
}
