//! Common test utilities for mock-backed pool tests
//!
//! Every integration test drives the pool through `MockDriver`, which backs
//! all allocation classes with real host memory and defers stream work
//! (memcpys, host callbacks) until the stream is synchronized - the same
//! ordering contract the HIP runtime provides.

use std::sync::Arc;

use rocpool::{Driver, MemoryPool, MockDriver, PoolConfig};

/// Pool over a single-device mock driver with the default configuration.
#[allow(dead_code)]
pub fn mock_pool() -> (MemoryPool, Arc<MockDriver>) {
    mock_pool_with(PoolConfig::default(), 1)
}

/// Pool with explicit configuration and device count.
#[allow(dead_code)]
pub fn mock_pool_with(config: PoolConfig, devices: usize) -> (MemoryPool, Arc<MockDriver>) {
    let driver = Arc::new(MockDriver::with_devices(devices));
    let dyn_driver: Arc<dyn Driver> = driver.clone();
    (MemoryPool::new(dyn_driver, config), driver)
}

/// Assert the pool and the driver agree that nothing is outstanding.
#[allow(dead_code)]
pub fn assert_no_leak(pool: &MemoryPool, driver: &MockDriver) {
    assert_eq!(pool.live_blocks(), 0, "live table should be empty");
    assert_eq!(pool.cached_total(), 0, "free cache should be empty");
    assert_eq!(
        driver.outstanding(),
        0,
        "driver should hold no outstanding blocks"
    );
}
