pub mod unit;

use std::sync::Arc;

use crate::{Device, FamilyCaps, HostAllocator};

/// Memory-only host device.
pub(crate) fn host_device(name: &str) -> Arc<Device> {
    Arc::new(Device::new(name, name, Box::new(HostAllocator::new(name)), FamilyCaps::default(), None))
}

/// Host device whose raw allocator refuses to hold more than `capacity` bytes.
pub(crate) fn bounded_device(name: &str, capacity: usize) -> Arc<Device> {
    Arc::new(Device::new(
        name,
        name,
        Box::new(HostAllocator::with_capacity(name, capacity)),
        FamilyCaps::default(),
        None,
    ))
}
