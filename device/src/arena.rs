//! Stable handles to buffers that do not keep them alive.
//!
//! Captured launch sequences refer to their arguments through [`BufferId`]s
//! so that recording does not pin intermediate buffers.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_dtype::DType;

use crate::allocator::BufferOptions;
use crate::buffer::{Buffer, WeakBuffer};
use crate::device::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// What is needed to allocate an equivalent buffer once the original is gone.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub device: Arc<Device>,
    pub size: usize,
    pub dtype: DType,
    pub options: BufferOptions,
}

impl BufferDescriptor {
    /// Unallocated buffer with the same device, size, dtype and options.
    pub fn instantiate(&self) -> Buffer {
        Buffer::new(Arc::clone(&self.device), self.size, self.dtype.clone(), self.options)
    }
}

struct Slot {
    buffer: WeakBuffer,
    descriptor: BufferDescriptor,
}

#[derive(Default)]
pub struct BufferArena {
    slots: Vec<Slot>,
    by_addr: HashMap<usize, BufferId>,
}

impl BufferArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `buffer`; registering a live buffer twice returns the same id.
    pub fn register(&mut self, buffer: &Buffer) -> BufferId {
        let addr = buffer.addr();
        if let Some(&id) = self.by_addr.get(&addr) {
            if self.slots[id.index()].buffer.upgrade().is_some_and(|b| b.ptr_eq(buffer)) {
                return id;
            }
        }
        let id = BufferId(self.slots.len() as u32);
        self.slots.push(Slot {
            buffer: buffer.downgrade(),
            descriptor: BufferDescriptor {
                device: Arc::clone(buffer.device()),
                size: buffer.size(),
                dtype: buffer.dtype().clone(),
                options: buffer.options(),
            },
        });
        self.by_addr.insert(addr, id);
        id
    }

    /// The buffer behind `id`, `None` once it has been dropped.
    pub fn get(&self, id: BufferId) -> Option<Buffer> {
        self.slots.get(id.index())?.buffer.upgrade()
    }

    pub fn descriptor(&self, id: BufferId) -> Option<&BufferDescriptor> {
        self.slots.get(id.index()).map(|s| &s.descriptor)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_addr.clear();
    }
}
