//! Devices, memory and backend contracts for kiln.
//!
//! - [`allocator`] - raw and caching allocators
//! - [`buffer`] - lazily allocated buffers and views
//! - [`arena`] - non-owning buffer handles
//! - [`memory`] - per-device byte counters
//! - [`program`] - `Renderer` / `Compiler` / `Program` and the launch `ProgramSpec`
//! - [`device`] - the per-device bundle
//! - [`registry`] - device names and lazy opening

pub mod allocator;
pub mod arena;
pub mod buffer;
pub mod device;
pub mod error;
pub mod memory;
pub mod program;
pub mod registry;

#[cfg(test)]
pub mod test;

pub use allocator::{Allocator, BufferOptions, HostAllocator, LruAllocator, RawBuffer};
pub use arena::{BufferArena, BufferDescriptor, BufferId};
pub use buffer::{Buffer, WeakBuffer};
pub use device::{Backend, Device, FamilyCaps};
pub use error::{Error, Result};
pub use memory::MemoryTracker;
pub use program::{BufferAccess, Compiler, Program, ProgramSpec, Renderer, RuntimeFactory};
pub use registry::{DeviceId, DeviceRegistry, DeviceRegistryBuilder, FamilyFactory, canonicalize};
