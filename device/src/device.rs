//! A device: memory plus, for compute families, a compiler backend.
//!
//! The [`Device`] owns:
//! - **Allocator**: always the caching [`LruAllocator`] around the family's raw allocator
//! - **MemoryTracker**: bytes held by live base buffers
//! - **Backend**: renderer, compiler and runtime factory (absent for pass-through families)

use std::fmt;
use std::sync::Arc;

use kiln_schedule::KernelCaps;

use crate::allocator::{Allocator, LruAllocator};
use crate::error::{NoBackendSnafu, Result};
use crate::memory::MemoryTracker;
use crate::program::{Compiler, Program, Renderer, RuntimeFactory};

/// Properties shared by every device of a family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilyCaps {
    /// Compiled artifacts are valid on every device of the family.
    pub shares_binaries: bool,
    /// Memory only, no compiler; usable from any thread and not counted in memory use.
    pub pass_through: bool,
    /// More than one index may be opened.
    pub multi_instance: bool,
}

#[derive(Clone)]
pub struct Backend {
    pub renderer: Arc<dyn Renderer>,
    pub compiler: Arc<dyn Compiler>,
    pub runtime: RuntimeFactory,
}

impl Backend {
    pub fn new(renderer: Arc<dyn Renderer>, compiler: Arc<dyn Compiler>, runtime: RuntimeFactory) -> Self {
        Self { renderer, compiler, runtime }
    }

    pub fn caps(&self) -> &Arc<KernelCaps> {
        self.renderer.caps()
    }
}

pub struct Device {
    name: String,
    family: String,
    allocator: Arc<LruAllocator>,
    memory: MemoryTracker,
    caps: FamilyCaps,
    backend: Option<Backend>,
}

impl Device {
    /// `allocator` is wrapped in the caching allocator.
    pub fn new(
        name: impl Into<String>,
        family: impl Into<String>,
        allocator: Box<dyn Allocator>,
        caps: FamilyCaps,
        backend: Option<Backend>,
    ) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            allocator: Arc::new(LruAllocator::new(allocator)),
            memory: MemoryTracker::new(),
            caps,
            backend,
        }
    }

    /// Canonical name, e.g. `"EMU:1"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn allocator(&self) -> &Arc<LruAllocator> {
        &self.allocator
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    pub fn caps(&self) -> FamilyCaps {
        self.caps
    }

    pub fn backend(&self) -> Result<&Backend> {
        self.backend.as_ref().ok_or_else(|| NoBackendSnafu { device: self.name.clone() }.build())
    }

    pub fn is_compute(&self) -> bool {
        self.backend.is_some()
    }

    /// Load compiled bytes as a program on this device.
    pub fn load(&self, entry: &str, lib: &[u8]) -> Result<Box<dyn Program>> {
        (self.backend()?.runtime)(entry, lib)
    }

    pub fn synchronize(&self) -> Result<()> {
        self.allocator.synchronize()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .field("compute", &self.is_compute())
            .finish()
    }
}
