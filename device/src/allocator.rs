use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, trace};

use crate::error::{Error, OutOfMemorySnafu, Result, SizeMismatchSnafu, UnsupportedSnafu, ZeroSizeAllocationSnafu};

/// Allocation options. Two allocations are interchangeable in the cache iff
/// their byte size and options are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferOptions {
    pub image: bool,
    pub uncached: bool,
    pub cpu_access: bool,
    pub host: bool,
    /// Never keep this allocation in the free-list.
    pub nolru: bool,
}

/// Host-resident storage behind one allocation.
///
/// The boxed slice is created once and never replaced or resized, so its
/// address is fixed for the life of the allocation.
pub struct HostMemory {
    bytes: Mutex<Box<[u8]>>,
}

impl HostMemory {
    fn zeroed(size: usize) -> Self {
        Self { bytes: Mutex::new(vec![0u8; size].into_boxed_slice()) }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory").field("len", &self.bytes.lock().len()).finish()
    }
}

/// Opaque handle to device memory: an allocation plus a byte window into it.
///
/// Equality is handle identity, not content.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    memory: Arc<HostMemory>,
    offset: usize,
    size: usize,
}

impl RawBuffer {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Do both handles point at the same allocation?
    pub fn same_allocation(&self, other: &RawBuffer) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    /// Address of the first byte of this window.
    ///
    /// The lock only guards taking the address. [`HostMemory`] never moves
    /// its storage, so the pointer stays valid while any handle to the
    /// allocation is alive; writing through it must not overlap a concurrent
    /// `copyin`/`copyout` on the same bytes.
    pub fn as_ptr(&self) -> *mut u8 {
        let mut bytes = self.memory.bytes.lock();
        // SAFETY: `offset` is within the allocation by construction.
        unsafe { bytes.as_mut_ptr().add(self.offset) }
    }

    fn write(&self, src: &[u8]) -> Result<()> {
        ensure!(src.len() == self.size, SizeMismatchSnafu { expected: self.size, actual: src.len() });
        self.memory.bytes.lock()[self.offset..self.offset + self.size].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, dst: &mut [u8]) -> Result<()> {
        ensure!(dst.len() == self.size, SizeMismatchSnafu { expected: self.size, actual: dst.len() });
        dst.copy_from_slice(&self.memory.bytes.lock()[self.offset..self.offset + self.size]);
        Ok(())
    }

    fn window(&self, size: usize, offset: usize) -> Result<RawBuffer> {
        ensure!(
            offset + size <= self.size,
            crate::error::InvalidViewSnafu { offset, size, buffer_size: self.size }
        );
        Ok(RawBuffer { memory: Arc::clone(&self.memory), offset: self.offset + offset, size })
    }
}

impl PartialEq for RawBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.same_allocation(other) && self.offset == other.offset && self.size == other.size
    }
}

impl Eq for RawBuffer {}

pub trait Allocator: Send + Sync + fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, raw: RawBuffer, size: usize, options: &BufferOptions);
    fn copyin(&self, dst: &RawBuffer, src: &[u8]) -> Result<()>;
    fn copyout(&self, dst: &mut [u8], src: &RawBuffer) -> Result<()>;

    /// Sub-buffer handle for views.
    fn offset(&self, _raw: &RawBuffer, _size: usize, _offset: usize) -> Result<RawBuffer> {
        UnsupportedSnafu { device: self.name().to_string(), op: "buffer views" }.fail()
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

impl<A: Allocator + ?Sized> Allocator for Arc<A> {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        (**self).alloc(size, options)
    }

    fn free(&self, raw: RawBuffer, size: usize, options: &BufferOptions) {
        (**self).free(raw, size, options)
    }

    fn copyin(&self, dst: &RawBuffer, src: &[u8]) -> Result<()> {
        (**self).copyin(dst, src)
    }

    fn copyout(&self, dst: &mut [u8], src: &RawBuffer) -> Result<()> {
        (**self).copyout(dst, src)
    }

    fn offset(&self, raw: &RawBuffer, size: usize, offset: usize) -> Result<RawBuffer> {
        (**self).offset(raw, size, offset)
    }

    fn synchronize(&self) -> Result<()> {
        (**self).synchronize()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Heap allocator with an optional byte capacity.
#[derive(Debug)]
pub struct HostAllocator {
    name: String,
    capacity: Option<usize>,
    in_use: AtomicUsize,
    allocations: AtomicUsize,
}

impl HostAllocator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), capacity: None, in_use: AtomicUsize::new(0), allocations: AtomicUsize::new(0) }
    }

    /// Fail with `OutOfMemory` once more than `bytes` are live.
    pub fn with_capacity(name: impl Into<String>, bytes: usize) -> Self {
        Self { capacity: Some(bytes), ..Self::new(name) }
    }

    /// Number of allocations that reached this allocator.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        ensure!(size > 0, ZeroSizeAllocationSnafu { device: self.name.clone() });
        let reserved = self.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| match self.capacity {
            Some(cap) if used + size > cap => None,
            _ => Some(used + size),
        });
        if reserved.is_err() {
            return OutOfMemorySnafu { device: self.name.clone(), size }.fail();
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(device = %self.name, bytes = size, "host alloc");
        Ok(RawBuffer { memory: Arc::new(HostMemory::zeroed(size)), offset: 0, size })
    }

    fn free(&self, _raw: RawBuffer, size: usize, _options: &BufferOptions) {
        let _ = self.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| Some(u.saturating_sub(size)));
    }

    fn copyin(&self, dst: &RawBuffer, src: &[u8]) -> Result<()> {
        dst.write(src)
    }

    fn copyout(&self, dst: &mut [u8], src: &RawBuffer) -> Result<()> {
        src.read(dst)
    }

    fn offset(&self, raw: &RawBuffer, size: usize, offset: usize) -> Result<RawBuffer> {
        raw.window(size, offset)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Caching allocator: freed handles go to a free-list keyed by
/// `(size, options)` and are handed back out before calling through.
#[derive(Debug)]
pub struct LruAllocator {
    inner: Box<dyn Allocator>,
    cache: Mutex<HashMap<(usize, BufferOptions), Vec<RawBuffer>>>,
    enabled: AtomicBool,
}

impl LruAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        Self { inner, cache: Mutex::new(HashMap::new()), enabled: AtomicBool::new(true) }
    }

    /// Caching on/off. Turning it off does not drop already cached handles.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Return every cached handle to the inner allocator.
    pub fn free_cache(&self) {
        let drained: Vec<_> = self.cache.lock().drain().collect();
        for ((size, options), handles) in drained {
            for raw in handles {
                self.inner.free(raw, size, &options);
            }
        }
    }

    pub fn cached_bytes(&self) -> usize {
        self.cache.lock().iter().map(|((size, _), handles)| size * handles.len()).sum()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().values().map(Vec::len).sum()
    }

    pub fn inner(&self) -> &dyn Allocator {
        &*self.inner
    }
}

impl Allocator for LruAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        {
            let mut cache = self.cache.lock();
            if let Some(raw) = cache.get_mut(&(size, *options)).and_then(Vec::pop) {
                return Ok(raw);
            }
        }

        match self.inner.alloc(size, options) {
            Err(Error::OutOfMemory { .. }) => {
                debug!(device = %self.name(), bytes = size, cached = self.cached_bytes(), "out of memory, evicting cache");
                self.free_cache();
                self.inner.alloc(size, options)
            }
            other => other,
        }
    }

    fn free(&self, raw: RawBuffer, size: usize, options: &BufferOptions) {
        if options.nolru || !self.is_enabled() {
            self.inner.free(raw, size, options);
            return;
        }
        self.cache.lock().entry((size, *options)).or_default().push(raw);
    }

    fn copyin(&self, dst: &RawBuffer, src: &[u8]) -> Result<()> {
        self.inner.copyin(dst, src)
    }

    fn copyout(&self, dst: &mut [u8], src: &RawBuffer) -> Result<()> {
        self.inner.copyout(dst, src)
    }

    fn offset(&self, raw: &RawBuffer, size: usize, offset: usize) -> Result<RawBuffer> {
        self.inner.offset(raw, size, offset)
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl Drop for LruAllocator {
    fn drop(&mut self) {
        self.free_cache();
    }
}
