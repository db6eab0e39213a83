use std::cell::{Cell, OnceCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use kiln_dtype::{DType, Element};
use snafu::ensure;
use tracing::trace;

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::device::Device;
use crate::error::{AlreadyAllocatedSnafu, Error, InvalidViewSnafu, Result, SizeMismatchSnafu};

struct BufferData {
    device: Arc<Device>,
    /// Element count.
    size: usize,
    dtype: DType,
    options: BufferOptions,
    /// Lazily allocated handle.
    raw: OnceCell<RawBuffer>,
    /// Root buffer and byte offset into it, for views.
    base: Option<(Buffer, usize)>,
    lb_refcount: Cell<usize>,
}

impl BufferData {
    fn nbytes(&self) -> usize {
        self.size * self.dtype.itemsize()
    }

    fn tracked(&self) -> bool {
        !self.device.caps().pass_through
    }
}

impl Drop for BufferData {
    fn drop(&mut self) {
        if let Some((base, _)) = &self.base {
            base.data.lb_refcount.set(base.data.lb_refcount.get().saturating_sub(1));
            return;
        }
        if let Some(raw) = self.raw.take() {
            let nbytes = self.nbytes();
            if self.tracked() {
                self.device.memory().free(nbytes);
            }
            self.device.allocator().free(raw, nbytes, &self.options);
        }
    }
}

/// `size` elements of `dtype` on a device.
///
/// A base buffer owns its (lazily allocated) storage. A view is a byte window
/// into a base buffer: it shares the allocation, keeps the base alive and
/// bumps its `lb_refcount` while it exists. Views of views point at the root.
///
/// Cloning is cheap and yields the same buffer. `Buffer` is `!Send`.
#[derive(Clone)]
pub struct Buffer {
    data: Rc<BufferData>,
}

impl Buffer {
    pub fn new(device: Arc<Device>, size: usize, dtype: DType, options: BufferOptions) -> Self {
        Self {
            data: Rc::new(BufferData {
                device,
                size,
                dtype,
                options,
                raw: OnceCell::new(),
                base: None,
                lb_refcount: Cell::new(0),
            }),
        }
    }

    /// Allocated buffer holding `values`.
    pub fn from_slice<T: Element>(device: Arc<Device>, values: &[T]) -> Result<Self> {
        let buffer = Self::new(device, values.len(), T::DTYPE, BufferOptions::default());
        buffer.copyin(&T::to_bytes(values))?;
        Ok(buffer)
    }

    /// `size` elements of `dtype` starting `offset` bytes into this buffer.
    pub fn view(&self, size: usize, dtype: DType, offset: usize) -> Result<Buffer> {
        let nbytes = size * dtype.itemsize();
        ensure!(offset < self.nbytes(), InvalidViewSnafu { offset, size: nbytes, buffer_size: self.nbytes() });
        let (root, root_offset) = match &self.data.base {
            Some((root, base_offset)) => (root.clone(), base_offset + offset),
            None => (self.clone(), offset),
        };
        ensure!(
            root_offset + nbytes <= root.nbytes(),
            InvalidViewSnafu { offset: root_offset, size: nbytes, buffer_size: root.nbytes() }
        );
        root.add_ref(1);
        Ok(Self {
            data: Rc::new(BufferData {
                device: Arc::clone(&root.data.device),
                size,
                dtype,
                options: root.data.options,
                raw: OnceCell::new(),
                base: Some((root, root_offset)),
                lb_refcount: Cell::new(0),
            }),
        })
    }

    pub fn is_allocated(&self) -> bool {
        self.data.raw.get().is_some()
    }

    /// Allocate storage; errors if already allocated.
    pub fn allocate(&self) -> Result<()> {
        ensure!(!self.is_allocated(), AlreadyAllocatedSnafu);
        self.ensure_allocated()
    }

    /// Allocate storage unless already allocated. Views allocate their base
    /// first and derive their handle from it.
    pub fn ensure_allocated(&self) -> Result<()> {
        if self.is_allocated() {
            return Ok(());
        }
        let raw = match &self.data.base {
            Some((base, offset)) => {
                base.ensure_allocated()?;
                let base_raw = base.raw()?;
                self.allocator().offset(&base_raw, self.nbytes(), *offset)?
            }
            None => {
                let raw = self.allocator().alloc(self.nbytes(), &self.data.options)?;
                self.track_alloc();
                raw
            }
        };
        let _ = self.data.raw.set(raw);
        Ok(())
    }

    /// Adopt an existing allocation of exactly `nbytes`.
    pub fn allocate_with(&self, raw: RawBuffer) -> Result<()> {
        ensure!(!self.is_allocated(), AlreadyAllocatedSnafu);
        ensure!(self.data.base.is_none(), AlreadyAllocatedSnafu);
        ensure!(raw.size() == self.nbytes(), SizeMismatchSnafu { expected: self.nbytes(), actual: raw.size() });
        self.track_alloc();
        let _ = self.data.raw.set(raw);
        Ok(())
    }

    fn track_alloc(&self) {
        trace!(device = %self.device().name(), bytes = self.nbytes(), "buffer allocated");
        if self.data.tracked() {
            self.device().memory().alloc(self.nbytes());
        }
    }

    pub fn raw(&self) -> Result<RawBuffer> {
        self.data.raw.get().cloned().ok_or(Error::NotAllocated)
    }

    /// Address of this buffer's first byte, for kernel launches.
    pub fn data_ptr(&self) -> Result<*mut u8> {
        Ok(self.raw()?.as_ptr())
    }

    pub fn copyin(&self, src: &[u8]) -> Result<()> {
        ensure!(src.len() == self.nbytes(), SizeMismatchSnafu { expected: self.nbytes(), actual: src.len() });
        self.ensure_allocated()?;
        self.allocator().copyin(&self.raw()?, src)
    }

    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        ensure!(dst.len() == self.nbytes(), SizeMismatchSnafu { expected: self.nbytes(), actual: dst.len() });
        self.ensure_allocated()?;
        self.allocator().synchronize()?;
        self.allocator().copyout(dst, &self.raw()?)
    }

    /// Host copy of the contents.
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.nbytes()];
        self.copyout(&mut out)?;
        Ok(out)
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(T::from_bytes(&self.as_bytes()?))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.data.device
    }

    pub fn allocator(&self) -> &dyn Allocator {
        &**self.data.device.allocator()
    }

    pub fn size(&self) -> usize {
        self.data.size
    }

    pub fn dtype(&self) -> &DType {
        &self.data.dtype
    }

    pub fn options(&self) -> BufferOptions {
        self.data.options
    }

    pub fn nbytes(&self) -> usize {
        self.data.nbytes()
    }

    /// The root buffer, for views.
    pub fn base(&self) -> Option<&Buffer> {
        self.data.base.as_ref().map(|(b, _)| b)
    }

    /// Byte offset into the root buffer.
    pub fn offset(&self) -> usize {
        self.data.base.as_ref().map_or(0, |(_, off)| *off)
    }

    pub fn lb_refcount(&self) -> usize {
        self.data.lb_refcount.get()
    }

    /// Adjust the reference count held by the lazy graph.
    pub fn add_ref(&self, n: usize) {
        self.data.lb_refcount.set(self.data.lb_refcount.get() + n);
    }

    /// Identity of this buffer while it is alive.
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.data) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Handle that does not keep the buffer alive.
    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer(Rc::downgrade(&self.data))
    }
}

/// Non-owning reference to a [`Buffer`].
#[derive(Clone)]
pub struct WeakBuffer(Weak<BufferData>);

impl WeakBuffer {
    pub fn upgrade(&self) -> Option<Buffer> {
        self.0.upgrade().map(|data| Buffer { data })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Buffer {}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.data).hash(state);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Buffer");
        s.field("device", &self.device().name())
            .field("size", &self.size())
            .field("dtype", &self.dtype().to_string())
            .field("allocated", &self.is_allocated());
        if self.base().is_some() {
            s.field("offset", &self.offset());
        }
        s.finish()
    }
}
