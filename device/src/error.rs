use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The allocator could not satisfy a request, even after evicting its cache.
    #[snafu(display("{device}: out of memory allocating {size} bytes"))]
    OutOfMemory { device: String, size: usize },

    #[snafu(display("{device}: zero-sized allocation"))]
    ZeroSizeAllocation { device: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Malformed device string or an index the family does not provide.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("unknown device family: {family}"))]
    UnknownFamily { family: String },

    /// A compute device was requested from a thread other than the registry owner.
    #[snafu(display("device {device} must be opened from the coordinating thread"))]
    WrongContext { device: String },

    #[snafu(display("no usable device among {tried:?}"))]
    NoUsableDevice { tried: Vec<String> },

    #[snafu(display("{device} has no compiler backend"))]
    NoBackend { device: String },

    #[snafu(display("buffer not allocated"))]
    NotAllocated,

    #[snafu(display("buffer already allocated"))]
    AlreadyAllocated,

    #[snafu(display("invalid view: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidView { offset: usize, size: usize, buffer_size: usize },

    #[snafu(display("{device} does not support {op}"))]
    Unsupported { device: String, op: &'static str },

    /// Compilation failed. Never retried.
    #[snafu(display("compile failed: {log}"))]
    CompileFailed { src: String, log: String },

    #[snafu(display("kernel {name} failed: {reason}"))]
    Execution { name: String, reason: String },

    #[snafu(display("render failed: {source}"))]
    Render { source: kiln_schedule::OptError },

    #[snafu(display("{source}"))]
    Ir { source: kiln_ir::Error },
}
