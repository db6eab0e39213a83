//! Error types for kernel execution.

use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"))]
    Device { source: kiln_device::Error },

    #[snafu(display("optimization failed: {source}"))]
    Opt { source: kiln_schedule::OptError },

    #[snafu(display("{source}"))]
    Ir { source: kiln_ir::Error },

    /// The persistent store could not be opened or written.
    #[snafu(display("cache store {path}: {source}"))]
    Store { path: String, source: sled::Error },

    #[snafu(display("no process-wide runtime installed"))]
    NotInitialized,

    #[snafu(display("no cache directory available"))]
    NoCacheDir,

    /// Every local size tried by the tuner failed to launch.
    #[snafu(display("all local sizes failed for kernel {name}"))]
    LocalSizeFailed { name: String },

    #[snafu(display("{name} takes {expected} buffers, got {actual}"))]
    ArgumentCount { name: String, expected: usize, actual: usize },

    /// A launch argument does not fit how the kernel accesses it.
    #[snafu(display("kernel {name} argument {index}: {reason}"))]
    BufferMismatch { name: String, index: usize, reason: String },

    #[snafu(display("schedule item mixes devices {devices:?}"))]
    MixedDevices { devices: Vec<String> },

    #[snafu(display("cannot lower schedule item: {reason}"))]
    Lowering { reason: String },

    #[snafu(display("duplicate inputs to JIT"))]
    JitDuplicateInputs,

    #[snafu(display("JIT captured no kernels"))]
    JitNothingCaptured,

    /// Some input buffer is never read by the captured launches.
    #[snafu(display("JIT inputs {missing:?} not found in the captured launches"))]
    JitInputNotFound { missing: Vec<usize> },

    #[snafu(display("JIT variables mismatch: captured {expected:?}, got {actual:?}"))]
    JitVariableMismatch { expected: Vec<String>, actual: Vec<String> },

    #[snafu(display("JIT input signature mismatch at input {position}"))]
    JitSignatureMismatch { position: usize },

    /// A launch during capture used a value other than the one the JIT was called with.
    #[snafu(display("variable {name} launched with {actual} but captured with {expected:?}"))]
    JitVarValueMismatch { name: String, expected: Option<i64>, actual: i64 },
}

impl From<kiln_device::Error> for Error {
    fn from(source: kiln_device::Error) -> Self {
        Error::Device { source }
    }
}
