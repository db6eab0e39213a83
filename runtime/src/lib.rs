//! Kernel execution for kiln.
//!
//! - [`runtime`] - the explicit context: devices, stores and compiled runners
//! - [`runner`] - compiled kernels and copies behind one launch interface
//! - [`kernel_cache`] - runners keyed by device, kernel and search tier
//! - [`search`] - candidate timing for measured optimization
//! - [`jit`] - capture and replay of launch sequences
//! - [`schedule`] - lowering and running schedule items
//! - [`store`] - persistent compile and search tables
//! - [`devices`] - the built-in `CPU`, `EMU` and `DISK` families

pub mod config;
pub mod devices;
pub mod error;
pub mod jit;
pub mod kernel_cache;
pub mod runner;
pub mod runtime;
pub mod schedule;
pub mod search;
pub mod store;

#[cfg(test)]
pub mod test;

pub use config::RuntimeConfig;
pub use devices::builtin_registry;
pub use error::{Error, Result};
pub use jit::{InputSignature, Jit, JitItem, JitState, JitStats, Launcher, TensorRef};
pub use kernel_cache::{MethodCache, MethodKey};
pub use runner::{BufferCopy, CompiledRunner, Runner, compile_cached, compile_key, optimize_local_size};
pub use runtime::{Runtime, global, init, shutdown};
pub use schedule::{ScheduleItem, ScheduleOp, lower_schedule_item, run_schedule};
pub use search::{DeviceEvaluator, search_key};
pub use store::{KeyValueStore, KoptTable, MemoryStore, SledStore};
