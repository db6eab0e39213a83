//! Kernel optimization for kiln.
//!
//! - [`kernel`] - the lowering object and [`Opt`] application
//! - [`heuristics`] - hand-coded optimizations
//! - [`tc`] - tensor-core lowering
//! - [`search`] - measured search over per-axis choices
//! - [`caps`] - what a backend can render
//! - [`config`] - optimization strategy and tuning knobs

pub mod caps;
pub mod config;
pub mod error;
pub mod heuristics;
pub mod kernel;
pub mod search;
pub mod tc;
pub mod types;

#[cfg(test)]
pub mod test;

pub use caps::{KernelCaps, TcOpt, TensorCore};
pub use config::{HeuristicsConfig, OptStrategy, SearchConfig, TcUsage};
pub use error::{OptError, Result};
pub use heuristics::hand_coded_optimizations;
pub use kernel::Kernel;
pub use search::{
    CandidateEvaluator, Choice, ChoiceKind, ChoiceStore, MemoryChoiceStore, Search, SearchChoice, apply_choices,
    choice_menu, get_divisors, kernel_optimize, kernel_optimize_search, run_and_time,
};
pub use tc::apply_tensor_cores;
pub use types::{AxisKind, Opt, OptArg, OptOps};
