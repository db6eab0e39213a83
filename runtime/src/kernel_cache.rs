//! Compiled-runner cache.
//!
//! Maps (device, kernel AST, search tier) to a shared [`CompiledRunner`].
//! Families that share binaries also get an entry under the family name, so a
//! kernel compiled for `EMU:0` is reused on `EMU:3` by reloading the same
//! artifact instead of compiling again.
//!
//! # Thread Safety
//!
//! Lookups and inserts go through papaya's lock-free map. Two threads racing
//! on the same key both compile, and the first insert wins.

use std::sync::Arc;

use kiln_ir::KernelAst;
use papaya::{Compute, HashMap, Operation};

use crate::runner::CompiledRunner;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Canonical device name, or the family name for family entries.
    pub device: String,
    pub ast: Arc<KernelAst>,
    pub tier: u32,
    pub family: bool,
}

impl MethodKey {
    pub fn device(device: &str, ast: &Arc<KernelAst>, tier: u32) -> Self {
        Self { device: device.to_string(), ast: Arc::clone(ast), tier, family: false }
    }

    pub fn family(family: &str, ast: &Arc<KernelAst>, tier: u32) -> Self {
        Self { device: family.to_string(), ast: Arc::clone(ast), tier, family: true }
    }
}

#[derive(Default)]
pub struct MethodCache {
    runners: HashMap<MethodKey, Arc<CompiledRunner>>,
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &MethodKey) -> Option<Arc<CompiledRunner>> {
        self.runners.pin().get(key).cloned()
    }

    /// Insert unless present; returns the runner now stored under `key`.
    pub fn insert(&self, key: MethodKey, runner: Arc<CompiledRunner>) -> Arc<CompiledRunner> {
        let guard = self.runners.guard();
        let outcome = self.runners.compute(
            key,
            |entry| match entry {
                Some((_, existing)) => Operation::Abort(Arc::clone(existing)),
                None => Operation::Insert(Arc::clone(&runner)),
            },
            &guard,
        );
        match outcome {
            Compute::Inserted(_, stored) => Arc::clone(stored),
            Compute::Aborted(existing) => existing,
            _ => runner,
        }
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn clear(&self) {
        self.runners.pin().clear();
    }
}
