//! The runtime context: configuration, devices, persistent stores and the
//! compiled-runner cache.
//!
//! A [`Runtime`] is passed explicitly to whatever launches kernels. Callers
//! that want one process-wide instance install it with [`init`] and remove it
//! with [`shutdown`]; nothing is created implicitly.

use std::sync::Arc;

use kiln_device::{Device, DeviceRegistry, ProgramSpec};
use kiln_ir::KernelAst;
use kiln_schedule::{
    CandidateEvaluator, Kernel, Search, apply_tensor_cores, hand_coded_optimizations, kernel_optimize,
};
use parking_lot::RwLock;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::devices::builtin_registry;
use crate::error::{DeviceSnafu, NotInitializedSnafu, OptSnafu, Result};
use crate::kernel_cache::{MethodCache, MethodKey};
use crate::runner::CompiledRunner;
use crate::search::{DeviceEvaluator, search_key};
use crate::store::{KeyValueStore, KoptTable, SledStore};

static GLOBAL: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Install `runtime` as the process-wide instance, replacing any previous one.
pub fn init(runtime: Runtime) -> Arc<Runtime> {
    let runtime = Arc::new(runtime);
    *GLOBAL.write() = Some(Arc::clone(&runtime));
    runtime
}

pub fn global() -> Result<Arc<Runtime>> {
    GLOBAL.read().clone().context(NotInitializedSnafu)
}

/// Remove the process-wide instance. Stores and caches go away with the last handle.
pub fn shutdown() -> Option<Arc<Runtime>> {
    GLOBAL.write().take()
}

pub struct Runtime {
    config: RuntimeConfig,
    registry: DeviceRegistry,
    methods: MethodCache,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Runtime {
    /// Built-in device families; the sled store is opened when caching is on.
    /// A store that fails to open only disables persistence.
    pub fn new(config: RuntimeConfig) -> Self {
        let registry = builtin_registry(&config);
        let store: Option<Arc<dyn KeyValueStore>> = if config.persistent() {
            match SledStore::open_default(&config) {
                Ok(store) => Some(Arc::new(store)),
                Err(err) => {
                    warn!(error = %err, "persistent cache disabled");
                    None
                }
            }
        } else {
            None
        };
        Self { config, registry, methods: MethodCache::new(), store }
    }

    /// Custom device table, no persistent store.
    pub fn with_registry(config: RuntimeConfig, registry: DeviceRegistry) -> Self {
        Self { config, registry, methods: MethodCache::new(), store: None }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn methods(&self) -> &MethodCache {
        &self.methods
    }

    /// The persistent store, unless `cache_level` is 0.
    pub fn store(&self) -> Option<&dyn KeyValueStore> {
        self.store.as_deref().filter(|_| self.config.persistent())
    }

    pub fn device(&self, name: &str) -> Result<Arc<Device>> {
        self.registry.resolve(name).context(DeviceSnafu)
    }

    pub fn default_device(&self) -> Result<Arc<Device>> {
        self.registry.default_device().context(DeviceSnafu)
    }

    /// Cached runner for `ast` on `device`, compiling on a miss.
    pub fn get_runner(&self, device: &Arc<Device>, ast: &Arc<KernelAst>) -> Result<Arc<CompiledRunner>> {
        let tier = self.config.strategy.beam_tier();
        let key = MethodKey::device(device.name(), ast, tier);
        if let Some(runner) = self.methods.get(&key) {
            return Ok(runner);
        }

        let shares = device.caps().shares_binaries;
        let family_key = MethodKey::family(device.family(), ast, tier);
        if shares && let Some(base) = self.methods.get(&family_key) {
            debug!(kernel.name = %base.spec().name, device = %device.name(), "reusing family binary");
            let runner = Arc::new(base.retarget(Arc::clone(device))?);
            return Ok(self.methods.insert(key, runner));
        }

        let kernel = self.optimize(device, ast)?;
        let runner = Arc::new(self.to_runner(device, &kernel)?);
        let runner = self.methods.insert(key, runner);
        if shares {
            self.methods.insert(family_key, Arc::clone(&runner));
        }
        Ok(runner)
    }

    pub fn get_runner_by_name(&self, device: &str, ast: &Arc<KernelAst>) -> Result<Arc<CompiledRunner>> {
        let device = self.device(device)?;
        self.get_runner(&device, ast)
    }

    /// Lower `ast` for `device`: required optimizations, then tensor cores or
    /// hand-coded heuristics, then measured search when a tier is set. With
    /// `beam_compare` the searched kernel must also out-time the heuristic ones.
    pub fn optimize(&self, device: &Arc<Device>, ast: &Arc<KernelAst>) -> Result<Kernel> {
        let caps = Arc::clone(device.backend().context(DeviceSnafu)?.caps());
        let mut k = Kernel::new(Arc::clone(ast), Arc::clone(&caps)).context(OptSnafu)?;
        k.required_optimizations().context(OptSnafu)?;
        if self.config.strategy.is_none() {
            return Ok(k);
        }

        let heuristics = &self.config.heuristics;
        let used_tc = apply_tensor_cores(&mut k, heuristics.tc_enabled).context(OptSnafu)?;
        if !used_tc {
            hand_coded_optimizations(&mut k, heuristics);
        }
        let tier = self.config.strategy.beam_tier();
        if tier == 0 {
            return Ok(k);
        }

        let evaluator = DeviceEvaluator::new(Arc::clone(device), Arc::clone(ast))?;
        let kopt = self.store().map(KoptTable);
        let mut search = Search::new(&self.config.search, heuristics, tier);
        if let Some(table) = &kopt {
            search = search.with_store(table);
        }
        let mut searched = evaluator.create_kernel()?;
        let choice = kernel_optimize(&mut searched, &evaluator, &search_key(device.family(), tier, ast), &search);
        if self.config.debug >= 2 {
            info!(kernel.name = %searched.name(), %choice, "search applied");
        }
        if !self.config.beam_compare {
            return Ok(searched);
        }

        let time = |label: &str, kernel: &Kernel| {
            let ms = evaluator.time_kernel(kernel, &self.config.search).unwrap_or_else(|err| {
                debug!(label, error = %err, "comparison run failed");
                f64::INFINITY
            });
            if self.config.debug >= 1 {
                info!(kernel.name = %kernel.name(), label, ms, "comparison");
            }
            ms
        };
        let mut contenders = vec![(if used_tc { "tc" } else { "hc" }, k)];
        if used_tc {
            let mut hc = evaluator.create_kernel()?;
            hand_coded_optimizations(&mut hc, heuristics);
            contenders.push(("hc", hc));
        }
        // The searched kernel wins ties.
        let mut best_ms = time("beam", &searched);
        let mut best = searched;
        for (label, kernel) in contenders {
            let ms = time(label, &kernel);
            if ms < best_ms {
                (best, best_ms) = (kernel, ms);
            }
        }
        Ok(best)
    }

    fn to_runner(&self, device: &Arc<Device>, kernel: &Kernel) -> Result<CompiledRunner> {
        let backend = device.backend().context(DeviceSnafu)?;
        let spec = ProgramSpec::from_kernel(kernel, &*backend.renderer, device.name()).context(DeviceSnafu)?;
        if self.config.debug >= 4 {
            info!(kernel.name = %spec.name, src = %spec.src, "kernel source");
        }
        CompiledRunner::new(spec, Arc::clone(device), None, self.store())
    }
}
