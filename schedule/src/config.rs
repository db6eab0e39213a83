//! Optimizer configuration types.
//!
//! Typed configuration with bon builders and environment variable readers.

use bon::bon;

// ============================================================================
// OPTIMIZATION STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptStrategy {
    /// Only required transformations (`NOOPT=1`).
    None,

    /// Tensor cores or hand-coded heuristics.
    #[default]
    Heuristic,

    /// Heuristics plus measured search at the given budget tier (`BEAM=N`).
    Beam { tier: u32 },
}

impl OptStrategy {
    /// * `NOOPT=1` - disable all optimizations
    /// * `BEAM=N` - search with tier N (0 disables)
    pub fn from_env() -> Self {
        if env_parse::<u32>("NOOPT").unwrap_or(0) > 0 {
            return Self::None;
        }
        match env_parse::<u32>("BEAM") {
            Some(tier) if tier > 0 => Self::Beam { tier },
            _ => Self::Heuristic,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Search tier, `0` when search is off. Part of every kernel cache key.
    pub fn beam_tier(&self) -> u32 {
        match self {
            Self::Beam { tier } => *tier,
            _ => 0,
        }
    }
}

// ============================================================================
// TENSOR CORE SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TcUsage {
    /// `TC=0`.
    Disabled,

    /// `TC=1`, default.
    #[default]
    Enabled,

    /// `TC=2`: apply the tensor-core loop shape without emitting tensor-core instructions.
    ShapeOnly,
}

impl TcUsage {
    pub fn from_env() -> Self {
        match env_parse::<usize>("TC") {
            Some(0) => Self::Disabled,
            Some(2) => Self::ShapeOnly,
            _ => Self::Enabled,
        }
    }

    pub fn as_usize(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Enabled => 1,
            Self::ShapeOnly => 2,
        }
    }
}

// ============================================================================
// HEURISTICS CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct HeuristicsConfig {
    pub tc_enabled: TcUsage,
    /// Smallest reduce extent worth splitting across a workgroup.
    pub grouped_threshold: usize,
    /// Largest trailing reduce extent unrolled completely.
    pub unroll_threshold: usize,
    /// Upcasting stops once the register tile reaches this size.
    pub upcast_target: usize,
    /// Largest workgroup the heuristics will build.
    pub local_target: usize,
    pub disable_locals: bool,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl HeuristicsConfig {
    #[builder]
    pub fn builder(
        #[builder(default)] tc_enabled: TcUsage,
        #[builder(default = 256)] grouped_threshold: usize,
        #[builder(default = 32)] unroll_threshold: usize,
        #[builder(default = 32)] upcast_target: usize,
        #[builder(default = 128)] local_target: usize,
        #[builder(default = false)] disable_locals: bool,
    ) -> Self {
        Self { tc_enabled, grouped_threshold, unroll_threshold, upcast_target, local_target, disable_locals }
    }

    /// * `TC` - tensor core usage (0/1/2)
    /// * `NOLOCALS=1` - never build workgroups
    pub fn from_env() -> Self {
        Self {
            tc_enabled: TcUsage::from_env(),
            disable_locals: env_parse::<u32>("NOLOCALS").unwrap_or(0) > 0,
            ..Default::default()
        }
    }
}

// ============================================================================
// SEARCH CONFIGURATION
// ============================================================================

/// Configuration for measured optimization search.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Candidates evaluated per search tier.
    pub budget_per_tier: usize,
    /// Size of the compile worker pool.
    pub workers: usize,
    /// Timed runs after the first one.
    pub timing_runs: usize,
    /// Runs used to measure the hand-coded baseline.
    pub baseline_runs: usize,
    /// A first run slower than `slow_factor x baseline` is not re-timed.
    pub slow_factor: f64,
    /// Loss reported for candidates that fail to compile or run, in ms.
    pub failure_loss_ms: f64,
    /// Kernels with a baseline under this many microseconds are not searched.
    pub threshold_us: f64,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4).min(16)
}

#[bon]
impl SearchConfig {
    #[builder]
    pub fn builder(
        #[builder(default = 100)] budget_per_tier: usize,
        #[builder(default = default_workers())] workers: usize,
        #[builder(default = 10)] timing_runs: usize,
        #[builder(default = 5)] baseline_runs: usize,
        #[builder(default = 5.0)] slow_factor: f64,
        #[builder(default = 10_000.0)] failure_loss_ms: f64,
        #[builder(default = 0.0)] threshold_us: f64,
        #[builder(default = 0)] seed: u64,
    ) -> Self {
        Self {
            budget_per_tier,
            workers: workers.max(1),
            timing_runs,
            baseline_runs: baseline_runs.max(1),
            slow_factor,
            failure_loss_ms,
            threshold_us,
            seed,
        }
    }

    /// * `KOPT_BUDGET` - candidates per tier (default: 100)
    /// * `KOPT_WORKERS` - compile workers (default: min(16, cores))
    /// * `KOPT_THRESH` - minimum baseline in microseconds (default: 0)
    /// * `KOPT_SEED` - optimizer seed (default: 0)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self::builder()
            .budget_per_tier(env_parse("KOPT_BUDGET").unwrap_or(defaults.budget_per_tier))
            .workers(env_parse("KOPT_WORKERS").unwrap_or(defaults.workers))
            .threshold_us(env_parse("KOPT_THRESH").unwrap_or(defaults.threshold_us))
            .seed(env_parse("KOPT_SEED").unwrap_or(defaults.seed))
            .build()
    }

    pub fn budget(&self, tier: u32) -> usize {
        self.budget_per_tier * tier as usize
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

// ============================================================================
// TESTS
// ============================================================================
