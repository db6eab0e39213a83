//! Runtime configuration.
//!
//! Every knob has a typed field, a bon builder default and an environment
//! variable read by [`RuntimeConfig::from_env`].

use std::path::PathBuf;

use bon::bon;
use kiln_schedule::{HeuristicsConfig, OptStrategy, SearchConfig};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub strategy: OptStrategy,
    /// Verbosity, 0-7.
    pub debug: u8,
    /// 0 disables the persistent stores.
    pub cache_level: u32,
    /// Root of the persistent stores; the user cache directory when unset.
    pub cache_dir: Option<PathBuf>,
    /// After a search, time it against the heuristic kernels and keep the fastest.
    pub beam_compare: bool,
    /// Keep freed allocations in the device free-lists.
    pub lru: bool,
    /// Device returned by `default_device` instead of probing.
    pub preferred_device: Option<String>,
    pub search: SearchConfig,
    pub heuristics: HeuristicsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl RuntimeConfig {
    #[builder]
    pub fn builder(
        #[builder(default)] strategy: OptStrategy,
        #[builder(default = 0)] debug: u8,
        #[builder(default = 2)] cache_level: u32,
        cache_dir: Option<PathBuf>,
        #[builder(default = true)] beam_compare: bool,
        #[builder(default = true)] lru: bool,
        preferred_device: Option<String>,
        #[builder(default)] search: SearchConfig,
        #[builder(default)] heuristics: HeuristicsConfig,
    ) -> Self {
        Self {
            strategy,
            debug: debug.min(7),
            cache_level,
            cache_dir,
            beam_compare,
            lru,
            preferred_device,
            search,
            heuristics,
        }
    }

    /// * `BEAM`, `NOOPT` - optimization strategy
    /// * `DEBUG` - verbosity (default: 0)
    /// * `CACHELEVEL` - 0 disables persistent stores (default: 2)
    /// * `CACHEDIR` - store location
    /// * `BEAM_COMPARE` - compare search results with heuristics (default: 1)
    /// * `LRU` - free-list caching (default: 1)
    /// * `DEVICE` - preferred default device
    /// * `TC`, `NOLOCALS`, `KOPT_*` - see [`HeuristicsConfig`] and [`SearchConfig`]
    pub fn from_env() -> Self {
        Self::builder()
            .strategy(OptStrategy::from_env())
            .debug(env_parse("DEBUG").unwrap_or(0))
            .cache_level(env_parse("CACHELEVEL").unwrap_or(2))
            .maybe_cache_dir(std::env::var_os("CACHEDIR").map(PathBuf::from))
            .beam_compare(env_parse::<u32>("BEAM_COMPARE").unwrap_or(1) > 0)
            .lru(env_parse::<u32>("LRU").unwrap_or(1) > 0)
            .maybe_preferred_device(std::env::var("DEVICE").ok().filter(|d| !d.trim().is_empty()))
            .search(SearchConfig::from_env())
            .heuristics(HeuristicsConfig::from_env())
            .build()
    }

    pub fn persistent(&self) -> bool {
        self.cache_level > 0
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
