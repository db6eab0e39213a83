//! Measured kernel optimization search.
//!
//! The search space is a product of per-axis choice lists ([`choice_menu`]).
//! Candidates are compiled on a fixed-size worker pool and timed on the
//! calling thread, which is also the only writer of the [`ChoiceStore`].
//! A result is kept only if it beats the hand-coded baseline.

pub mod optimizer;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::{HeuristicsConfig, SearchConfig};
use crate::error::*;
use crate::heuristics::hand_coded_optimizations;
use crate::kernel::Kernel;
use crate::types::Opt;

pub use optimizer::{BlackBoxOptimizer, EvolutionaryOptimizer, OptimizerFactory, evolutionary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ChoiceKind {
    #[strum(to_string = "U")]
    Upcast,
    #[strum(to_string = "L")]
    Local,
    #[strum(to_string = "R")]
    Unroll,
    #[strum(to_string = "G")]
    GroupTop,
}

/// One coordinate of a candidate: split `axis` by `amount` as `kind`.
///
/// Global axes (`U`, `L`) are absolute; reduce axes (`R`, `G`) count from
/// the first ungrouped reduce axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Choice {
    pub axis: usize,
    pub amount: usize,
    pub kind: ChoiceKind,
}

impl Choice {
    pub fn to_opt(&self) -> Opt {
        match self.kind {
            ChoiceKind::Upcast => Opt::upcast(self.axis, self.amount),
            ChoiceKind::Local => Opt::local(self.axis, self.amount),
            ChoiceKind::Unroll => Opt::unroll(self.axis, self.amount),
            ChoiceKind::GroupTop => Opt::grouptop(self.axis, self.amount),
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.axis, self.amount, self.kind)
    }
}

/// Outcome of a search, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchChoice {
    /// Nothing beat the hand-coded heuristics.
    Baseline,
    Opts(Vec<Choice>),
}

/// Persistent map from a kernel's string identity to its search outcome.
pub trait ChoiceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<SearchChoice>;
    fn put(&self, key: &str, choice: &SearchChoice);
}

#[derive(Debug, Default)]
pub struct MemoryChoiceStore {
    entries: Mutex<HashMap<String, SearchChoice>>,
}

impl MemoryChoiceStore {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ChoiceStore for MemoryChoiceStore {
    fn get(&self, key: &str) -> Option<SearchChoice> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: &str, choice: &SearchChoice) {
        self.entries.lock().insert(key.to_string(), choice.clone());
    }
}

/// Compiles and times candidates for one kernel.
///
/// `create_kernel` and `compile` run on worker threads; `time` only ever runs
/// on the thread that called the search.
pub trait CandidateEvaluator: Sync {
    type Program: Send;
    type Error: fmt::Display + Send;

    /// A fresh kernel with required optimizations applied.
    fn create_kernel(&self) -> Result<Kernel, Self::Error>;
    fn compile(&self, kernel: &Kernel) -> Result<Self::Program, Self::Error>;
    /// One synchronous, timed execution.
    fn time(&self, program: &Self::Program) -> Result<Duration, Self::Error>;
}

/// Search parameters for one call.
pub struct Search<'a> {
    pub config: &'a SearchConfig,
    pub heuristics: &'a HeuristicsConfig,
    pub tier: u32,
    pub store: Option<&'a dyn ChoiceStore>,
    pub make_optimizer: &'a OptimizerFactory,
}

impl<'a> Search<'a> {
    pub fn new(config: &'a SearchConfig, heuristics: &'a HeuristicsConfig, tier: u32) -> Self {
        Self { config, heuristics, tier, store: None, make_optimizer: &evolutionary }
    }

    pub fn with_store(mut self, store: &'a dyn ChoiceStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_optimizer(mut self, make_optimizer: &'a OptimizerFactory) -> Self {
        self.make_optimizer = make_optimizer;
        self
    }
}

/// `1` (when `min_div > 1`) followed by the divisors of `n` in `[min_div, min(max_div, n/2)]`.
pub fn get_divisors(n: i64, min_div: i64, max_div: i64) -> Vec<i64> {
    let mut out = vec![];
    if min_div > 1 {
        out.push(1);
    }
    out.extend((min_div..=max_div.min(n / 2)).filter(|d| n % d == 0));
    out
}

/// Per-axis choice lists for `k`. Dimensions with a single choice are omitted.
pub fn choice_menu(k: &Kernel) -> Vec<Vec<Choice>> {
    let shape = k.full_shape();
    let mut menu = vec![];
    let mut push = |list: Vec<Choice>| {
        if list.len() > 1 {
            menu.push(list);
        }
    };

    for axis in 0..k.global_dims() {
        let Some(n) = shape[axis].as_const() else { continue };
        let build = |divs: Vec<i64>, kind: ChoiceKind| -> Vec<Choice> {
            divs.into_iter().map(|s| Choice { axis, amount: s as usize, kind }).collect()
        };
        push(build(get_divisors(n, 1, 8), ChoiceKind::Upcast));
        push(build(get_divisors(n, 4, 512), ChoiceKind::Local));
    }

    let reduce_start = k.first_reduce() + k.group_for_reduces();
    let views = k.views();
    for real in reduce_start..k.shape_len() - k.upcasted() {
        let Some(n) = shape[real].as_const() else { continue };
        let axis = real - reduce_start;
        push(get_divisors(n, 1, 8).into_iter().map(|s| Choice { axis, amount: s as usize, kind: ChoiceKind::Unroll }).collect());
        let keeps_views = |s: i64| {
            views.iter().all(|v| match v.shape[real].as_const() {
                Some(e) => e % s == 0 || e == 1,
                None => false,
            })
        };
        push(
            get_divisors(n, 4, 512)
                .into_iter()
                .filter(|&s| keeps_views(s))
                .map(|s| Choice { axis, amount: s as usize, kind: ChoiceKind::GroupTop })
                .collect(),
        );
    }
    menu
}

/// Apply a candidate; amounts of 1 are no-ops. The kernel is left untouched on failure.
pub fn apply_choices(k: &mut Kernel, choices: &[Choice]) -> Result<()> {
    let mut work = k.clone();
    for choice in choices.iter().filter(|c| c.amount != 1) {
        work.apply_opt(choice.to_opt())?;
    }
    *k = work;
    Ok(())
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// First run; if it is already far slower than the baseline report it as is,
/// otherwise the best of it and `timing_runs` more.
pub fn run_and_time<E: CandidateEvaluator>(
    evaluator: &E,
    program: &E::Program,
    baseline_ms: f64,
    config: &SearchConfig,
) -> Result<f64, E::Error> {
    let first = ms(evaluator.time(program)?);
    if baseline_ms * config.slow_factor < first {
        return Ok(first);
    }
    let mut best = first;
    for _ in 0..config.timing_runs {
        best = best.min(ms(evaluator.time(program)?));
    }
    Ok(best)
}

fn compile_candidate<E: CandidateEvaluator>(evaluator: &E, choices: &[Choice]) -> Result<E::Program, String> {
    let mut k = evaluator.create_kernel().map_err(|e| e.to_string())?;
    trace!(kernel.name = %k.name(), choices = ?choices.iter().filter(|c| c.amount != 1).collect::<Vec<_>>(), "compiling candidate");
    apply_choices(&mut k, choices).map_err(|e| e.to_string())?;
    evaluator.compile(&k).map_err(|e| e.to_string())
}

/// Search the menu of `k` against `baseline_ms`.
pub fn kernel_optimize_search<E: CandidateEvaluator>(
    k: &Kernel,
    evaluator: &E,
    baseline_ms: f64,
    search: &Search<'_>,
) -> SearchChoice {
    let menu = choice_menu(k);
    if menu.is_empty() {
        return SearchChoice::Baseline;
    }
    let dims: Vec<usize> = menu.iter().map(Vec::len).collect();
    let space = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).unwrap_or(usize::MAX);
    let config = search.config;
    let mut optimizer = (search.make_optimizer)(&dims, config.budget(search.tier).min(space), config.seed);
    let budget = optimizer.budget();
    let started = Instant::now();

    let pool = rayon::ThreadPoolBuilder::new().num_threads(config.workers).build().ok();
    let to_choices =
        |cand: &[usize]| -> Vec<Choice> { cand.iter().zip(&menu).map(|(&i, list)| list[i]).collect() };

    let (mut best, mut ran) = (config.failure_loss_ms, 0usize);
    while optimizer.num_tell() < budget {
        let mut batch = vec![];
        while batch.len() < config.workers && optimizer.num_ask() < budget {
            match optimizer.ask() {
                Some(c) => batch.push(c),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        let compile_all = || -> Vec<Result<E::Program, String>> {
            batch.par_iter().map(|c| compile_candidate(evaluator, &to_choices(c))).collect()
        };
        let compiled = match &pool {
            Some(pool) => pool.install(compile_all),
            None => batch.iter().map(|c| compile_candidate(evaluator, &to_choices(c))).collect(),
        };

        for (cand, program) in batch.iter().zip(compiled) {
            let timed = program.and_then(|p| run_and_time(evaluator, &p, baseline_ms, config).map_err(|e| e.to_string()));
            match timed {
                Ok(tm) => {
                    optimizer.tell(cand, tm, 0.0);
                    ran += 1;
                    if tm < best {
                        best = tm;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "candidate failed");
                    optimizer.tell(cand, config.failure_loss_ms, 1.0);
                }
            }
        }
    }

    let recommendation = optimizer.recommend();
    info!(
        kernel.name = %k.name(),
        space,
        ran,
        elapsed_s = started.elapsed().as_secs_f64(),
        baseline_ms,
        best_ms = best,
        "optimizer search finished"
    );
    match recommendation {
        Some((cand, loss)) if loss < baseline_ms => SearchChoice::Opts(to_choices(&cand)),
        _ => SearchChoice::Baseline,
    }
}

/// Minimum of `baseline_runs` timings of the hand-coded kernel, in ms.
fn measure_baseline<E: CandidateEvaluator>(evaluator: &E, search: &Search<'_>) -> Result<f64, String> {
    let mut k = evaluator.create_kernel().map_err(|e| e.to_string())?;
    hand_coded_optimizations(&mut k, search.heuristics);
    let program = evaluator.compile(&k).map_err(|e| e.to_string())?;
    let mut best = f64::INFINITY;
    for _ in 0..search.config.baseline_runs {
        best = best.min(ms(evaluator.time(&program).map_err(|e| e.to_string())?));
    }
    Ok(best)
}

/// Optimize `k` in place: cached choice, else search (fixed shapes only),
/// else hand-coded heuristics. Returns the choice that was applied.
pub fn kernel_optimize<E: CandidateEvaluator>(
    k: &mut Kernel,
    evaluator: &E,
    key: &str,
    search: &Search<'_>,
) -> SearchChoice {
    let cached = search.store.and_then(|s| s.get(key));
    let choice = if let Some(choice) = cached {
        debug!(kernel.name = %k.name(), ?choice, "search choice from cache");
        choice
    } else if k.has_variable_shape() {
        SearchChoice::Baseline
    } else {
        match measure_baseline(evaluator, search) {
            Ok(baseline) if baseline >= search.config.threshold_us / 1000.0 => {
                let choice = kernel_optimize_search(k, evaluator, baseline, search);
                if let Some(store) = search.store {
                    store.put(key, &choice);
                }
                debug!(kernel.name = %k.name(), ?choice, "search choice");
                choice
            }
            Ok(_) => SearchChoice::Baseline,
            Err(err) => {
                debug!(error = %err, "baseline failed, keeping heuristics");
                SearchChoice::Baseline
            }
        }
    };

    match &choice {
        SearchChoice::Opts(choices) if apply_choices(k, choices).is_ok() => {}
        _ => hand_coded_optimizations(k, search.heuristics),
    }
    choice
}

impl SearchChoice {
    /// JSON encoding used by persistent stores.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

impl fmt::Display for SearchChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchChoice::Baseline => write!(f, "BASELINE"),
            SearchChoice::Opts(choices) => {
                let shown: Vec<String> = choices.iter().filter(|c| c.amount != 1).map(Choice::to_string).collect();
                write!(f, "[{}]", shown.join(", "))
            }
        }
    }
}
