//! Black-box optimizers over a discrete product space.
//!
//! A candidate is one index per dimension. The search loop asks for
//! candidates, evaluates them and tells back a loss (lower is better) plus a
//! constraint violation (`> 0` means the candidate is infeasible and must
//! never be recommended).

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait BlackBoxOptimizer: Send {
    /// Next candidate to evaluate, `None` once the budget or space is exhausted.
    fn ask(&mut self) -> Option<Vec<usize>>;
    fn tell(&mut self, candidate: &[usize], loss: f64, constraint_violation: f64);
    /// Best feasible candidate seen so far with its loss.
    fn recommend(&self) -> Option<(Vec<usize>, f64)>;
    fn num_ask(&self) -> usize;
    fn num_tell(&self) -> usize;
    fn budget(&self) -> usize;
}

/// Builds an optimizer for `dims` (choices per dimension), a budget and a seed.
pub type OptimizerFactory = dyn Fn(&[usize], usize, u64) -> Box<dyn BlackBoxOptimizer> + Sync;

/// Default factory.
pub fn evolutionary(dims: &[usize], budget: usize, seed: u64) -> Box<dyn BlackBoxOptimizer> {
    Box::new(EvolutionaryOptimizer::new(dims.to_vec(), budget, seed))
}

/// Random exploration followed by single-dimension mutations of the incumbent.
///
/// The first candidate is always all zeros (every dimension at its first
/// choice). A quarter of the budget samples uniformly; the rest mutates
/// the best feasible point.
#[derive(Debug)]
pub struct EvolutionaryOptimizer {
    dims: Vec<usize>,
    budget: usize,
    space: usize,
    explore: usize,
    rng: StdRng,
    seen: HashSet<Vec<usize>>,
    asked: usize,
    told: usize,
    best: Option<(Vec<usize>, f64)>,
}

const MAX_RETRIES: usize = 64;
const ENUMERATE_LIMIT: usize = 1 << 16;

impl EvolutionaryOptimizer {
    pub fn new(dims: Vec<usize>, budget: usize, seed: u64) -> Self {
        let space = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d.max(1))).unwrap_or(usize::MAX);
        let budget = budget.min(space);
        Self {
            dims,
            budget,
            space,
            explore: (budget / 4).max(1),
            rng: StdRng::seed_from_u64(seed),
            seen: HashSet::new(),
            asked: 0,
            told: 0,
            best: None,
        }
    }

    fn random(&mut self) -> Vec<usize> {
        let dims = self.dims.clone();
        dims.into_iter().map(|d| self.rng.gen_range(0..d.max(1))).collect()
    }

    fn mutate(&mut self, base: &[usize]) -> Vec<usize> {
        let mut out = base.to_vec();
        let movable: Vec<usize> = (0..self.dims.len()).filter(|&i| self.dims[i] > 1).collect();
        if movable.is_empty() {
            return out;
        }
        let dim = movable[self.rng.gen_range(0..movable.len())];
        let choices = self.dims[dim];
        let step = self.rng.gen_range(1..choices);
        out[dim] = (out[dim] + step) % choices;
        out
    }

    fn propose(&mut self) -> Vec<usize> {
        if self.asked == 0 {
            return vec![0; self.dims.len()];
        }
        match self.best.clone() {
            Some((best, _)) if self.asked >= self.explore => self.mutate(&best),
            _ => self.random(),
        }
    }

    fn first_unseen(&self) -> Option<Vec<usize>> {
        let mut idx = vec![0usize; self.dims.len()];
        loop {
            if !self.seen.contains(&idx) {
                return Some(idx);
            }
            let mut d = self.dims.len();
            loop {
                if d == 0 {
                    return None;
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < self.dims[d].max(1) {
                    break;
                }
                idx[d] = 0;
            }
        }
    }
}

impl BlackBoxOptimizer for EvolutionaryOptimizer {
    fn ask(&mut self) -> Option<Vec<usize>> {
        if self.asked >= self.budget || self.seen.len() >= self.space {
            return None;
        }
        let mut candidate = self.propose();
        let mut retries = 0;
        while self.seen.contains(&candidate) && retries < MAX_RETRIES {
            candidate = if retries % 2 == 0 { self.random() } else { self.propose() };
            retries += 1;
        }
        if self.seen.contains(&candidate) && self.space <= ENUMERATE_LIMIT {
            candidate = self.first_unseen()?;
        }
        self.seen.insert(candidate.clone());
        self.asked += 1;
        Some(candidate)
    }

    fn tell(&mut self, candidate: &[usize], loss: f64, constraint_violation: f64) {
        self.told += 1;
        if constraint_violation > 0.0 || !loss.is_finite() {
            return;
        }
        if self.best.as_ref().is_none_or(|(_, best)| loss < *best) {
            self.best = Some((candidate.to_vec(), loss));
        }
    }

    fn recommend(&self) -> Option<(Vec<usize>, f64)> {
        self.best.clone()
    }

    fn num_ask(&self) -> usize {
        self.asked
    }

    fn num_tell(&self) -> usize {
        self.told
    }

    fn budget(&self) -> usize {
        self.budget
    }
}
