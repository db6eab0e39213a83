//! Hand-coded optimization heuristics.
//!
//! Applied in order: grouped reduce → broadcast upcasts → unroll →
//! default upcast → local dims. Every step only ever tries optimizations;
//! one the kernel rejects is skipped.

use itertools::Itertools;
use kiln_ir::SInt;
use tracing::debug;

use crate::config::HeuristicsConfig;
use crate::kernel::Kernel;
use crate::types::Opt;

/// Vectorization factor used when nothing more specific applies.
pub const DEFAULT_UPCAST_FACTOR: usize = 4;

pub fn hand_coded_optimizations(k: &mut Kernel, config: &HeuristicsConfig) {
    debug!(kernel.name = %k.name(), "hand_coded_optimizations: starting");

    if try_grouped_reduction(k, config) {
        debug!(kernel.name = %k.name(), "hand_coded_optimizations: grouped reduce applied");
        return;
    }
    apply_broadcast_upcasts(k, config);
    apply_unroll(k, config);
    if k.upcasted() == 0 {
        apply_default_upcast(k);
    }
    apply_local_dims(k, config);

    debug!(kernel.name = %k.name(), opts = k.applied_opts().len(), "hand_coded_optimizations: done");
}

fn extent(k: &Kernel, axis: usize) -> Option<i64> {
    k.full_shape().get(axis).and_then(SInt::as_const)
}

/// Small output, long reduce: split the reduce across the workgroup.
fn try_grouped_reduction(k: &mut Kernel, config: &HeuristicsConfig) -> bool {
    let caps = k.caps().clone();
    if !caps.has_local || !caps.has_shared || config.disable_locals || k.dont_use_locals() {
        return false;
    }
    let reduce_start = k.first_reduce() + k.group_for_reduces();
    if reduce_start >= k.shape_len() - k.upcasted() {
        return false;
    }
    let Some(output) = k.full_shape()[..k.first_reduce()].iter().map(SInt::as_const).product::<Option<i64>>() else {
        return false;
    };
    let reduce = extent(k, reduce_start).unwrap_or(0);
    if output > 2048 || reduce < config.grouped_threshold as i64 {
        return false;
    }
    [256, 16].into_iter().any(|sz| k.apply_opt(Opt::grouptop(0, sz)).is_ok())
}

/// Upcast global axes that some buffer broadcasts over, until the tile is big enough.
fn apply_broadcast_upcasts(k: &mut Kernel, config: &HeuristicsConfig) {
    while k.upcast_size() < config.upcast_target as i64 {
        let mut candidates: Vec<(usize, usize, usize)> = vec![];
        for axis in 0..k.global_dims() {
            let Some(e) = extent(k, axis) else { continue };
            let views = k.views();
            let broadcasts = views.iter().any(|v| v.strides[axis] == SInt::Const(0));
            if !broadcasts {
                continue;
            }
            let strided = views.iter().filter(|v| v.strides[axis] != SInt::Const(0)).count();
            for amount in [3, 4] {
                if e % amount == 0 && e > amount {
                    candidates.push((strided, axis, amount as usize));
                }
            }
        }
        candidates.sort();
        let Some(&(_, axis, amount)) = candidates.first() else { break };
        if k.apply_opt(Opt::upcast(axis, amount)).is_err() {
            break;
        }
    }
}

/// Unroll the innermost reduce completely when short, else by 4.
fn apply_unroll(k: &mut Kernel, config: &HeuristicsConfig) {
    let last = k.shape_len() - k.upcasted();
    if last == 0 || last <= k.first_reduce() + k.group_for_reduces() || k.upcast_size() >= 64 {
        return;
    }
    let axis = last - 1;
    let rel = axis - k.first_reduce() - k.group_for_reduces();
    let Some(e) = extent(k, axis) else { return };
    if e <= config.unroll_threshold as i64 {
        let _ = k.apply_opt(Opt::unroll(rel, 0));
    } else if e % 4 == 0 {
        let _ = k.apply_opt(Opt::unroll(rel, 4));
    }
}

fn apply_default_upcast(k: &mut Kernel) {
    let globals = k.global_dims();
    if globals == 0 {
        return;
    }
    if extent(k, globals - 1).is_some_and(|e| e % DEFAULT_UPCAST_FACTOR as i64 == 0 && e > 1) {
        let _ = k.apply_opt(Opt::upcast(globals - 1, DEFAULT_UPCAST_FACTOR));
    }
}

/// Build a workgroup from up to three global axes, broadcast axes first.
fn apply_local_dims(k: &mut Kernel, config: &HeuristicsConfig) {
    let caps = k.caps().clone();
    if !caps.has_local || config.disable_locals || k.dont_use_locals() {
        return;
    }
    let views = k.views();
    let mut ranking: Vec<(bool, usize)> = (0..k.global_dims())
        .map(|axis| (!views.iter().any(|v| v.strides[axis] == SInt::Const(0)), axis))
        .collect();
    ranking.sort();

    let mut local_size = 1i64;
    let mut to_local = vec![];
    for (_, axis) in ranking {
        let Some(e) = extent(k, axis) else { continue };
        let choices: &[i64] = if axis == 0 { &[32, 16, 8, 4, 3, 2] } else { &[16, 8, 4, 3, 2] };
        let limit = config.local_target.min(caps.local_max) as i64;
        if let Some(&sz) = choices.iter().find(|&&x| e % x == 0 && local_size * x <= limit) {
            to_local.push((axis, sz as usize));
            local_size *= sz;
        }
        if to_local.len() == 3 {
            break;
        }
    }
    for (axis, sz) in to_local.into_iter().sorted() {
        let _ = k.apply_opt(Opt::local(axis, sz));
    }
}
