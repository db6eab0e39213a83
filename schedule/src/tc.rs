//! Tensor-core lowering for matmul-shaped kernels.
//!
//! Matches `store(reduce_sum(load a * load b))` where each operand is
//! broadcast over the other's output axis, then tiles the N, M and K axes to
//! the tensor core's shape.

use kiln_ir::{AstNode, BinaryOp, ReduceOp, SInt, View};
use tracing::debug;

use crate::caps::{TcOpt, TensorCore};
use crate::config::TcUsage;
use crate::error::*;
use crate::kernel::Kernel;
use crate::types::Opt;

struct TcMatch {
    index: usize,
    axis_n: usize,
    axis_m: usize,
    axis_k: usize,
}

fn matmul_operands(k: &Kernel) -> Option<(&View, &View)> {
    let store = k.lowered().stores().first()?;
    if k.lowered().stores().len() != 1 {
        return None;
    }
    let AstNode::Reduce { op: ReduceOp::Sum, src, .. } = &store.src else { return None };
    let AstNode::Binary { op: BinaryOp::Mul, lhs, rhs } = src.as_ref() else { return None };
    match (lhs.as_ref(), rhs.as_ref()) {
        (AstNode::Load { view: a, .. }, AstNode::Load { view: b, .. }) => Some((a, b)),
        _ => None,
    }
}

fn find_match(k: &Kernel) -> Option<TcMatch> {
    let (a, b) = matmul_operands(k)?;
    let store = &k.lowered().stores()[0];
    let in_dtypes: Vec<_> = k.lowered().buffers().into_iter().skip(1).map(|(_, d)| d).collect();

    // Exactly one untouched reduce axis.
    let reduce_start = k.first_reduce() + k.group_for_reduces();
    let unupcasted_end = k.shape_len() - k.upcasted();
    if unupcasted_end != reduce_start + 1 || k.group_for_reduces() != 0 || k.local_dims() != 0 || k.upcasted() != 0 {
        return None;
    }
    let axis_k = reduce_start;

    let zero = SInt::Const(0);
    let pick = |x: &View, y: &View| (0..k.global_dims()).rev().find(|&i| x.strides[i] != zero && y.strides[i] == zero);
    let axis_n = pick(a, b)?;
    let axis_m = pick(b, a)?;

    k.caps().tensor_cores.iter().enumerate().find_map(|(index, tc)| {
        let fits = |axis: usize, dim: usize| k.full_shape()[axis].as_const().is_some_and(|e| e % dim as i64 == 0);
        let dtypes_ok = store.dtype == tc.dtype_out && in_dtypes.iter().all(|d| *d == tc.dtype_in);
        (dtypes_ok && fits(axis_n, tc.dims.0) && fits(axis_m, tc.dims.1) && fits(axis_k, tc.dims.2))
            .then_some(TcMatch { index, axis_n, axis_m, axis_k })
    })
}

/// Try to lower `k` onto a tensor core. Returns `false` (kernel unchanged)
/// when tensor cores are disabled, unavailable or the kernel does not match.
pub fn apply_tensor_cores(k: &mut Kernel, use_tc: TcUsage) -> Result<bool> {
    if use_tc == TcUsage::Disabled || k.caps().tensor_cores.is_empty() || !k.caps().has_local {
        return Ok(false);
    }
    let Some(m) = find_match(k) else { return Ok(false) };
    let tc: TensorCore = k.caps().tensor_cores[m.index].clone();

    let mut work = k.clone();
    work.push_opt(Opt::tc(m.index, use_tc.as_usize()));
    work.apply_opt(Opt::unroll(m.axis_k - work.first_reduce(), tc.dims.2))?;
    let axes = [m.axis_n, m.axis_m];
    for step in &tc.opts {
        match step {
            TcOpt::Local(dim) => work.apply_opt(Opt::local(axes[*dim], 2))?,
            TcOpt::Upcast(dim) => work.apply_opt(Opt::upcast(axes[*dim], 2))?,
        }
    }
    for dim in 0..2 {
        let rest = tc.remaining(dim);
        if rest > 1 {
            work.apply_opt(Opt::upcast(axes[dim], rest))?;
        }
    }
    work.set_tensor_core((use_tc == TcUsage::Enabled).then_some(tc));
    debug!(kernel.name = %work.name(), tc = m.index, "tensor cores applied");
    *k = work;
    Ok(true)
}
