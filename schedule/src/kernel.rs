//! The kernel lowering object.
//!
//! A [`Kernel`] owns a working copy of a [`KernelAst`] whose views are
//! reshaped as optimizations are applied. The iteration space is an ordered
//! list of axes laid out as
//!
//! ```text
//! [ global | local | group-reduce | reduce | upcast/unroll ]
//!   0 ..                           first_reduce ..     shape_len
//! ```
//!
//! Every optimization splits one axis with [`View::split`] on all views in
//! lockstep and moves the new part into its region, so buffer addressing is
//! unchanged while loop order and tiling change.

use std::sync::Arc;

use kiln_ir::{KernelAst, SInt, Variable, View, sint_prod};
use snafu::{ResultExt, ensure};
use tracing::trace;

use crate::caps::{KernelCaps, TensorCore};
use crate::error::*;
use crate::types::{AxisKind, Opt, OptOps};

#[derive(Debug, Clone)]
pub struct Kernel {
    ast: Arc<KernelAst>,
    lowered: KernelAst,
    caps: Arc<KernelCaps>,
    full_shape: Vec<SInt>,
    /// Count of leading non-reduce axes (globals and locals).
    first_reduce: usize,
    local_dims: usize,
    group_for_reduces: usize,
    upcasted: usize,
    dont_use_locals: bool,
    tensor_core: Option<TensorCore>,
    applied_opts: Vec<Opt>,
}

impl Kernel {
    /// Canonicalize the AST into the axis layout: unit axes dropped, reduce axes last.
    pub fn new(ast: Arc<KernelAst>, caps: Arc<KernelCaps>) -> Result<Self> {
        let mut lowered = (*ast).clone();

        let full = lowered.full_shape();
        for axis in (0..full.len()).rev() {
            if full[axis] == SInt::Const(1) {
                lowered.map_views(|v| {
                    *v = v.drop_axis(axis)?;
                    Ok(())
                })
                .context(ViewSnafu)?;
            }
        }

        let full_shape = lowered.full_shape();
        let out_shape = &lowered.stores()[0].view.shape;
        let is_reduce: Vec<bool> =
            full_shape.iter().zip(out_shape).map(|(f, o)| *o == SInt::Const(1) && *f != SInt::Const(1)).collect();
        let order: Vec<usize> =
            (0..full_shape.len()).filter(|&i| !is_reduce[i]).chain((0..full_shape.len()).filter(|&i| is_reduce[i])).collect();
        let first_reduce = is_reduce.iter().filter(|r| !**r).count();
        lowered
            .map_views(|v| {
                *v = v.permute(&order)?;
                Ok(())
            })
            .context(ViewSnafu)?;
        let full_shape = order.iter().map(|&i| full_shape[i].clone()).collect();

        Ok(Self {
            ast,
            lowered,
            caps,
            full_shape,
            first_reduce,
            local_dims: 0,
            group_for_reduces: 0,
            upcasted: 0,
            dont_use_locals: false,
            tensor_core: None,
            applied_opts: vec![],
        })
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    /// The untouched AST this kernel was built from.
    pub fn ast(&self) -> &Arc<KernelAst> {
        &self.ast
    }

    /// The AST with views reshaped to the current axis layout.
    pub fn lowered(&self) -> &KernelAst {
        &self.lowered
    }

    pub fn caps(&self) -> &Arc<KernelCaps> {
        &self.caps
    }

    pub fn full_shape(&self) -> &[SInt] {
        &self.full_shape
    }

    pub fn shape_len(&self) -> usize {
        self.full_shape.len()
    }

    pub fn first_reduce(&self) -> usize {
        self.first_reduce
    }

    pub fn global_dims(&self) -> usize {
        self.first_reduce - self.local_dims
    }

    pub fn local_dims(&self) -> usize {
        self.local_dims
    }

    pub fn group_for_reduces(&self) -> usize {
        self.group_for_reduces
    }

    pub fn upcasted(&self) -> usize {
        self.upcasted
    }

    pub fn applied_opts(&self) -> &[Opt] {
        &self.applied_opts
    }

    pub fn tensor_core(&self) -> Option<&TensorCore> {
        self.tensor_core.as_ref()
    }

    pub fn dont_use_locals(&self) -> bool {
        self.dont_use_locals
    }

    pub fn has_variable_shape(&self) -> bool {
        self.full_shape.iter().any(SInt::is_symbolic)
    }

    pub fn vars(&self) -> Vec<Variable> {
        self.lowered.vars().into_iter().collect()
    }

    /// Views of the working AST, stores first.
    pub fn views(&self) -> Vec<&View> {
        self.lowered.views()
    }

    pub fn has_reduce(&self) -> bool {
        self.lowered.reduce().is_some()
    }

    /// Does `axis` fold into the output (extent 1 in the store view)?
    fn output_is_unit(&self, axis: usize) -> bool {
        self.lowered.stores()[0].view.shape[axis] == SInt::Const(1) && self.full_shape[axis] != SInt::Const(1)
    }

    pub fn axis_kinds(&self) -> Vec<AxisKind> {
        let n = self.shape_len();
        (0..n)
            .map(|i| {
                if i < self.global_dims() {
                    AxisKind::Global
                } else if i < self.first_reduce {
                    AxisKind::Local
                } else if i < self.first_reduce + self.group_for_reduces {
                    AxisKind::GroupReduce
                } else if i < n - self.upcasted {
                    AxisKind::Reduce
                } else if self.output_is_unit(i) {
                    AxisKind::Unroll
                } else {
                    AxisKind::Upcast
                }
            })
            .collect()
    }

    /// Positions of every axis that folds into the output.
    pub fn reduce_axes(&self) -> Vec<usize> {
        self.axis_kinds().iter().enumerate().filter(|(_, k)| k.is_reduce()).map(|(i, _)| i).collect()
    }

    /// Product of the register tile (upcast and unroll extents).
    pub fn upcast_size(&self) -> i64 {
        let n = self.shape_len();
        self.full_shape[n - self.upcasted..].iter().filter_map(SInt::as_const).product()
    }

    /// Product of workgroup extents (locals and grouped reduces).
    pub fn local_size(&self) -> i64 {
        let start = self.global_dims();
        self.full_shape[start..self.first_reduce + self.group_for_reduces].iter().filter_map(SInt::as_const).product()
    }

    /// `r_` for reduce kernels, `E_` otherwise, then the extents.
    pub fn name(&self) -> String {
        let prefix = if self.has_reduce() { "r" } else { "E" };
        let dims: Vec<String> = self
            .full_shape
            .iter()
            .map(|s| match s {
                SInt::Const(v) => v.to_string(),
                other => other.vars().into_iter().map(|v| v.name).collect::<Vec<_>>().join(""),
            })
            .collect();
        if dims.is_empty() { prefix.to_string() } else { format!("{prefix}_{}", dims.join("_")) }
    }

    /// Launch grid as `(global, local)` triples, innermost first.
    ///
    /// Backends without workgroups get `(None, None)`; a kernel without local
    /// axes leaves `local` unset so the runner can pick one.
    pub fn launch_dims(&self) -> (Option<Vec<SInt>>, Option<Vec<SInt>>) {
        if !self.caps.has_local {
            return (None, None);
        }
        let global = fold_to_3(&self.full_shape[..self.global_dims()]);
        let local_axes = &self.full_shape[self.global_dims()..self.first_reduce + self.group_for_reduces];
        let local = (!local_axes.is_empty()).then(|| fold_to_3(local_axes));
        (Some(global), local)
    }

    /// ALU operations over the whole iteration space.
    pub fn op_estimate(&self) -> SInt {
        sint_prod(&self.full_shape) * self.lowered.alu_count() as i64
    }

    /// Bytes moved: every buffer's distinct footprint.
    pub fn mem_estimate(&self) -> SInt {
        let mut total = SInt::Const(0);
        let mut seen = std::collections::BTreeSet::new();
        for (buf, view, dtype) in self.buffer_views() {
            if !seen.insert(buf) {
                continue;
            }
            let footprint: Vec<SInt> = view
                .shape
                .iter()
                .zip(&view.strides)
                .filter(|(_, st)| **st != SInt::Const(0))
                .map(|(s, _)| s.clone())
                .collect();
            total = total + sint_prod(&footprint) * dtype.itemsize() as i64;
        }
        total
    }

    /// `(buffer, view, dtype)` for every access, stores first.
    pub fn buffer_views(&self) -> Vec<(usize, &View, &kiln_dtype::DType)> {
        self.lowered.accesses()
    }

    // ------------------------------------------------------------------
    // transformations
    // ------------------------------------------------------------------

    /// Split `axis` by `amount` and move the `amount` part before `insert_before`
    /// (end of the shape when `None`).
    fn shift_to(&mut self, axis: usize, amount: i64, top: bool, insert_before: Option<usize>) -> Result<()> {
        let mut lowered = self.lowered.clone();
        lowered
            .map_views(|v| {
                *v = v.split(axis, amount, top)?;
                Ok(())
            })
            .context(ViewSnafu)?;
        let mut shape_view = View::new(self.full_shape.clone(), vec![SInt::Const(0); self.shape_len()], SInt::Const(0))
            .context(ViewSnafu)?
            .split(axis, amount, top)
            .context(ViewSnafu)?;

        let new_len = self.shape_len() + 1;
        let move_axis = if top { axis } else { axis + 1 };
        let mut insert_before = insert_before.unwrap_or(self.shape_len());
        if move_axis < insert_before {
            insert_before += 1;
        }
        let order: Vec<usize> = (0..insert_before)
            .filter(|&i| i != move_axis)
            .chain(std::iter::once(move_axis))
            .chain((insert_before..new_len).filter(|&i| i != move_axis))
            .collect();
        lowered
            .map_views(|v| {
                *v = v.permute(&order)?;
                Ok(())
            })
            .context(ViewSnafu)?;
        shape_view = shape_view.permute(&order).context(ViewSnafu)?;

        self.lowered = lowered;
        self.full_shape = shape_view.shape;
        Ok(())
    }

    /// Resolve the absolute axis an optimization targets.
    fn real_axis(&self, opt: &Opt) -> Result<usize> {
        let axis = opt.axis.ok_or(OptError::MissingAxisParameter)?;
        let real = match opt.op {
            OptOps::UNROLL | OptOps::GROUP | OptOps::GROUPTOP => axis + self.first_reduce + self.group_for_reduces,
            _ => axis,
        };
        ensure!(real < self.shape_len(), AxisOutOfBoundsSnafu { axis: real, max: self.shape_len().saturating_sub(1) });
        Ok(real)
    }

    /// Apply one optimization, validating it against the current layout and
    /// the backend limits. A rejected optimization leaves the kernel unchanged.
    pub fn apply_opt(&mut self, opt: Opt) -> Result<()> {
        trace!(%opt, kernel.name = %self.name(), "apply_opt");
        match opt.op {
            OptOps::TC => {
                return ValidationFailedSnafu { op: OptOps::TC, reason: "use apply_tensor_cores" }.fail();
            }
            OptOps::NOLOCALS => {
                ensure!(
                    self.local_dims == 0 && self.group_for_reduces == 0,
                    ValidationFailedSnafu { op: opt.op, reason: "locals already applied" }
                );
                self.dont_use_locals = true;
                self.applied_opts.push(opt);
                return Ok(());
            }
            _ => {}
        }

        let axis = self.real_axis(&opt)?;
        let extent = self.full_shape[axis].as_const().ok_or(OptError::SymbolicDivisionError {
            amount: opt.arg.int().unwrap_or(0) as i64,
        })?;
        let amount = match opt.arg.int()? {
            0 => extent,
            a => a as i64,
        };
        ensure!(amount > 1, ValidationFailedSnafu { op: opt.op, reason: "split amount must be greater than 1" });
        ensure!(extent % amount == 0, DivisionSnafu { size: extent, amount });

        let reduce_start = self.first_reduce + self.group_for_reduces;
        let unupcasted_end = self.shape_len() - self.upcasted;
        match opt.op {
            OptOps::LOCAL => {
                ensure!(self.caps.has_local, UnsupportedFeatureSnafu { feature: "local" });
                ensure!(!self.dont_use_locals, ValidationFailedSnafu { op: opt.op, reason: "NOLOCALS is set" });
                ensure!(axis < self.global_dims(), ValidationFailedSnafu { op: opt.op, reason: "axis is not global" });
                let size = self.local_size() * amount;
                ensure!(
                    size <= self.caps.local_max as i64,
                    DeviceLimitExceededSnafu { limit_type: "local", value: size, max: self.caps.local_max as i64 }
                );
                self.shift_to(axis, amount, false, Some(self.first_reduce))?;
                self.local_dims += 1;
                self.first_reduce += 1;
            }
            OptOps::GROUP | OptOps::GROUPTOP => {
                ensure!(
                    self.caps.has_local && self.caps.has_shared,
                    UnsupportedFeatureSnafu { feature: "shared memory" }
                );
                ensure!(!self.dont_use_locals, ValidationFailedSnafu { op: opt.op, reason: "NOLOCALS is set" });
                ensure!(
                    axis >= reduce_start && axis < unupcasted_end,
                    ValidationFailedSnafu { op: opt.op, reason: "axis is not an ungrouped reduce" }
                );
                ensure!(
                    self.tensor_core.is_none(),
                    ValidationFailedSnafu { op: opt.op, reason: "cannot group a tensor core reduce" }
                );
                let size = self.local_size() * amount;
                ensure!(
                    size <= self.caps.local_max as i64,
                    DeviceLimitExceededSnafu { limit_type: "local", value: size, max: self.caps.local_max as i64 }
                );
                self.shift_to(axis, amount, opt.op == OptOps::GROUPTOP, Some(reduce_start))?;
                self.group_for_reduces += 1;
            }
            OptOps::UNROLL => {
                ensure!(
                    axis >= reduce_start && axis < unupcasted_end,
                    ValidationFailedSnafu { op: opt.op, reason: "axis is not an ungrouped reduce" }
                );
                ensure!(amount <= 32, DeviceLimitExceededSnafu { limit_type: "unroll", value: amount, max: 32 });
                self.check_upcast_limit(amount)?;
                self.shift_to(axis, amount, false, None)?;
                self.upcasted += 1;
            }
            OptOps::UPCAST => {
                ensure!(axis < self.global_dims(), ValidationFailedSnafu { op: opt.op, reason: "axis is not global" });
                ensure!(amount <= 8, DeviceLimitExceededSnafu { limit_type: "upcast", value: amount, max: 8 });
                self.check_upcast_limit(amount)?;
                self.shift_to(axis, amount, false, None)?;
                self.upcasted += 1;
            }
            OptOps::TC | OptOps::NOLOCALS => unreachable!("handled above"),
        }
        self.applied_opts.push(opt);
        Ok(())
    }

    fn check_upcast_limit(&self, amount: i64) -> Result<()> {
        let size = self.upcast_size() * amount;
        ensure!(
            size <= self.caps.upcast_max as i64,
            DeviceLimitExceededSnafu { limit_type: "upcast", value: size, max: self.caps.upcast_max as i64 }
        );
        Ok(())
    }

    pub(crate) fn set_tensor_core(&mut self, tc: Option<TensorCore>) {
        self.tensor_core = tc;
    }

    pub(crate) fn push_opt(&mut self, opt: Opt) {
        self.applied_opts.push(opt);
    }

    /// Transformations the backend cannot run without.
    ///
    /// Image buffers are addressed four texels at a time, so the unit-stride
    /// axis of every image access is upcast (or unrolled) by 4.
    pub fn required_optimizations(&mut self) -> Result<()> {
        let image_views: Vec<View> =
            self.buffer_views().into_iter().filter(|(_, _, dt)| dt.is_image()).map(|(_, v, _)| v.clone()).collect();
        for view in image_views {
            let unit_axis = (0..self.shape_len() - self.upcasted).find(|&i| {
                view.strides[i] == SInt::Const(1) && self.full_shape[i].as_const().is_some_and(|e| e % 4 == 0)
            });
            let Some(axis) = unit_axis else { continue };
            if axis < self.global_dims() {
                self.apply_opt(Opt::upcast(axis, 4))?;
            } else if axis >= self.first_reduce + self.group_for_reduces {
                self.apply_opt(Opt::unroll(axis - self.first_reduce - self.group_for_reduces, 4))?;
            }
        }
        Ok(())
    }
}

fn fold_to_3(dims: &[SInt]) -> Vec<SInt> {
    let mut out: Vec<SInt> = dims.iter().rev().cloned().collect();
    while out.len() > 3 {
        let last = out.pop().unwrap_or(SInt::Const(1));
        let prev = out.pop().unwrap_or(SInt::Const(1));
        out.push(prev * last);
    }
    out.resize(3, SInt::Const(1));
    out
}
