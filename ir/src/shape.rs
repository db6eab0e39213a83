//! Strided views over flat buffers.
//!
//! A [`View`] maps an n-dimensional index `i` to the flat element offset
//! `offset + sum(i[d] * strides[d])`. Broadcast dimensions carry stride 0.
//! All views inside one kernel share a rank; kernel transformations reshape
//! every view in lockstep through [`View::split`] and [`View::permute`].

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::*;
use crate::sint::{SInt, VarVals, Variable, sint_prod};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    pub shape: Vec<SInt>,
    pub strides: Vec<SInt>,
    pub offset: SInt,
}

/// A view with every symbolic quantity substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedView {
    pub shape: Vec<usize>,
    pub strides: Vec<i64>,
    pub offset: i64,
}

impl ResolvedView {
    pub fn index(&self, idx: &[usize]) -> i64 {
        self.offset + idx.iter().zip(&self.strides).map(|(&i, &s)| i as i64 * s).sum::<i64>()
    }

    /// `(lowest, one past highest)` flat offset reached, `None` for an empty view.
    pub fn extent(&self) -> Option<(i64, i64)> {
        if self.shape.contains(&0) {
            return None;
        }
        let (mut lo, mut hi) = (self.offset, self.offset);
        for (&extent, &stride) in self.shape.iter().zip(&self.strides) {
            let reach = (extent as i64 - 1) * stride;
            if reach < 0 { lo += reach } else { hi += reach }
        }
        Some((lo, hi + 1))
    }
}

impl View {
    /// Row-major contiguous view of `shape`.
    pub fn contiguous<S: Into<SInt>>(shape: impl IntoIterator<Item = S>) -> Self {
        let shape: Vec<SInt> = shape.into_iter().map(Into::into).collect();
        let mut strides = vec![SInt::Const(0); shape.len()];
        let mut acc = SInt::Const(1);
        for (d, extent) in shape.iter().enumerate().rev() {
            strides[d] = if *extent == SInt::Const(1) { SInt::Const(0) } else { acc.clone() };
            acc = acc * extent.clone();
        }
        Self { shape, strides, offset: SInt::Const(0) }
    }

    pub fn new(shape: Vec<SInt>, strides: Vec<SInt>, offset: SInt) -> Result<Self> {
        ensure!(shape.len() == strides.len(), RankMismatchSnafu { expected: shape.len(), actual: strides.len() });
        Ok(Self { shape, strides, offset })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements addressed.
    pub fn size(&self) -> SInt {
        sint_prod(&self.shape)
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == SInt::Const(0) && *self == View::contiguous(self.shape.clone())
    }

    /// Broadcast extent-1 dimensions to `shape`.
    pub fn expand(&self, shape: &[SInt]) -> Result<View> {
        ensure!(shape.len() == self.ndim(), RankMismatchSnafu { expected: self.ndim(), actual: shape.len() });
        let mut out = self.clone();
        for (axis, (cur, target)) in self.shape.iter().zip(shape).enumerate() {
            if cur == target {
                continue;
            }
            ensure!(
                *cur == SInt::Const(1),
                InvalidExpandSnafu { axis, extent: cur.to_string(), target: target.to_string() }
            );
            out.shape[axis] = target.clone();
            out.strides[axis] = SInt::Const(0);
        }
        Ok(out)
    }

    pub fn permute(&self, order: &[usize]) -> Result<View> {
        let valid = order.len() == self.ndim() && order.iter().copied().sorted().eq(0..self.ndim());
        ensure!(valid, InvalidPermutationSnafu { order: order.to_vec(), rank: self.ndim() });
        Ok(View {
            shape: order.iter().map(|&i| self.shape[i].clone()).collect(),
            strides: order.iter().map(|&i| self.strides[i].clone()).collect(),
            offset: self.offset.clone(),
        })
    }

    /// Split `axis` into two adjacent axes, the second of extent `amount`.
    ///
    /// With `top` set the *first* axis gets extent `amount` instead. An axis
    /// of extent 1 splits into two extent-1 axes regardless of `amount`.
    pub fn split(&self, axis: usize, amount: i64, top: bool) -> Result<View> {
        ensure!(axis < self.ndim(), AxisOutOfRangeSnafu { axis, rank: self.ndim() });
        let extent = &self.shape[axis];
        let stride = self.strides[axis].clone();
        let (outer, inner) = if *extent == SInt::Const(1) {
            ((SInt::Const(1), SInt::Const(0)), (SInt::Const(1), SInt::Const(0)))
        } else {
            let Some(n) = extent.as_const() else {
                return SymbolicSplitSnafu { axis, extent: extent.to_string() }.fail();
            };
            ensure!(amount > 0 && n % amount == 0, IndivisibleSplitSnafu { axis, extent: n, amount });
            let rest = n / amount;
            if top {
                ((SInt::Const(amount), stride.clone() * rest), (SInt::Const(rest), stride))
            } else {
                ((SInt::Const(rest), stride.clone() * amount), (SInt::Const(amount), stride))
            }
        };
        let mut out = self.clone();
        out.shape.splice(axis..=axis, [outer.0, inner.0]);
        out.strides.splice(axis..=axis, [outer.1, inner.1]);
        Ok(out)
    }

    /// Remove an axis of extent 1.
    pub fn drop_axis(&self, axis: usize) -> Result<View> {
        ensure!(axis < self.ndim(), AxisOutOfRangeSnafu { axis, rank: self.ndim() });
        ensure!(
            self.shape[axis] == SInt::Const(1),
            InvalidExpandSnafu { axis, extent: self.shape[axis].to_string(), target: "1".to_string() }
        );
        let mut out = self.clone();
        out.shape.remove(axis);
        out.strides.remove(axis);
        Ok(out)
    }

    pub fn vars(&self) -> BTreeSet<Variable> {
        let mut out = BTreeSet::new();
        for v in self.shape.iter().chain(&self.strides).chain(std::iter::once(&self.offset)) {
            v.collect_vars(&mut out);
        }
        out
    }

    pub fn resolve(&self, vals: &VarVals) -> Result<ResolvedView> {
        Ok(ResolvedView {
            shape: crate::sint::resolve_all(&self.shape, vals)?,
            strides: self.strides.iter().map(|s| s.resolve(vals)).collect::<Result<_>>()?,
            offset: self.offset.resolve(vals)?,
        })
    }

    /// One past the largest flat element offset this view can touch.
    pub fn span(&self) -> i64 {
        let mut hi = self.offset.bounds().1;
        for (extent, stride) in self.shape.iter().zip(&self.strides) {
            let (_, e) = extent.bounds();
            let (_, s) = stride.bounds();
            hi += (e - 1).max(0) * s.max(0);
        }
        hi + 1
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "View(shape=({}), strides=({}), offset={})",
            self.shape.iter().join(", "),
            self.strides.iter().join(", "),
            self.offset
        )
    }
}
