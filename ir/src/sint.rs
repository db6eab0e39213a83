//! Symbolic integers.
//!
//! Launch dimensions, view extents, strides and offsets are `SInt`s: either a
//! concrete constant or an expression over bounded [`Variable`]s whose values
//! are only known at launch time. Constructors fold constants eagerly, so a
//! fully concrete expression is always `SInt::Const`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ensure};

use crate::error::*;

/// A named integer unknown at compile time, with an inclusive value range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub min: i64,
    pub max: i64,
}

impl Variable {
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self { name: name.into(), min, max }
    }

    /// Check `value` against the declared range and pair it with this variable.
    pub fn bind(&self, value: i64) -> Result<(Variable, i64)> {
        ensure!(
            (self.min..=self.max).contains(&value),
            BindValueOutOfRangeSnafu { name: self.name.clone(), value, min: self.min, max: self.max }
        );
        Ok((self.clone(), value))
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}-{}]", self.name, self.min, self.max)
    }
}

/// Concrete values for the variables of a launch.
///
/// Ordered so two maps with the same keys compare and print identically.
pub type VarVals = BTreeMap<Variable, i64>;

/// Build a [`VarVals`] from `(variable, value)` pairs, range-checking each one.
pub fn bind_all<'a>(pairs: impl IntoIterator<Item = (&'a Variable, i64)>) -> Result<VarVals> {
    pairs.into_iter().map(|(var, val)| var.bind(val)).collect()
}

/// Symbolic integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SInt {
    Const(i64),
    Var(Variable),
    Add(Box<SInt>, Box<SInt>),
    Mul(Box<SInt>, Box<SInt>),
    /// Floor division by a positive constant.
    FloorDiv(Box<SInt>, i64),
}

impl SInt {
    pub fn is_const(&self) -> bool {
        matches!(self, SInt::Const(_))
    }

    pub fn is_symbolic(&self) -> bool {
        !self.is_const()
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            SInt::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn floor_div(self, divisor: i64) -> Result<SInt> {
        ensure!(divisor > 0, DivisionByZeroSnafu);
        Ok(match self {
            SInt::Const(v) => SInt::Const(v.div_euclid(divisor)),
            other if divisor == 1 => other,
            other => SInt::FloorDiv(Box::new(other), divisor),
        })
    }

    /// Collect every variable referenced by this expression.
    pub fn collect_vars(&self, out: &mut BTreeSet<Variable>) {
        match self {
            SInt::Const(_) => {}
            SInt::Var(v) => {
                out.insert(v.clone());
            }
            SInt::Add(a, b) | SInt::Mul(a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
            SInt::FloorDiv(a, _) => a.collect_vars(out),
        }
    }

    pub fn vars(&self) -> BTreeSet<Variable> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    /// Evaluate with concrete variable values.
    pub fn resolve(&self, vals: &VarVals) -> Result<i64> {
        Ok(match self {
            SInt::Const(v) => *v,
            SInt::Var(v) => *vals.get(v).context(UnboundVariableSnafu { name: v.name.clone() })?,
            SInt::Add(a, b) => a.resolve(vals)? + b.resolve(vals)?,
            SInt::Mul(a, b) => a.resolve(vals)? * b.resolve(vals)?,
            SInt::FloorDiv(a, d) => a.resolve(vals)?.div_euclid(*d),
        })
    }

    /// Inclusive bounds over all admissible variable values.
    ///
    /// Exact for sums and products of non-negative terms, which is all that
    /// shapes and strides ever produce.
    pub fn bounds(&self) -> (i64, i64) {
        match self {
            SInt::Const(v) => (*v, *v),
            SInt::Var(v) => (v.min, v.max),
            SInt::Add(a, b) => {
                let ((alo, ahi), (blo, bhi)) = (a.bounds(), b.bounds());
                (alo + blo, ahi + bhi)
            }
            SInt::Mul(a, b) => {
                let ((alo, ahi), (blo, bhi)) = (a.bounds(), b.bounds());
                let corners = [alo * blo, alo * bhi, ahi * blo, ahi * bhi];
                (*corners.iter().min().unwrap_or(&0), *corners.iter().max().unwrap_or(&0))
            }
            SInt::FloorDiv(a, d) => {
                let (lo, hi) = a.bounds();
                (lo.div_euclid(*d), hi.div_euclid(*d))
            }
        }
    }
}

impl From<i64> for SInt {
    fn from(value: i64) -> Self {
        SInt::Const(value)
    }
}

impl From<usize> for SInt {
    fn from(value: usize) -> Self {
        SInt::Const(value as i64)
    }
}

impl From<i32> for SInt {
    fn from(value: i32) -> Self {
        SInt::Const(value as i64)
    }
}

impl From<Variable> for SInt {
    fn from(value: Variable) -> Self {
        SInt::Var(value)
    }
}

impl From<&Variable> for SInt {
    fn from(value: &Variable) -> Self {
        SInt::Var(value.clone())
    }
}

impl std::ops::Add for SInt {
    type Output = SInt;

    fn add(self, rhs: SInt) -> SInt {
        match (self, rhs) {
            (SInt::Const(a), SInt::Const(b)) => SInt::Const(a + b),
            (SInt::Const(0), x) | (x, SInt::Const(0)) => x,
            (a, b) => SInt::Add(Box::new(a), Box::new(b)),
        }
    }
}

impl std::ops::Mul for SInt {
    type Output = SInt;

    fn mul(self, rhs: SInt) -> SInt {
        match (self, rhs) {
            (SInt::Const(a), SInt::Const(b)) => SInt::Const(a * b),
            (SInt::Const(0), _) | (_, SInt::Const(0)) => SInt::Const(0),
            (SInt::Const(1), x) | (x, SInt::Const(1)) => x,
            (a, b) => SInt::Mul(Box::new(a), Box::new(b)),
        }
    }
}

impl std::ops::Mul<i64> for SInt {
    type Output = SInt;

    fn mul(self, rhs: i64) -> SInt {
        self * SInt::Const(rhs)
    }
}

impl fmt::Display for SInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SInt::Const(v) => write!(f, "{v}"),
            SInt::Var(v) => write!(f, "{}", v.name),
            SInt::Add(a, b) => write!(f, "({a}+{b})"),
            SInt::Mul(a, b) => write!(f, "({a}*{b})"),
            SInt::FloorDiv(a, d) => write!(f, "({a}//{d})"),
        }
    }
}

/// Product of symbolic integers; `1` for an empty slice.
pub fn sint_prod(values: &[SInt]) -> SInt {
    values.iter().cloned().fold(SInt::Const(1), |acc, v| acc * v)
}

/// True when every value is concrete.
pub fn all_int(values: &[SInt]) -> bool {
    values.iter().all(SInt::is_const)
}

/// Resolve a list of symbolic integers to non-negative concrete sizes.
pub fn resolve_all(values: &[SInt], vals: &VarVals) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|v| {
            let r = v.resolve(vals)?;
            ensure!(r >= 0, NegativeExtentSnafu { value: r });
            Ok(r as usize)
        })
        .collect()
}
