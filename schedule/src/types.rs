//! Optimization descriptors applied to a [`Kernel`](crate::Kernel).
use std::fmt;

use super::error::*;

/// Loop transformations a kernel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OptOps {
    /// Tensor-core lowering of a matmul-shaped reduce.
    TC,
    /// Split a global axis and move the inner part to the register tile.
    UPCAST,
    /// Split a reduce axis and move the inner part to the register tile.
    UNROLL,
    /// Split a global axis into a workgroup dimension.
    LOCAL,
    /// Split a reduce axis across the workgroup (inner split).
    GROUP,
    /// Split a reduce axis across the workgroup (outer split).
    GROUPTOP,
    /// Forbid later local splits.
    NOLOCALS,
}

impl fmt::Display for OptOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TC => write!(f, "TC"),
            Self::UPCAST => write!(f, "UPCAST"),
            Self::UNROLL => write!(f, "UNROLL"),
            Self::LOCAL => write!(f, "LOCAL"),
            Self::GROUP => write!(f, "GROUP"),
            Self::GROUPTOP => write!(f, "GROUPTOP"),
            Self::NOLOCALS => write!(f, "NOLOCALS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OptArg {
    /// Split amount; `0` means the whole extent.
    Int(usize),
    /// Tensor core selection: index into the device's tensor cores and the usage level.
    TensorCore { tc_select: usize, use_tc: usize },
}

impl OptArg {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "Int",
            Self::TensorCore { .. } => "TensorCore",
        }
    }

    pub fn int(&self) -> Result<usize> {
        match self {
            Self::Int(v) => Ok(*v),
            _ => InvalidArgTypeSnafu { expected: "Int", found: self.type_name() }.fail(),
        }
    }
}

impl From<usize> for OptArg {
    fn from(v: usize) -> Self {
        Self::Int(v)
    }
}

/// An optimization: operation, axis and argument.
///
/// For `UNROLL`, `GROUP` and `GROUPTOP` the axis counts from the first
/// ungrouped reduce axis; for the other ops it is absolute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Opt {
    pub op: OptOps,
    pub axis: Option<usize>,
    pub arg: OptArg,
}

impl Opt {
    pub fn new(op: OptOps, axis: Option<usize>, arg: OptArg) -> Self {
        Self { op, axis, arg }
    }

    pub fn upcast(axis: usize, amount: usize) -> Self {
        Self::new(OptOps::UPCAST, Some(axis), OptArg::Int(amount))
    }

    pub fn local(axis: usize, amount: usize) -> Self {
        Self::new(OptOps::LOCAL, Some(axis), OptArg::Int(amount))
    }

    pub fn unroll(axis: usize, amount: usize) -> Self {
        Self::new(OptOps::UNROLL, Some(axis), OptArg::Int(amount))
    }

    pub fn group(axis: usize, amount: usize) -> Self {
        Self::new(OptOps::GROUP, Some(axis), OptArg::Int(amount))
    }

    pub fn grouptop(axis: usize, amount: usize) -> Self {
        Self::new(OptOps::GROUPTOP, Some(axis), OptArg::Int(amount))
    }

    pub fn tc(tc_select: usize, use_tc: usize) -> Self {
        Self::new(OptOps::TC, None, OptArg::TensorCore { tc_select, use_tc })
    }

    pub fn nolocals() -> Self {
        Self::new(OptOps::NOLOCALS, None, OptArg::Int(0))
    }
}

impl fmt::Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.op)?;
        if let Some(axis) = self.axis {
            write!(f, "{}, ", axis)?;
        }
        match &self.arg {
            OptArg::Int(v) => write!(f, "{}", v),
            OptArg::TensorCore { tc_select, use_tc } => write!(f, "tc_sel={}, use={}", tc_select, use_tc),
        }?;
        write!(f, ")")
    }
}

/// Role of an axis in the kernel's iteration space, by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum AxisKind {
    Global,
    Local,
    GroupReduce,
    Reduce,
    Unroll,
    Upcast,
}

impl AxisKind {
    pub fn is_reduce(&self) -> bool {
        matches!(self, Self::GroupReduce | Self::Reduce | Self::Unroll)
    }
}
