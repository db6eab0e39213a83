use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A symbolic expression referenced a variable with no value.
    #[snafu(display("variable '{name}' has no bound value"))]
    UnboundVariable { name: String },

    /// Bind value out of range.
    #[snafu(display("bind value {value} for '{name}' is outside valid range [{min}, {max}]"))]
    BindValueOutOfRange { name: String, value: i64, min: i64, max: i64 },

    /// Division by zero.
    #[snafu(display("division by zero"))]
    DivisionByZero,

    #[snafu(display("extent resolved to negative value {value}"))]
    NegativeExtent { value: i64 },

    /// View rank differs from the rest of the kernel.
    #[snafu(display("rank mismatch: expected {expected} dimensions, got {actual}"))]
    RankMismatch { expected: usize, actual: usize },

    #[snafu(display("invalid permutation {order:?} for rank {rank}"))]
    InvalidPermutation { order: Vec<usize>, rank: usize },

    #[snafu(display("cannot expand dimension {axis} of extent {extent} to {target}"))]
    InvalidExpand { axis: usize, extent: String, target: String },

    /// Symbolic extents cannot be split.
    #[snafu(display("axis {axis} has symbolic extent {extent} and cannot be split"))]
    SymbolicSplit { axis: usize, extent: String },

    #[snafu(display("axis {axis} of extent {extent} is not divisible by {amount}"))]
    IndivisibleSplit { axis: usize, extent: i64, amount: i64 },

    #[snafu(display("axis {axis} out of range for rank {rank}"))]
    AxisOutOfRange { axis: usize, rank: usize },

    #[snafu(display("kernel has no stores"))]
    EmptyKernel,
}
