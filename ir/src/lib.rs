//! Kernel-level IR for kiln.
//!
//! - [`sint`] - symbolic integers and bounded variables
//! - [`shape`] - strided views
//! - [`ast`] - the fused kernel AST that gets compiled, cached and tuned
//! - [`error`] - error types

pub mod ast;
pub mod error;
pub mod shape;
pub mod sint;

#[cfg(test)]
pub mod test;

pub use ast::{AstNode, BinaryOp, ConstValue, KernelAst, ReduceOp, Store, UnaryOp};
pub use error::{Error, Result};
pub use shape::{ResolvedView, View};
pub use sint::{SInt, VarVals, Variable, all_int, bind_all, resolve_all, sint_prod};

pub use kiln_dtype::DType;
