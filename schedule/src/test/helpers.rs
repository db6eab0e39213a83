//! AST builders shared by the unit tests.

use std::sync::Arc;

use kiln_ir::{AstNode, DType, KernelAst, ReduceOp, SInt, Store, View};

use crate::caps::KernelCaps;
use crate::kernel::Kernel;

/// `out = a + b` over `shape`.
pub fn elementwise(shape: &[usize]) -> Arc<KernelAst> {
    let v = View::contiguous(shape.iter().copied());
    let src = AstNode::load(1, v.clone(), DType::Float32) + AstNode::load(2, v.clone(), DType::Float32);
    Arc::new(KernelAst::single(Store::new(0, v, DType::Float32, src)).unwrap())
}

/// `out[r] = sum_c a[r, c]`.
pub fn row_sum(rows: usize, cols: usize) -> Arc<KernelAst> {
    let inp = View::contiguous([rows, cols]);
    let out = View::contiguous([rows, 1]);
    let src = AstNode::load(1, inp, DType::Float32).reduce(ReduceOp::Sum, vec![1]);
    Arc::new(KernelAst::single(Store::new(0, out, DType::Float32, src)).unwrap())
}

/// `out[n, m] = sum_k a[n, k] * b[k, m]` over the iteration space `[n, m, k]`.
pub fn matmul(n: usize, m: usize, k: usize) -> Arc<KernelAst> {
    let c = |v: usize| SInt::from(v);
    let a = View::new(vec![c(n), c(1), c(k)], vec![c(k), c(0), c(1)], c(0)).unwrap();
    let b = View::new(vec![c(1), c(m), c(k)], vec![c(0), c(1), c(m)], c(0)).unwrap();
    let out = View::new(vec![c(n), c(m), c(1)], vec![c(m), c(1), c(0)], c(0)).unwrap();
    let a = a.expand(&[c(n), c(m), c(k)]).unwrap();
    let b = b.expand(&[c(n), c(m), c(k)]).unwrap();
    let src = (AstNode::load(1, a, DType::Float32) * AstNode::load(2, b, DType::Float32)).reduce(ReduceOp::Sum, vec![2]);
    Arc::new(KernelAst::single(Store::new(0, out, DType::Float32, src)).unwrap())
}

pub fn cpu_kernel(ast: Arc<KernelAst>) -> Kernel {
    Kernel::new(ast, Arc::new(KernelCaps::cpu())).unwrap()
}

pub fn gpu_kernel(ast: Arc<KernelAst>) -> Kernel {
    Kernel::new(ast, Arc::new(KernelCaps::gpu("EMU"))).unwrap()
}
