pub mod unit;

use std::sync::Arc;

use kiln_device::{Buffer, BufferOptions, Device};
use kiln_ir::{AstNode, BinaryOp, DType, KernelAst, ReduceOp, SInt, Store, Variable, View};
use kiln_schedule::OptStrategy;

use crate::{Runtime, RuntimeConfig};

/// Built-in devices, nothing persisted.
pub(crate) fn runtime(strategy: OptStrategy) -> Runtime {
    Runtime::new(RuntimeConfig::builder().strategy(strategy).cache_level(0).build())
}

pub(crate) fn filled(device: &Arc<Device>, values: &[f32]) -> Buffer {
    Buffer::from_slice(Arc::clone(device), values).unwrap()
}

pub(crate) fn empty(device: &Arc<Device>, len: usize) -> Buffer {
    Buffer::new(Arc::clone(device), len, DType::Float32, BufferOptions::default())
}

pub(crate) fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| i as f32 * scale).collect()
}

/// `out = a + b` over `shape`; arguments `[out, a, b]`.
pub(crate) fn elementwise(shape: &[usize]) -> Arc<KernelAst> {
    let v = View::contiguous(shape.iter().copied());
    let src = AstNode::load(1, v.clone(), DType::Float32) + AstNode::load(2, v.clone(), DType::Float32);
    Arc::new(KernelAst::single(Store::new(0, v, DType::Float32, src)).unwrap())
}

/// `out = a + b` over the first `n` elements.
pub(crate) fn elementwise_var(n: &Variable) -> Arc<KernelAst> {
    let v = View::contiguous([SInt::from(n)]);
    let src = AstNode::load(1, v.clone(), DType::Float32) + AstNode::load(2, v.clone(), DType::Float32);
    Arc::new(KernelAst::single(Store::new(0, v, DType::Float32, src)).unwrap())
}

/// `sum = a + b` and `prod = a * b` in one kernel; arguments `[sum, prod, a, b]`.
pub(crate) fn sum_and_product(len: usize) -> Arc<KernelAst> {
    let v = View::contiguous([len]);
    let (a, b) = (AstNode::load(2, v.clone(), DType::Float32), AstNode::load(3, v.clone(), DType::Float32));
    let stores = vec![
        Store::new(0, v.clone(), DType::Float32, a.clone() + b.clone()),
        Store::new(1, v, DType::Float32, a.binary(BinaryOp::Mul, b)),
    ];
    Arc::new(KernelAst::new(stores).unwrap())
}

/// `out[r] = sum_c a[r, c]`.
pub(crate) fn row_sum(rows: usize, cols: usize) -> Arc<KernelAst> {
    let inp = View::contiguous([rows, cols]);
    let out = View::contiguous([rows, 1]);
    let src = AstNode::load(1, inp, DType::Float32).reduce(ReduceOp::Sum, vec![1]);
    Arc::new(KernelAst::single(Store::new(0, out, DType::Float32, src)).unwrap())
}

/// `out[n, m] = sum_k a[n, k] * b[k, m]`.
pub(crate) fn matmul(n: usize, m: usize, k: usize) -> Arc<KernelAst> {
    let c = |v: usize| SInt::from(v);
    let a = View::new(vec![c(n), c(1), c(k)], vec![c(k), c(0), c(1)], c(0)).unwrap();
    let b = View::new(vec![c(1), c(m), c(k)], vec![c(0), c(1), c(m)], c(0)).unwrap();
    let out = View::new(vec![c(n), c(m), c(1)], vec![c(m), c(1), c(0)], c(0)).unwrap();
    let a = a.expand(&[c(n), c(m), c(k)]).unwrap();
    let b = b.expand(&[c(n), c(m), c(k)]).unwrap();
    let src = (AstNode::load(1, a, DType::Float32) * AstNode::load(2, b, DType::Float32)).reduce(ReduceOp::Sum, vec![2]);
    Arc::new(KernelAst::single(Store::new(0, out, DType::Float32, src)).unwrap())
}

pub(crate) fn reference_matmul(a: &[f32], b: &[f32], n: usize, m: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.0; n * m];
    for i in 0..n {
        for j in 0..m {
            out[i * m + j] = (0..k).map(|x| a[i * k + x] * b[x * m + j]).sum();
        }
    }
    out
}

pub(crate) fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-3 * e.abs().max(1.0), "index {i}: {a} != {e}");
    }
}
