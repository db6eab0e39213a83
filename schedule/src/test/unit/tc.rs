use test_case::test_case;

use crate::config::TcUsage;
use crate::tc::apply_tensor_cores;
use crate::test::helpers::*;
use crate::types::OptOps;

#[test]
fn test_matmul_uses_tensor_core() {
    let mut k = gpu_kernel(matmul(16, 16, 16));
    assert!(apply_tensor_cores(&mut k, TcUsage::Enabled).unwrap());
    assert!(k.tensor_core().is_some());
    assert_eq!(k.applied_opts()[0].op, OptOps::TC);
    assert_eq!(k.local_dims(), 4);
    assert_eq!(k.upcasted(), 3);
    assert_eq!(k.local_size(), 16);
    assert_eq!(k.upcast_size(), 32);
}

#[test]
fn test_shape_only_skips_core() {
    let mut k = gpu_kernel(matmul(16, 16, 16));
    assert!(apply_tensor_cores(&mut k, TcUsage::ShapeOnly).unwrap());
    assert!(k.tensor_core().is_none());
    assert_eq!(k.local_dims(), 4);
}

#[test_case(gpu_kernel(matmul(16, 16, 16)), TcUsage::Disabled ; "disabled")]
#[test_case(cpu_kernel(matmul(16, 16, 16)), TcUsage::Enabled ; "no tensor cores")]
#[test_case(gpu_kernel(matmul(12, 16, 16)), TcUsage::Enabled ; "indivisible n")]
#[test_case(gpu_kernel(elementwise(&[16, 16])), TcUsage::Enabled ; "not a matmul")]
#[test_case(gpu_kernel(row_sum(16, 16)), TcUsage::Enabled ; "plain reduce")]
fn test_no_match_leaves_kernel(mut k: crate::Kernel, usage: TcUsage) {
    let before = k.full_shape().to_vec();
    assert!(!apply_tensor_cores(&mut k, usage).unwrap());
    assert_eq!(k.full_shape(), before.as_slice());
    assert!(k.applied_opts().is_empty());
}
