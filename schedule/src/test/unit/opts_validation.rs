use test_case::test_case;

use crate::error::OptError;
use crate::test::helpers::*;
use crate::types::Opt;

#[test_case(Opt::upcast(0, 16) ; "upcast above eight")]
#[test_case(Opt::upcast(0, 3) ; "indivisible")]
#[test_case(Opt::upcast(7, 2) ; "axis out of range")]
#[test_case(Opt::upcast(0, 1) ; "amount of one")]
#[test_case(Opt::local(0, 4) ; "local without workgroups")]
#[test_case(Opt::grouptop(0, 4) ; "group without a reduce")]
#[test_case(Opt::unroll(0, 2) ; "unroll without a reduce")]
#[test_case(Opt::tc(0, 1) ; "tc through apply_opt")]
fn test_rejected_opt_leaves_kernel_unchanged(opt: Opt) {
    let mut k = cpu_kernel(elementwise(&[32, 32]));
    let before = k.full_shape().to_vec();
    assert!(k.apply_opt(opt).is_err());
    assert_eq!(k.full_shape(), before.as_slice());
    assert!(k.applied_opts().is_empty());
    assert_eq!(k.upcasted(), 0);
}

#[test]
fn test_error_kinds() {
    let mut k = cpu_kernel(elementwise(&[32, 32]));
    assert!(matches!(k.apply_opt(Opt::upcast(0, 16)), Err(OptError::DeviceLimitExceeded { .. })));
    assert!(matches!(k.apply_opt(Opt::upcast(0, 3)), Err(OptError::DivisionError { size: 32, amount: 3 })));
    assert!(matches!(k.apply_opt(Opt::upcast(7, 2)), Err(OptError::AxisOutOfBounds { .. })));
    assert!(matches!(k.apply_opt(Opt::local(0, 4)), Err(OptError::UnsupportedFeature { .. })));
}

#[test]
fn test_upcast_budget() {
    let mut k = cpu_kernel(elementwise(&[64, 64, 64]));
    k.apply_opt(Opt::upcast(0, 8)).unwrap();
    k.apply_opt(Opt::upcast(1, 8)).unwrap();
    k.apply_opt(Opt::upcast(2, 4)).unwrap();
    // 8 * 8 * 4 = 256 is the CPU tile limit.
    assert!(matches!(k.apply_opt(Opt::upcast(2, 2)), Err(OptError::DeviceLimitExceeded { .. })));
}

#[test]
fn test_local_limit() {
    let mut k = gpu_kernel(elementwise(&[64, 64]));
    k.apply_opt(Opt::local(0, 32)).unwrap();
    k.apply_opt(Opt::local(1, 32)).unwrap();
    assert_eq!(k.local_size(), 1024);
    let mut k2 = gpu_kernel(elementwise(&[64, 64, 4]));
    k2.apply_opt(Opt::local(0, 32)).unwrap();
    k2.apply_opt(Opt::local(1, 32)).unwrap();
    assert!(matches!(k2.apply_opt(Opt::local(2, 2)), Err(OptError::DeviceLimitExceeded { .. })));
}

#[test]
fn test_nolocals_blocks_locals() {
    let mut k = gpu_kernel(elementwise(&[64, 64]));
    k.apply_opt(Opt::nolocals()).unwrap();
    assert!(k.dont_use_locals());
    assert!(matches!(k.apply_opt(Opt::local(0, 4)), Err(OptError::ValidationFailed { .. })));
}

#[test]
fn test_unroll_limit() {
    let mut k = cpu_kernel(row_sum(4, 128));
    assert!(matches!(k.apply_opt(Opt::unroll(0, 64)), Err(OptError::DeviceLimitExceeded { .. })));
    k.apply_opt(Opt::unroll(0, 32)).unwrap();
}
