use std::collections::HashSet;

use crate::*;

fn add_kernel(n: usize) -> KernelAst {
    let v = View::contiguous([n]);
    let src = AstNode::load(1, v.clone(), DType::Float32) + AstNode::load(2, v.clone(), DType::Float32);
    KernelAst::single(Store::new(0, v, DType::Float32, src)).unwrap()
}

fn sum_kernel() -> KernelAst {
    let inp = View::contiguous([4usize, 8]);
    let out = View::contiguous([4usize, 1]);
    let src = AstNode::load(1, inp, DType::Float32).reduce(ReduceOp::Sum, vec![1]);
    KernelAst::single(Store::new(0, out, DType::Float32, src)).unwrap()
}

#[test]
fn test_structural_identity() {
    let mut set = HashSet::new();
    set.insert(add_kernel(16));
    assert!(set.contains(&add_kernel(16)));
    assert!(!set.contains(&add_kernel(32)));
    assert_eq!(add_kernel(16).to_string(), add_kernel(16).to_string());
    assert_eq!(add_kernel(16).content_hash(), add_kernel(16).content_hash());
    assert_ne!(add_kernel(16).content_hash(), add_kernel(32).content_hash());
}

#[test]
fn test_buffers_and_full_shape() {
    let k = sum_kernel();
    assert_eq!(k.buffers(), vec![(0, DType::Float32), (1, DType::Float32)]);
    assert_eq!(k.full_shape(), vec![SInt::Const(4), SInt::Const(8)]);
    assert_eq!(k.reduce(), Some((ReduceOp::Sum, &[1usize][..])));
    assert_eq!(k.alu_count(), 1);
}

#[test]
fn test_rank_mismatch_rejected() {
    let src = AstNode::load(1, View::contiguous([4usize]), DType::Float32);
    let err = KernelAst::single(Store::new(0, View::contiguous([4usize, 1]), DType::Float32, src)).unwrap_err();
    assert_eq!(err, Error::RankMismatch { expected: 2, actual: 1 });
    assert_eq!(KernelAst::new(vec![]).unwrap_err(), Error::EmptyKernel);
}

#[test]
fn test_map_views_reaches_loads() {
    let mut k = sum_kernel();
    k.map_views(|v| {
        *v = v.split(0, 2, false)?;
        Ok(())
    })
    .unwrap();
    assert!(k.views().iter().all(|v| v.ndim() == 3));
}

#[test]
fn test_const_identity_uses_bits() {
    assert_eq!(ConstValue::Float(f64::NAN), ConstValue::Float(f64::NAN));
    assert_ne!(ConstValue::Float(0.0), ConstValue::Float(-0.0));
    assert_ne!(ConstValue::Int(1), ConstValue::Float(1.0));
}

#[test]
fn test_deserialization_validates_like_new() {
    let k = add_kernel(4);
    let json = serde_json::to_string(&k).unwrap();
    assert_eq!(serde_json::from_str::<KernelAst>(&json).unwrap(), k);
    assert_eq!(k.stores().len(), 1);

    assert!(serde_json::from_str::<KernelAst>("[]").is_err());
    let mut stores: Vec<Store> = k.stores().to_vec();
    // a rank-2 store next to the rank-1 ones
    let wide = View::contiguous([4usize, 1]);
    stores.push(Store::new(3, wide.clone(), DType::Float32, AstNode::load(1, wide, DType::Float32)));
    let json = serde_json::to_string(&stores).unwrap();
    assert!(serde_json::from_str::<KernelAst>(&json).is_err());
}

#[test]
fn test_accesses_list_stores_then_loads() {
    let k = add_kernel(4);
    let buffers: Vec<usize> = k.accesses().into_iter().map(|(b, _, _)| b).collect();
    assert_eq!(buffers, vec![0, 1, 2]);
}

#[test]
fn test_resolved_extent() {
    let shape = vec![SInt::from(3usize), SInt::from(2usize)];
    let strides = vec![SInt::from(-2i64), SInt::from(1i64)];
    let view = View::new(shape, strides, SInt::from(4i64)).unwrap().resolve(&VarVals::new()).unwrap();
    assert_eq!(view.extent(), Some((0, 6)));

    let empty = View::contiguous([0usize, 4]).resolve(&VarVals::new()).unwrap();
    assert_eq!(empty.extent(), None);
}
