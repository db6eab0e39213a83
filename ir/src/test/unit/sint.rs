use proptest::prelude::*;

use crate::{Error, SInt, VarVals, Variable, bind_all, sint_prod};

fn batch() -> Variable {
    Variable::new("batch", 1, 64)
}

#[test]
fn test_const_folding() {
    let s = SInt::from(3) * SInt::from(4) + SInt::from(2);
    assert_eq!(s.as_const(), Some(14));
}

#[test]
fn test_identity_elision() {
    let v = SInt::from(batch());
    assert_eq!(v.clone() * SInt::from(1), v);
    assert_eq!(v.clone() + SInt::from(0), v);
    assert_eq!(v * SInt::from(0), SInt::Const(0));
}

#[test]
fn test_resolve_symbolic() {
    let n = batch();
    let s = (SInt::from(&n) * 4i64 + SInt::from(3)).floor_div(2).unwrap();
    let vals: VarVals = bind_all([(&n, 5)]).unwrap();
    assert_eq!(s.resolve(&vals).unwrap(), 11);
    assert_eq!(s.to_string(), "(((batch*4)+3)//2)");
}

#[test]
fn test_resolve_unbound() {
    let s = SInt::from(batch()) * 2i64;
    let err = s.resolve(&VarVals::new()).unwrap_err();
    assert_eq!(err, Error::UnboundVariable { name: "batch".into() });
}

#[test]
fn test_bind_out_of_range() {
    assert!(matches!(batch().bind(65), Err(Error::BindValueOutOfRange { value: 65, .. })));
    assert!(batch().bind(64).is_ok());
}

#[test]
fn test_floor_div_by_zero() {
    assert_eq!(SInt::from(4).floor_div(0), Err(Error::DivisionByZero));
}

#[test]
fn test_vars_and_bounds() {
    let a = Variable::new("a", 1, 8);
    let b = Variable::new("b", 2, 4);
    let s = SInt::from(&a) * SInt::from(&b) + SInt::from(1);
    assert_eq!(s.vars().into_iter().collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(s.bounds(), (3, 33));
}

#[test]
fn test_prod_mixed() {
    let n = batch();
    let p = sint_prod(&[SInt::from(2), SInt::from(&n), SInt::from(3)]);
    assert!(p.is_symbolic());
    let vals = bind_all([(&n, 7)]).unwrap();
    assert_eq!(p.resolve(&vals).unwrap(), 42);
}

proptest! {
    #[test]
    fn resolve_matches_integer_arithmetic(x in 1i64..64, m in 1i64..16, c in 0i64..16, d in 1i64..8) {
        let n = batch();
        let expr = (SInt::from(&n) * m + SInt::from(c)).floor_div(d).unwrap();
        let vals = bind_all([(&n, x)]).unwrap();
        prop_assert_eq!(expr.resolve(&vals).unwrap(), (x * m + c).div_euclid(d));
        let (lo, hi) = expr.bounds();
        prop_assert!(lo <= (x * m + c) / d && (x * m + c) / d <= hi);
    }
}
