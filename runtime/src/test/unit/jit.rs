use std::cell::{Cell, RefCell};
use std::sync::Arc;

use kiln_device::{Buffer, WeakBuffer};
use kiln_ir::{VarVals, Variable};
use kiln_schedule::OptStrategy;
use test_case::test_case;

use crate::test::{elementwise, elementwise_var, empty, filled, ramp, runtime, sum_and_product};
use crate::{Error, Jit, JitState, Launcher, Runner, TensorRef};

fn vars(pairs: &[(&Variable, i64)]) -> VarVals {
    pairs.iter().map(|(v, x)| ((*v).clone(), *x)).collect()
}

#[test]
fn test_cold_capture_replay() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[8])).unwrap();
    let out = empty(&dev, 8);
    let calls = Cell::new(0);

    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        calls.set(calls.get() + 1);
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], vv)?;
        Ok(out.clone())
    });
    let call = |jit: &mut Jit<_, Buffer>, a: &[f32], b: &[f32]| {
        let inputs = [TensorRef::contiguous(filled(&dev, a)), TensorRef::contiguous(filled(&dev, b))];
        jit.call(&inputs, &VarVals::new()).unwrap().to_vec::<f32>().unwrap()
    };

    assert_eq!(jit.state(), JitState::Cold);
    assert_eq!(call(&mut jit, &[1.0; 8], &[1.0; 8]), vec![2.0; 8]);
    assert_eq!(jit.state(), JitState::Capture);
    assert_eq!(jit.captured_kernels(), 0);

    assert_eq!(call(&mut jit, &[2.0; 8], &[1.0; 8]), vec![3.0; 8]);
    assert_eq!(jit.state(), JitState::Replay);
    assert_eq!(jit.captured_kernels(), 1);

    let (a, b) = (ramp(8, 1.0), ramp(8, 10.0));
    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    assert_eq!(call(&mut jit, &a, &b), expected);
    assert_eq!(call(&mut jit, &[0.5; 8], &[0.5; 8]), vec![1.0; 8]);
    // replays never run the function
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_input_slots_are_cleared_after_each_call() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[4])).unwrap();
    let out = empty(&dev, 4);
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], vv)?;
        Ok(())
    });

    for _ in 0..3 {
        let a = filled(&dev, &[1.0; 4]);
        let b = filled(&dev, &[2.0; 4]);
        let (wa, wb) = (a.downgrade(), b.downgrade());
        jit.call(&[TensorRef::contiguous(a), TensorRef::contiguous(b)], &VarVals::new()).unwrap();
        assert!(!wa.is_alive());
        assert!(!wb.is_alive());
    }
    let item = &jit.items()[0];
    assert!(item.bufs[0].as_ref().is_some_and(|b| b.ptr_eq(&out)));
    assert!(item.bufs[1].is_none());
    assert!(item.bufs[2].is_none());
}

#[test]
fn test_dropped_intermediates_are_reallocated_for_replay() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[4])).unwrap();
    let out = empty(&dev, 4);

    // out = a + 2b through a temporary the function drops
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        let tmp = empty(&dev, 4);
        let (a, b) = (&inputs[0].buffer, &inputs[1].buffer);
        l.launch(&add, &[tmp.clone(), a.clone(), b.clone()], vv)?;
        l.launch(&add, &[out.clone(), tmp, b.clone()], vv)?;
        Ok(out.clone())
    });

    for round in 0..4 {
        let a = filled(&dev, &[round as f32; 4]);
        let b = filled(&dev, &[1.0; 4]);
        let res = jit.call(&[TensorRef::contiguous(a), TensorRef::contiguous(b)], &VarVals::new()).unwrap();
        assert_eq!(res.to_vec::<f32>().unwrap(), vec![round as f32 + 2.0; 4]);
    }
    let items = jit.items();
    assert_eq!(items.len(), 2);
    let (first, second) = (items[0].bufs[0].as_ref().unwrap(), items[1].bufs[1].as_ref().unwrap());
    assert!(first.ptr_eq(second));
}

#[test]
fn test_duplicate_inputs_rejected() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let mut jit = Jit::new(|_: &mut Launcher, _: &[TensorRef], _: &VarVals| Ok(()));
    let x = TensorRef::contiguous(filled(&dev, &[1.0]));

    let err = jit.call(&[x.clone(), x], &VarVals::new()).unwrap_err();
    assert!(matches!(err, Error::JitDuplicateInputs));
    assert_eq!(jit.state(), JitState::Cold);
}

#[test]
fn test_nothing_captured() {
    let mut jit = Jit::new(|_: &mut Launcher, _: &[TensorRef], _: &VarVals| Ok(1));
    assert_eq!(jit.call(&[], &VarVals::new()).unwrap(), 1);
    let err = jit.call(&[], &VarVals::new()).unwrap_err();
    assert!(matches!(err, Error::JitNothingCaptured));
    assert_eq!(jit.state(), JitState::Capture);
}

#[test]
fn test_unused_input_reported() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[2])).unwrap();
    let out = empty(&dev, 2);
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        let a = inputs[0].buffer.clone();
        l.launch(&add, &[out.clone(), a.clone(), a], vv)?;
        Ok(())
    });
    let inputs = [TensorRef::contiguous(filled(&dev, &[1.0; 2])), TensorRef::contiguous(filled(&dev, &[2.0; 2]))];

    jit.call(&inputs, &VarVals::new()).unwrap();
    let err = jit.call(&inputs, &VarVals::new()).unwrap_err();
    assert!(matches!(err, Error::JitInputNotFound { ref missing } if missing == &[1]));
}

#[test]
fn test_replay_checks_inputs_and_variables() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[4])).unwrap();
    let out = empty(&dev, 4);
    let n = Variable::new("n", 1, 8);
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], vv)?;
        Ok(())
    });
    let pair = |len: usize| [TensorRef::contiguous(filled(&dev, &vec![1.0; len])), TensorRef::contiguous(filled(&dev, &vec![1.0; len]))];

    jit.call(&pair(4), &vars(&[(&n, 3)])).unwrap();
    jit.call(&pair(4), &vars(&[(&n, 3)])).unwrap();
    // a different value of the same variable replays
    jit.call(&pair(4), &vars(&[(&n, 5)])).unwrap();

    let err = jit.call(&pair(4), &VarVals::new()).unwrap_err();
    assert!(matches!(err, Error::JitVariableMismatch { .. }));

    let err = jit.call(&pair(2), &vars(&[(&n, 3)])).unwrap_err();
    assert!(matches!(err, Error::JitSignatureMismatch { position: 0 }));

    let err = jit.call(&pair(4)[..1], &vars(&[(&n, 3)])).unwrap_err();
    assert!(matches!(err, Error::JitSignatureMismatch { position: 1 }));
}

#[test]
fn test_capture_rejects_foreign_variable_values() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[4])).unwrap();
    let out = empty(&dev, 4);
    let n = Variable::new("n", 1, 8);
    let other = vars(&[(&n, 7)]);
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], _: &VarVals| {
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], &other)?;
        Ok(())
    });
    let inputs = [TensorRef::contiguous(filled(&dev, &[1.0; 4])), TensorRef::contiguous(filled(&dev, &[1.0; 4]))];

    jit.call(&inputs, &vars(&[(&n, 3)])).unwrap();
    let err = jit.call(&inputs, &vars(&[(&n, 3)])).unwrap_err();
    assert!(matches!(err, Error::JitVarValueMismatch { expected: Some(3), actual: 7, .. }));
}

#[test]
fn test_reset_and_stats() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise(&[16])).unwrap();
    let out = empty(&dev, 16);
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], vv)?;
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), out.clone()], vv)?;
        Ok(())
    })
    .with_debug(2);
    let inputs = [TensorRef::contiguous(filled(&dev, &[1.0; 16])), TensorRef::contiguous(filled(&dev, &[1.0; 16]))];
    jit.call(&inputs, &VarVals::new()).unwrap();
    jit.call(&inputs, &VarVals::new()).unwrap();

    let stats = jit.stats(&VarVals::new()).unwrap();
    let (ops, mem) = add.estimates();
    assert_eq!(stats.kernels, 2);
    assert_eq!(stats.op_estimate, 2 * ops.resolve(&VarVals::new()).unwrap());
    assert_eq!(stats.mem_estimate, 2 * mem.resolve(&VarVals::new()).unwrap());

    jit.reset();
    assert_eq!(jit.state(), JitState::Cold);
    assert_eq!(jit.captured_kernels(), 0);
}

#[test_case("CPU" ; "cpu")]
#[test_case("EMU" ; "emu")]
fn test_replay_follows_variable_values(device: &str) {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device(device).unwrap();
    let n = Variable::new("n", 1, 8);
    let add: Arc<dyn Runner> = rt.get_runner(&dev, &elementwise_var(&n)).unwrap();
    let out = empty(&dev, 8);
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        l.launch(&add, &[out.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], vv)?;
        Ok(())
    });

    for (round, len) in [3usize, 3, 5, 8, 2].into_iter().enumerate() {
        let a = ramp(8, round as f32 + 1.0);
        let inputs = [TensorRef::contiguous(filled(&dev, &a)), TensorRef::contiguous(filled(&dev, &[1.0; 8]))];
        jit.call(&inputs, &vars(&[(&n, len as i64)])).unwrap();

        let expected: Vec<f32> = a[..len].iter().map(|x| x + 1.0).collect();
        assert_eq!(&out.to_vec::<f32>().unwrap()[..len], &expected[..], "round {round}, n = {len}");
    }
    assert_eq!(jit.state(), JitState::Replay);
    assert_eq!(jit.captured_kernels(), 1);
}

#[test]
fn test_secondary_outputs_are_not_pinned() {
    let rt = runtime(OptStrategy::Heuristic);
    let dev = rt.device("CPU").unwrap();
    let both: Arc<dyn Runner> = rt.get_runner(&dev, &sum_and_product(4)).unwrap();
    assert_eq!(both.outputs(), vec![0, 1]);
    let out = empty(&dev, 4);
    let last_prod: RefCell<Option<WeakBuffer>> = RefCell::new(None);

    // the product is an intermediate the function drops
    let mut jit = Jit::new(|l: &mut Launcher, inputs: &[TensorRef], vv: &VarVals| {
        let prod = empty(&dev, 4);
        l.launch(&both, &[out.clone(), prod.clone(), inputs[0].buffer.clone(), inputs[1].buffer.clone()], vv)?;
        *last_prod.borrow_mut() = Some(prod.downgrade());
        Ok(())
    });

    for round in 0..4 {
        let a = filled(&dev, &[round as f32; 4]);
        let b = filled(&dev, &[2.0; 4]);
        jit.call(&[TensorRef::contiguous(a), TensorRef::contiguous(b)], &VarVals::new()).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![round as f32 + 2.0; 4]);
    }
    // the product from the capturing call was replaced, not kept alive
    assert!(!last_prod.borrow().as_ref().unwrap().is_alive());
    let item = &jit.items()[0];
    assert!(item.bufs[0].as_ref().is_some_and(|b| b.ptr_eq(&out)));
    assert!(item.bufs[1].is_some());
}
