//! Capture and replay of launch sequences.
//!
//! A [`Jit`] wraps a function that launches kernels through a [`Launcher`].
//! The first call runs it eagerly, the second runs it while recording every
//! launch, and later calls replay the recording with the new inputs swapped
//! in, without running the function at all.
//!
//! Buffers a launch writes are recorded by [`BufferId`] rather than held, so
//! intermediates the function drops are reallocated for replay instead of
//! being pinned by the recording.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kiln_device::{Buffer, BufferArena, BufferId};
use kiln_dtype::DType;
use kiln_ir::{VarVals, Variable, View};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info};

use crate::error::{
    DeviceSnafu, IrSnafu, JitDuplicateInputsSnafu, JitInputNotFoundSnafu, JitNothingCapturedSnafu,
    JitSignatureMismatchSnafu, JitVarValueMismatchSnafu, JitVariableMismatchSnafu, LoweringSnafu, Result,
};
use crate::runner::Runner;

/// An input: a buffer and the view it is read through.
#[derive(Clone)]
pub struct TensorRef {
    pub buffer: Buffer,
    pub view: View,
}

impl TensorRef {
    pub fn new(buffer: Buffer, view: View) -> Self {
        Self { buffer, view }
    }

    /// The whole buffer as a flat vector.
    pub fn contiguous(buffer: Buffer) -> Self {
        let view = View::contiguous([buffer.size() as i64]);
        Self { buffer, view }
    }

    fn signature(&self) -> InputSignature {
        InputSignature { view: self.view.clone(), dtype: self.buffer.dtype().clone() }
    }
}

/// What must match between the capturing call and every replayed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    pub view: View,
    pub dtype: DType,
}

enum Arg {
    Held(Buffer),
    Placeholder(BufferId),
}

struct Capture {
    var_vals: VarVals,
    arena: BufferArena,
    placeholders: HashSet<BufferId>,
    launches: Vec<(Arc<dyn Runner>, Vec<Arg>)>,
}

impl Capture {
    fn record(&mut self, runner: &Arc<dyn Runner>, bufs: &[Buffer], var_vals: &VarVals) -> Result<()> {
        for (var, &actual) in var_vals {
            let expected = self.var_vals.get(var).copied();
            ensure!(expected == Some(actual), JitVarValueMismatchSnafu { name: var.name.clone(), expected, actual });
        }
        // Outputs are written during capture, so they may be intermediates.
        for out in runner.outputs().into_iter().filter_map(|i| bufs.get(i)) {
            let id = self.arena.register(out);
            self.placeholders.insert(id);
        }
        let args = bufs
            .iter()
            .map(|b| {
                let id = self.arena.register(b);
                if self.placeholders.contains(&id) { Arg::Placeholder(id) } else { Arg::Held(b.clone()) }
            })
            .collect();
        self.launches.push((Arc::clone(runner), args));
        Ok(())
    }

    /// Resolve placeholders: live buffers are reused, dropped ones get one
    /// fresh unallocated buffer per id.
    fn finish(self) -> Vec<JitItem> {
        let Capture { arena, launches, .. } = self;
        let mut fresh: HashMap<BufferId, Buffer> = HashMap::new();
        launches
            .into_iter()
            .map(|(runner, args)| {
                let bufs = args
                    .into_iter()
                    .map(|arg| match arg {
                        Arg::Held(b) => Some(b),
                        Arg::Placeholder(id) => arena.get(id).or_else(|| {
                            let desc = arena.descriptor(id)?;
                            Some(fresh.entry(id).or_insert_with(|| desc.instantiate()).clone())
                        }),
                    })
                    .collect();
                JitItem { runner, bufs }
            })
            .collect()
    }
}

/// Launches runners eagerly, recording them while a capture is active.
pub struct Launcher {
    debug: u8,
    capture: Option<Capture>,
}

impl Launcher {
    pub fn new(debug: u8) -> Self {
        Self { debug, capture: None }
    }

    fn capturing(debug: u8, var_vals: VarVals) -> Self {
        let capture = Capture {
            var_vals,
            arena: BufferArena::new(),
            placeholders: HashSet::new(),
            launches: Vec::new(),
        };
        Self { debug, capture: Some(capture) }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn launch(&mut self, runner: &Arc<dyn Runner>, bufs: &[Buffer], var_vals: &VarVals) -> Result<Option<Duration>> {
        if let Some(capture) = &mut self.capture {
            capture.record(runner, bufs, var_vals)?;
        }
        let elapsed = runner.call(bufs, var_vals, self.debug >= 2)?;
        if let Some(elapsed) = elapsed {
            debug!(kernel.name = %runner.name(), elapsed_us = elapsed.as_micros() as u64, "launched");
        }
        Ok(elapsed)
    }

    fn finish(self) -> Vec<JitItem> {
        self.capture.map(Capture::finish).unwrap_or_default()
    }
}

/// One recorded launch. `None` marks an input slot between calls.
pub struct JitItem {
    pub runner: Arc<dyn Runner>,
    pub bufs: Vec<Option<Buffer>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitState {
    /// Next call runs eagerly.
    Cold,
    /// Next call records.
    Capture,
    /// Next call replays.
    Replay,
}

/// Totals over the captured launches for one set of variable values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub kernels: usize,
    pub op_estimate: i64,
    pub mem_estimate: i64,
}

pub struct Jit<F, R> {
    f: F,
    debug: u8,
    cnt: usize,
    items: Vec<JitItem>,
    /// `(item, argument) -> input position`.
    input_replace: BTreeMap<(usize, usize), usize>,
    expected_vars: Vec<Variable>,
    expected_sig: Vec<InputSignature>,
    ret: Option<R>,
}

impl<F, R> Jit<F, R>
where
    F: FnMut(&mut Launcher, &[TensorRef], &VarVals) -> Result<R>,
    R: Clone,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            debug: 0,
            cnt: 0,
            items: Vec::new(),
            input_replace: BTreeMap::new(),
            expected_vars: Vec::new(),
            expected_sig: Vec::new(),
            ret: None,
        }
    }

    /// At 2 or more every launch waits and is timed.
    pub fn with_debug(mut self, debug: u8) -> Self {
        self.debug = debug;
        self
    }

    pub fn state(&self) -> JitState {
        match self.cnt {
            0 => JitState::Cold,
            1 => JitState::Capture,
            _ => JitState::Replay,
        }
    }

    pub fn captured_kernels(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[JitItem] {
        &self.items
    }

    /// Forget the recording; the next call runs eagerly again.
    pub fn reset(&mut self) {
        self.cnt = 0;
        self.items.clear();
        self.input_replace.clear();
        self.expected_vars.clear();
        self.expected_sig.clear();
        self.ret = None;
    }

    pub fn stats(&self, var_vals: &VarVals) -> Result<JitStats> {
        let mut stats = JitStats { kernels: self.items.len(), ..Default::default() };
        for item in &self.items {
            let (ops, mem) = item.runner.estimates();
            stats.op_estimate += ops.resolve(var_vals).context(IrSnafu)?;
            stats.mem_estimate += mem.resolve(var_vals).context(IrSnafu)?;
        }
        Ok(stats)
    }

    pub fn call(&mut self, inputs: &[TensorRef], var_vals: &VarVals) -> Result<R> {
        for (i, input) in inputs.iter().enumerate() {
            ensure!(!inputs[..i].iter().any(|prev| prev.buffer.ptr_eq(&input.buffer)), JitDuplicateInputsSnafu);
            input.view.resolve(var_vals).context(IrSnafu)?;
            input.buffer.ensure_allocated().context(DeviceSnafu)?;
        }

        let result = match self.state() {
            JitState::Cold => {
                let mut launcher = Launcher::new(self.debug);
                (self.f)(&mut launcher, inputs, var_vals)
            }
            JitState::Capture => self.capture(inputs, var_vals),
            JitState::Replay => self.replay(inputs, var_vals),
        };
        self.clear_inputs();
        let ret = result?;
        self.cnt += 1;
        Ok(ret)
    }

    fn capture(&mut self, inputs: &[TensorRef], var_vals: &VarVals) -> Result<R> {
        let mut launcher = Launcher::capturing(self.debug, var_vals.clone());
        let ret = (self.f)(&mut launcher, inputs, var_vals)?;
        let items = launcher.finish();
        ensure!(!items.is_empty(), JitNothingCapturedSnafu);

        let mut input_replace = BTreeMap::new();
        for (j, item) in items.iter().enumerate() {
            for (i, buf) in item.bufs.iter().enumerate() {
                let position = buf.as_ref().and_then(|b| inputs.iter().position(|t| t.buffer.ptr_eq(b)));
                if let Some(position) = position {
                    input_replace.insert((j, i), position);
                }
            }
        }
        let found: BTreeSet<usize> = input_replace.values().copied().collect();
        let missing: Vec<usize> = (0..inputs.len()).filter(|p| !found.contains(p)).collect();
        ensure!(missing.is_empty(), JitInputNotFoundSnafu { missing });

        if self.debug >= 1 {
            info!(kernels = items.len(), inputs = inputs.len(), "captured launches");
        }
        self.items = items;
        self.input_replace = input_replace;
        self.expected_vars = var_vals.keys().cloned().collect();
        self.expected_sig = inputs.iter().map(TensorRef::signature).collect();
        self.ret = Some(ret.clone());
        Ok(ret)
    }

    fn replay(&mut self, inputs: &[TensorRef], var_vals: &VarVals) -> Result<R> {
        let vars: Vec<Variable> = var_vals.keys().cloned().collect();
        ensure!(
            vars == self.expected_vars,
            JitVariableMismatchSnafu {
                expected: self.expected_vars.iter().map(|v| v.name.clone()).collect::<Vec<_>>(),
                actual: vars.iter().map(|v| v.name.clone()).collect::<Vec<_>>(),
            }
        );
        let mismatch = (0..inputs.len().max(self.expected_sig.len()))
            .find(|&p| inputs.get(p).map(TensorRef::signature).as_ref() != self.expected_sig.get(p));
        if let Some(position) = mismatch {
            return JitSignatureMismatchSnafu { position }.fail();
        }

        for (&(j, i), &position) in &self.input_replace {
            self.items[j].bufs[i] = Some(inputs[position].buffer.clone());
        }
        let wait = self.debug >= 2;
        for item in &self.items {
            let bufs = item
                .bufs
                .iter()
                .cloned()
                .collect::<Option<Vec<Buffer>>>()
                .context(LoweringSnafu { reason: format!("unresolved buffer in {}", item.runner.name()) })?;
            if let Some(elapsed) = item.runner.call(&bufs, var_vals, wait)? {
                debug!(kernel.name = %item.runner.name(), elapsed_us = elapsed.as_micros() as u64, "replayed");
            }
        }
        self.ret.clone().context(JitNothingCapturedSnafu)
    }

    /// Input slots never keep a caller's buffer alive between calls.
    fn clear_inputs(&mut self) {
        for &(j, i) in self.input_replace.keys() {
            if let Some(slot) = self.items.get_mut(j).and_then(|item| item.bufs.get_mut(i)) {
                *slot = None;
            }
        }
    }
}
