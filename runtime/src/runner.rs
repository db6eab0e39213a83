//! Compiled kernels bound to a device, and the launch interface shared with copies.
//!
//! A [`CompiledRunner`] pairs a [`ProgramSpec`] with its compiled artifact and
//! the loaded [`Program`]. The spec is behind a lock so the first launch can
//! fix a missing local size once; every later launch reads the fixed spec.

use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use kiln_device::{Buffer, Compiler, Device, Program, ProgramSpec};
use kiln_ir::{SInt, VarVals};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use smallvec::SmallVec;
use snafu::{ResultExt, ensure};
use tracing::{debug, trace, warn};

use crate::error::{ArgumentCountSnafu, BufferMismatchSnafu, DeviceSnafu, LocalSizeFailedSnafu, Result};
use crate::store::{COMPILE_TABLE, KeyValueStore};

/// Largest workgroup tried by [`optimize_local_size`].
pub const MAX_WORKGROUP: usize = 1024;

/// Anything that can be launched on a list of buffers.
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    /// `(op_estimate, mem_estimate)` per launch.
    fn estimates(&self) -> (SInt, SInt);

    /// Argument positions written by a launch.
    fn outputs(&self) -> Vec<usize> {
        vec![0]
    }

    /// Launch once. With `wait`, block until done and return the elapsed time.
    fn call(&self, bufs: &[Buffer], var_vals: &VarVals, wait: bool) -> Result<Option<Duration>>;

    fn exec(&self, bufs: &[Buffer], var_vals: &VarVals) -> Result<Option<Duration>> {
        self.call(bufs, var_vals, false)
    }

    fn as_compiled(&self) -> Option<&CompiledRunner> {
        None
    }
}

/// Key of a compiled artifact in the `compile` table.
pub fn compile_key(cache_key: &str, src: &str) -> String {
    let mut bytes = Vec::with_capacity(cache_key.len() + src.len() + 1);
    bytes.extend_from_slice(cache_key.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(src.as_bytes());
    format!("{cache_key}-{:016x}", xxhash_rust::xxh64::xxh64(&bytes, 0))
}

/// Compile `src`, reusing a stored artifact when the compiler has a cache key.
pub fn compile_cached(compiler: &dyn Compiler, src: &str, store: Option<&dyn KeyValueStore>) -> Result<Vec<u8>> {
    let Some((store, cache_key)) = store.zip(compiler.cache_key()) else {
        return compiler.compile(src).context(DeviceSnafu);
    };
    let key = compile_key(cache_key, src);
    match store.get(COMPILE_TABLE, key.as_bytes()) {
        Ok(Some(lib)) => {
            trace!(key, "compile cache hit");
            return Ok(lib);
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "compile cache lookup failed"),
    }
    let lib = compiler.compile(src).context(DeviceSnafu)?;
    if let Err(err) = store.put(COMPILE_TABLE, key.as_bytes(), &lib) {
        warn!(error = %err, "compiled artifact not persisted");
    }
    Ok(lib)
}

pub struct CompiledRunner {
    name: String,
    spec: RwLock<Arc<ProgramSpec>>,
    lib: Arc<[u8]>,
    program: Box<dyn Program>,
    device: Arc<Device>,
}

impl CompiledRunner {
    /// Compile (unless `precompiled` is given) and load `spec` on `device`.
    pub fn new(
        spec: ProgramSpec,
        device: Arc<Device>,
        precompiled: Option<Arc<[u8]>>,
        store: Option<&dyn KeyValueStore>,
    ) -> Result<Self> {
        let lib: Arc<[u8]> = match precompiled {
            Some(lib) => lib,
            None => {
                let backend = device.backend().context(DeviceSnafu)?;
                compile_cached(&*backend.compiler, &spec.src, store)?.into()
            }
        };
        let program = device.load(&spec.name, &lib).context(DeviceSnafu)?;
        Ok(Self { name: spec.name.clone(), spec: RwLock::new(Arc::new(spec)), lib, program, device })
    }

    /// The same artifact loaded on another device of the family. Never recompiles.
    pub fn retarget(&self, device: Arc<Device>) -> Result<Self> {
        let spec = self.spec().retarget(device.name());
        Self::new(spec, device, Some(Arc::clone(&self.lib)), None)
    }

    pub fn spec(&self) -> Arc<ProgramSpec> {
        Arc::clone(&self.spec.read())
    }

    pub fn lib(&self) -> &Arc<[u8]> {
        &self.lib
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Spec with a fixed local size, deriving it on first use.
    fn launch_spec(&self, bufs: &[Buffer], var_vals: &VarVals) -> Result<Arc<ProgramSpec>> {
        let spec = self.spec();
        let needs_local = spec.local_size.is_none()
            && spec.global_size.as_ref().is_some_and(|g| g.iter().all(SInt::is_const));
        if !needs_local {
            return Ok(spec);
        }
        let (Some(global), _) = spec.launch_dims(var_vals).context(DeviceSnafu)? else {
            return Ok(spec);
        };
        let vals = spec.vals(var_vals).context(DeviceSnafu)?;
        let local = optimize_local_size(&*self.program, &self.device, &self.name, global, bufs, &vals)?;
        let mut slot = self.spec.write();
        if slot.local_size.is_none() {
            debug!(kernel.name = %self.name, ?local, "fixed local size");
            *slot = Arc::new(slot.with_local_size(local));
        }
        Ok(Arc::clone(&slot))
    }
}

impl Runner for CompiledRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn estimates(&self) -> (SInt, SInt) {
        let spec = self.spec.read();
        (spec.op_estimate.clone(), spec.mem_estimate.clone())
    }

    fn outputs(&self) -> Vec<usize> {
        self.spec.read().outs.clone()
    }

    fn call(&self, bufs: &[Buffer], var_vals: &VarVals, wait: bool) -> Result<Option<Duration>> {
        check_arguments(&self.spec(), bufs, var_vals)?;
        for buf in bufs {
            buf.ensure_allocated().context(DeviceSnafu)?;
        }
        let spec = self.launch_spec(bufs, var_vals)?;
        let (global, local) = spec.launch_dims(var_vals).context(DeviceSnafu)?;
        let vals = spec.vals(var_vals).context(DeviceSnafu)?;
        let ptrs = bufs.iter().map(Buffer::data_ptr).collect::<Result<SmallVec<[*mut u8; 8]>, _>>().context(DeviceSnafu)?;

        let start = Instant::now();
        // SAFETY: `check_arguments` bounded every access by its buffer's size, and
        // every buffer is allocated and alive for the duration of the call.
        unsafe { self.program.execute(&ptrs, &vals, global, local) }.context(DeviceSnafu)?;
        if !wait {
            return Ok(None);
        }
        self.device.synchronize().context(DeviceSnafu)?;
        Ok(Some(start.elapsed()))
    }

    fn as_compiled(&self) -> Option<&CompiledRunner> {
        Some(self)
    }
}

/// Every accessed argument is present, has the kernel's dtype and holds every
/// element the kernel reaches for `var_vals`.
fn check_arguments(spec: &ProgramSpec, bufs: &[Buffer], var_vals: &VarVals) -> Result<()> {
    ensure!(
        bufs.len() >= spec.arity(),
        ArgumentCountSnafu { name: &spec.name, expected: spec.arity(), actual: bufs.len() }
    );
    for access in &spec.buffers {
        let buf = &bufs[access.index];
        ensure!(
            buf.dtype() == &access.dtype,
            BufferMismatchSnafu {
                name: &spec.name,
                index: access.index,
                reason: format!("buffer is {}, kernel uses {}", buf.dtype(), access.dtype),
            }
        );
        let Some((lo, hi)) = access.extent(var_vals).context(DeviceSnafu)? else { continue };
        let need = hi.max(0) as usize * access.dtype.itemsize();
        ensure!(
            lo >= 0 && need <= buf.nbytes(),
            BufferMismatchSnafu {
                name: &spec.name,
                index: access.index,
                reason: format!("kernel reaches elements {lo}..{hi} ({need} bytes), buffer holds {}", buf.nbytes()),
            }
        );
    }
    Ok(())
}

/// Pick the fastest workgroup for a kernel whose local size was left open.
///
/// Candidates per dimension are the divisors of the global extent among
/// `1, 2, 4, .., 256, 1024` and the extent itself, with a product of at most
/// [`MAX_WORKGROUP`]. Each is timed twice in random order; failures count as
/// infinitely slow. An output that aliases an input is replaced by a scratch
/// buffer so repeated launches stay idempotent.
pub fn optimize_local_size(
    program: &dyn Program,
    device: &Device,
    name: &str,
    global: [usize; 3],
    bufs: &[Buffer],
    vals: &[i64],
) -> Result<[usize; 3]> {
    let scratch = match bufs.split_first() {
        Some((out, rest)) if rest.iter().any(|b| b.ptr_eq(out)) => {
            let fresh = Buffer::new(Arc::clone(out.device()), out.size(), out.dtype().clone(), out.options());
            fresh.ensure_allocated().context(DeviceSnafu)?;
            Some(fresh)
        }
        _ => None,
    };
    let mut ptrs = bufs.iter().map(Buffer::data_ptr).collect::<Result<Vec<_>, _>>().context(DeviceSnafu)?;
    if let (Some(scratch), Some(first)) = (&scratch, ptrs.first_mut()) {
        *first = scratch.data_ptr().context(DeviceSnafu)?;
    }

    let dims: Vec<Vec<usize>> = global
        .iter()
        .map(|&sz| {
            [1, 2, 4, 8, 16, 32, 64, 128, 256, MAX_WORKGROUP, sz]
                .into_iter()
                .filter(|&l| l <= sz && sz % l == 0)
                .sorted()
                .dedup()
                .collect()
        })
        .collect();
    let mut candidates: Vec<[usize; 3]> = dims
        .iter()
        .multi_cartesian_product()
        .map(|c| [*c[0], *c[1], *c[2]])
        .filter(|l| l.iter().product::<usize>() <= MAX_WORKGROUP)
        .flat_map(|l| [l, l])
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    let try_exec = |local: [usize; 3]| -> f64 {
        let grid = [global[0] / local[0], global[1] / local[1], global[2] / local[2]];
        let start = Instant::now();
        // SAFETY: pointers come from allocated buffers borrowed for this call.
        let ran = unsafe { program.execute(&ptrs, vals, Some(grid), Some(local)) }.and_then(|_| device.synchronize());
        match ran {
            Ok(()) => start.elapsed().as_secs_f64(),
            Err(_) => f64::INFINITY,
        }
    };
    let (best_time, best) = candidates
        .into_iter()
        .map(|local| (try_exec(local), local))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .unwrap_or((f64::INFINITY, [1, 1, 1]));
    ensure!(best_time.is_finite(), LocalSizeFailedSnafu { name: name.to_string() });
    Ok(best)
}

/// Device-to-device copy through host memory: `[dst, src]`.
#[derive(Debug, Default)]
pub struct BufferCopy;

impl Runner for BufferCopy {
    fn name(&self) -> &str {
        "copy"
    }

    fn estimates(&self) -> (SInt, SInt) {
        (SInt::Const(0), SInt::Const(0))
    }

    fn call(&self, bufs: &[Buffer], _var_vals: &VarVals, wait: bool) -> Result<Option<Duration>> {
        let [dst, src] = bufs else {
            return ArgumentCountSnafu { name: "copy", expected: 2usize, actual: bufs.len() }.fail();
        };
        let start = Instant::now();
        let bytes = src.as_bytes().context(DeviceSnafu)?;
        dst.copyin(&bytes).context(DeviceSnafu)?;
        trace!(from = %src.device().name(), to = %dst.device().name(), bytes = bytes.len(), "copied buffer");
        if !wait {
            return Ok(None);
        }
        dst.device().synchronize().context(DeviceSnafu)?;
        Ok(Some(start.elapsed()))
    }
}
