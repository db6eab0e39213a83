//! Candidate compilation and timing for measured kernel search.
//!
//! Candidates are rendered and compiled on the search worker pool; timing
//! runs on the calling thread against scratch allocations sized from the
//! kernel's views, so no caller buffer is ever written.

use std::cell::OnceCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_device::{Allocator, BufferOptions, Compiler, Device, Program, ProgramSpec, RawBuffer, Renderer};
use kiln_ir::{KernelAst, VarVals};
use kiln_schedule::{CandidateEvaluator, Kernel, KernelCaps, SearchConfig, run_and_time};
use snafu::ResultExt;
use tracing::trace;

use crate::error::{DeviceSnafu, Error, OptSnafu, Result};

/// Key of a search outcome in the `kopt` table: device family, search tier
/// and the kernel's printed form.
pub fn search_key(family: &str, tier: u32, ast: &KernelAst) -> String {
    format!("{family}-{tier}-{ast}")
}

/// A compiled candidate, loaded on first timing.
pub struct Candidate {
    spec: ProgramSpec,
    lib: Vec<u8>,
    program: OnceCell<Box<dyn Program>>,
}

impl Candidate {
    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }
}

struct Scratch {
    raw: RawBuffer,
    nbytes: usize,
}

pub struct DeviceEvaluator {
    ast: Arc<KernelAst>,
    caps: Arc<KernelCaps>,
    renderer: Arc<dyn Renderer>,
    compiler: Arc<dyn Compiler>,
    device: Arc<Device>,
    scratch: Vec<Scratch>,
}

impl DeviceEvaluator {
    pub fn new(device: Arc<Device>, ast: Arc<KernelAst>) -> Result<Self> {
        let backend = device.backend().context(DeviceSnafu)?;
        let (renderer, compiler) = (Arc::clone(&backend.renderer), Arc::clone(&backend.compiler));
        let caps = Arc::clone(backend.caps());

        let mut nbytes = Vec::<usize>::new();
        let mut need = |buffer: usize, bytes: usize| {
            if nbytes.len() <= buffer {
                nbytes.resize(buffer + 1, 1);
            }
            nbytes[buffer] = nbytes[buffer].max(bytes);
        };
        for st in ast.stores() {
            need(st.buffer, st.view.span().max(1) as usize * st.dtype.itemsize());
        }
        for node in ast.nodes() {
            if let kiln_ir::AstNode::Load { buffer, view, dtype } = node {
                need(*buffer, view.span().max(1) as usize * dtype.itemsize());
            }
        }

        let options = BufferOptions { nolru: true, ..Default::default() };
        let allocator = device.allocator();
        let scratch = nbytes
            .into_iter()
            .map(|n| Ok(Scratch { raw: allocator.alloc(n, &options)?, nbytes: n }))
            .collect::<Result<Vec<_>, kiln_device::Error>>()
            .context(DeviceSnafu)?;
        Ok(Self { ast, caps, renderer, compiler, device, scratch })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Compile `kernel` and time it like a search candidate, in ms.
    pub fn time_kernel(&self, kernel: &Kernel, config: &SearchConfig) -> Result<f64> {
        let candidate = self.compile(kernel)?;
        run_and_time(self, &candidate, f64::INFINITY, config)
    }
}

impl Drop for DeviceEvaluator {
    fn drop(&mut self) {
        let options = BufferOptions { nolru: true, ..Default::default() };
        let allocator = self.device.allocator();
        for s in self.scratch.drain(..) {
            allocator.free(s.raw, s.nbytes, &options);
        }
    }
}

impl CandidateEvaluator for DeviceEvaluator {
    type Program = Candidate;
    type Error = Error;

    fn create_kernel(&self) -> Result<Kernel> {
        let mut k = Kernel::new(Arc::clone(&self.ast), Arc::clone(&self.caps)).context(OptSnafu)?;
        k.required_optimizations().context(OptSnafu)?;
        Ok(k)
    }

    fn compile(&self, kernel: &Kernel) -> Result<Candidate> {
        let spec = ProgramSpec::from_kernel(kernel, &*self.renderer, self.device.name()).context(DeviceSnafu)?;
        let lib = self.compiler.compile(&spec.src).context(DeviceSnafu)?;
        Ok(Candidate { spec, lib, program: OnceCell::new() })
    }

    fn time(&self, candidate: &Candidate) -> Result<Duration> {
        let program = match candidate.program.get() {
            Some(p) => p,
            None => {
                let loaded = self.device.load(&candidate.spec.name, &candidate.lib).context(DeviceSnafu)?;
                candidate.program.get_or_init(|| loaded)
            }
        };
        let vars = VarVals::new();
        let (global, local) = candidate.spec.launch_dims(&vars).context(DeviceSnafu)?;
        let ptrs: Vec<*mut u8> = self.scratch.iter().map(|s| s.raw.as_ptr()).collect();

        let start = Instant::now();
        // SAFETY: scratch allocations cover every index the kernel's views reach.
        unsafe { program.execute(&ptrs, &[], global, local) }.context(DeviceSnafu)?;
        self.device.synchronize().context(DeviceSnafu)?;
        let elapsed = start.elapsed();
        trace!(kernel.name = %candidate.spec.name, elapsed_us = elapsed.as_micros() as u64, "timed candidate");
        Ok(elapsed)
    }
}
