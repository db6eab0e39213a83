//! Backend contracts and the launch description shared by all of them.
//!
//! A backend is three pieces:
//! - **Renderer**: turns an optimized [`Kernel`] into source text
//! - **Compiler**: turns source into an executable artifact
//! - **Runtime**: loads an artifact as a [`Program`] bound to one device

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::{DType, SInt, VarVals, Variable, View};
use kiln_schedule::{Kernel, KernelCaps, Opt};
use snafu::ResultExt;

use crate::error::{IrSnafu, Result};

/// A loaded, executable kernel.
pub trait Program: Send + Sync {
    /// Launch once.
    ///
    /// `buffers` are in kernel argument order (outputs first), `vals` follow
    /// [`ProgramSpec::vars`].
    ///
    /// # Safety
    ///
    /// Every pointer must address a live allocation at least as large as the
    /// kernel's accesses through it, and nothing else may touch those bytes
    /// for the duration of the call.
    unsafe fn execute(
        &self,
        buffers: &[*mut u8],
        vals: &[i64],
        global_size: Option<[usize; 3]>,
        local_size: Option<[usize; 3]>,
    ) -> Result<()>;

    fn name(&self) -> &str;
}

pub trait Compiler: Send + Sync {
    fn compile(&self, src: &str) -> Result<Vec<u8>>;

    /// Identity of this compiler configuration for the persistent compile
    /// cache. `None` disables caching.
    fn cache_key(&self) -> Option<&str> {
        None
    }
}

pub trait Renderer: Send + Sync {
    fn render(&self, name: &str, kernel: &Kernel) -> Result<String>;

    /// What this renderer's kernels may use.
    fn caps(&self) -> &Arc<KernelCaps>;
}

/// Loads a compiled artifact: `(entry point, bytes) -> Program`.
pub type RuntimeFactory = Arc<dyn Fn(&str, &[u8]) -> Result<Box<dyn Program>> + Send + Sync>;

/// How a kernel reaches one of its buffer arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferAccess {
    /// Argument position.
    pub index: usize,
    pub dtype: DType,
    /// Every view the argument is read or written through.
    pub views: Vec<View>,
}

impl BufferAccess {
    /// `(lowest, one past highest)` element offset reached for `var_vals`,
    /// `None` when nothing is touched.
    pub fn extent(&self, var_vals: &VarVals) -> Result<Option<(i64, i64)>> {
        let mut out: Option<(i64, i64)> = None;
        for view in &self.views {
            if let Some((lo, hi)) = view.resolve(var_vals).context(IrSnafu)?.extent() {
                out = Some(out.map_or((lo, hi), |(a, b)| (a.min(lo), b.max(hi))));
            }
        }
        Ok(out)
    }
}

/// Everything needed to launch a rendered kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramSpec {
    pub name: String,
    pub src: String,
    /// Canonical device name.
    pub device: String,
    /// Launch grid, innermost first; symbolic until bound.
    pub global_size: Option<Vec<SInt>>,
    pub local_size: Option<Vec<SInt>>,
    /// Variables in launch order.
    pub vars: Vec<Variable>,
    pub op_estimate: SInt,
    pub mem_estimate: SInt,
    pub applied_opts: Vec<Opt>,
    /// Kernel argument indices written by the kernel.
    pub outs: Vec<usize>,
    /// Accessed arguments, by ascending index.
    pub buffers: Vec<BufferAccess>,
}

impl ProgramSpec {
    pub fn from_kernel(kernel: &Kernel, renderer: &dyn Renderer, device: &str) -> Result<Self> {
        let name = kernel.name();
        let src = renderer.render(&name, kernel)?;
        let (global_size, local_size) = kernel.launch_dims();
        Ok(Self {
            name,
            src,
            device: device.to_string(),
            global_size,
            local_size,
            vars: kernel.vars(),
            op_estimate: kernel.op_estimate(),
            mem_estimate: kernel.mem_estimate(),
            applied_opts: kernel.applied_opts().to_vec(),
            outs: kernel.lowered().output_buffers(),
            buffers: buffer_accesses(kernel),
        })
    }

    /// Number of buffer arguments a launch must pass.
    pub fn arity(&self) -> usize {
        self.buffers.last().map_or(0, |b| b.index + 1)
    }

    /// Resolve the launch grid against `var_vals`.
    pub fn launch_dims(&self, var_vals: &VarVals) -> Result<(Option<[usize; 3]>, Option<[usize; 3]>)> {
        let resolve = |dims: &Option<Vec<SInt>>| -> Result<Option<[usize; 3]>> {
            let Some(dims) = dims else { return Ok(None) };
            let mut out = [1usize; 3];
            for (slot, d) in out.iter_mut().zip(dims) {
                *slot = d.resolve(var_vals).context(IrSnafu)? as usize;
            }
            Ok(Some(out))
        };
        Ok((resolve(&self.global_size)?, resolve(&self.local_size)?))
    }

    /// Variable values in launch order.
    pub fn vals(&self, var_vals: &VarVals) -> Result<Vec<i64>> {
        self.vars
            .iter()
            .map(|v| {
                var_vals.get(v).copied().ok_or_else(|| kiln_ir::Error::UnboundVariable { name: v.name.clone() })
            })
            .collect::<kiln_ir::Result<_>>()
            .context(IrSnafu)
    }

    /// Same program addressed to another device of the same family.
    pub fn retarget(&self, device: &str) -> Self {
        Self { device: device.to_string(), ..self.clone() }
    }

    /// Fix the workgroup: `local` becomes the local size and the global size
    /// is divided by it.
    pub fn with_local_size(&self, local: [usize; 3]) -> Self {
        let global = self.global_size.as_ref().map(|g| {
            g.iter()
                .zip(local)
                .map(|(d, l)| d.clone().floor_div(l as i64).unwrap_or_else(|_| d.clone()))
                .collect()
        });
        Self {
            global_size: global,
            local_size: Some(local.iter().map(|&l| SInt::from(l)).collect()),
            ..self.clone()
        }
    }

    pub fn estimates(&self, var_vals: &VarVals) -> Result<(i64, i64)> {
        Ok((
            self.op_estimate.resolve(var_vals).context(IrSnafu)?,
            self.mem_estimate.resolve(var_vals).context(IrSnafu)?,
        ))
    }
}

/// Accesses of the untouched AST: splits and permutations reach the same
/// elements, so its views bound every launch.
fn buffer_accesses(kernel: &Kernel) -> Vec<BufferAccess> {
    let mut by_index: BTreeMap<usize, BufferAccess> = BTreeMap::new();
    for (index, view, dtype) in kernel.ast().accesses() {
        by_index
            .entry(index)
            .or_insert_with(|| BufferAccess { index, dtype: dtype.clone(), views: Vec::new() })
            .views
            .push(view.clone());
    }
    by_index.into_values().collect()
}
