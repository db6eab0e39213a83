//! Reference interpreter backend.
//!
//! The "source" of a kernel is its lowered AST serialized as JSON; compiling
//! validates it and running it walks the iteration space on the host, one
//! output point at a time, accumulating reductions in `f64`. The launch grid
//! is only checked against the workgroup limit: every launch covers the whole
//! iteration space.

use std::sync::Arc;

use kiln_device::{Compiler, Error, Program, Renderer, Result};
use kiln_dtype::{DType, ScalarDType};
use kiln_ir::{AstNode, BinaryOp, KernelAst, ReduceOp, ResolvedView, SInt, Store, UnaryOp, VarVals, Variable, resolve_all};
use kiln_schedule::{Kernel, KernelCaps};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use kiln_device::error::{CompileFailedSnafu, ExecutionSnafu, IrSnafu};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KernelSource {
    name: String,
    full_shape: Vec<SInt>,
    reduce_axes: Vec<usize>,
    vars: Vec<Variable>,
    stores: Vec<Store>,
}

pub struct InterpreterRenderer {
    caps: Arc<KernelCaps>,
}

impl InterpreterRenderer {
    pub fn new(caps: KernelCaps) -> Self {
        Self { caps: Arc::new(caps) }
    }
}

impl Renderer for InterpreterRenderer {
    fn render(&self, name: &str, kernel: &Kernel) -> Result<String> {
        let src = KernelSource {
            name: name.to_string(),
            full_shape: kernel.full_shape().to_vec(),
            reduce_axes: kernel.reduce_axes(),
            vars: kernel.vars(),
            stores: kernel.lowered().stores().to_vec(),
        };
        serde_json::to_string(&src).map_err(|e| Error::CompileFailed { src: name.to_string(), log: e.to_string() })
    }

    fn caps(&self) -> &Arc<KernelCaps> {
        &self.caps
    }
}

/// Validates the source; the artifact is the source bytes.
#[derive(Debug, Default)]
pub struct InterpreterCompiler;

impl Compiler for InterpreterCompiler {
    fn compile(&self, src: &str) -> Result<Vec<u8>> {
        if let Err(e) = serde_json::from_str::<KernelSource>(src) {
            return CompileFailedSnafu { src, log: e.to_string() }.fail();
        }
        Ok(src.as_bytes().to_vec())
    }

    fn cache_key(&self) -> Option<&str> {
        Some("interp")
    }
}

pub struct InterpreterProgram {
    src: KernelSource,
    local_max: usize,
    /// Number of buffer arguments the kernel reads or writes.
    arity: usize,
}

impl InterpreterProgram {
    pub fn load(entry: &str, lib: &[u8], local_max: usize) -> Result<Self> {
        let src: KernelSource = serde_json::from_slice(lib)
            .map_err(|e| Error::Execution { name: entry.to_string(), reason: format!("bad artifact: {e}") })?;
        let ast = KernelAst::new(src.stores.clone())
            .map_err(|e| Error::Execution { name: entry.to_string(), reason: format!("bad artifact: {e}") })?;
        let arity = ast.buffers().last().map_or(0, |(i, _)| i + 1);
        Ok(Self { src, local_max, arity })
    }

    fn fail(&self, reason: impl Into<String>) -> Error {
        Error::Execution { name: self.src.name.clone(), reason: reason.into() }
    }

    fn resolve(&self, node: &AstNode, vals: &VarVals) -> Result<Node> {
        Ok(match node {
            AstNode::Load { buffer, view, dtype } => Node::Load {
                buffer: *buffer,
                view: view.resolve(vals).context(IrSnafu)?,
                dtype: self.scalar(dtype)?,
            },
            AstNode::Const { value, .. } => Node::Const(value.as_f64()),
            AstNode::Unary { op, src } => Node::Unary(*op, Box::new(self.resolve(src, vals)?)),
            AstNode::Binary { op, lhs, rhs } => {
                Node::Binary(*op, Box::new(self.resolve(lhs, vals)?), Box::new(self.resolve(rhs, vals)?))
            }
            AstNode::Reduce { op, src, .. } => Node::Reduce(*op, Box::new(self.resolve(src, vals)?)),
        })
    }

    fn scalar(&self, dtype: &DType) -> Result<ScalarDType> {
        match dtype {
            DType::Scalar(ScalarDType::Float16) => Err(self.fail("half precision is not interpreted")),
            DType::Scalar(s) => Ok(*s),
            DType::Image { .. } => Err(self.fail("image buffers are not interpreted")),
        }
    }
}

/// A kernel tree with every view resolved.
enum Node {
    Load { buffer: usize, view: ResolvedView, dtype: ScalarDType },
    Const(f64),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Reduce(ReduceOp, Box<Node>),
}

struct Walk<'a> {
    buffers: &'a [*mut u8],
    shape: &'a [usize],
    reduce_axes: &'a [usize],
}

impl Walk<'_> {
    /// # Safety
    ///
    /// Every load must stay inside its buffer.
    unsafe fn eval(&self, node: &Node, idx: &mut [usize]) -> f64 {
        match node {
            Node::Load { buffer, view, dtype } => unsafe { read(self.buffers[*buffer], *dtype, view.index(idx)) },
            Node::Const(v) => *v,
            Node::Unary(op, src) => {
                let x = unsafe { self.eval(src, idx) };
                match op {
                    UnaryOp::Neg => -x,
                    UnaryOp::Exp2 => x.exp2(),
                    UnaryOp::Log2 => x.log2(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Recip => 1.0 / x,
                }
            }
            Node::Binary(op, lhs, rhs) => {
                let (a, b) = unsafe { (self.eval(lhs, idx), self.eval(rhs, idx)) };
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Max => a.max(b),
                    BinaryOp::CmpLt => f64::from(u8::from(a < b)),
                }
            }
            Node::Reduce(op, src) => {
                let mut acc = op.identity();
                loop {
                    let x = unsafe { self.eval(src, idx) };
                    acc = match op {
                        ReduceOp::Sum => acc + x,
                        ReduceOp::Max => acc.max(x),
                    };
                    if !advance(idx, self.shape, self.reduce_axes) {
                        break;
                    }
                }
                acc
            }
        }
    }
}

/// Odometer step over `axes`; resets them to zero and returns false after the last point.
fn advance(idx: &mut [usize], shape: &[usize], axes: &[usize]) -> bool {
    for &axis in axes.iter().rev() {
        idx[axis] += 1;
        if idx[axis] < shape[axis] {
            return true;
        }
        idx[axis] = 0;
    }
    false
}

unsafe fn read(ptr: *mut u8, dtype: ScalarDType, offset: i64) -> f64 {
    let at = |size: usize| unsafe { ptr.offset(offset as isize * size as isize) };
    unsafe {
        match dtype {
            ScalarDType::Bool => f64::from(u8::from(at(1).read() != 0)),
            ScalarDType::Int8 => f64::from(at(1).cast::<i8>().read()),
            ScalarDType::UInt8 => f64::from(at(1).read()),
            ScalarDType::Int16 => f64::from(at(2).cast::<i16>().read_unaligned()),
            ScalarDType::UInt16 => f64::from(at(2).cast::<u16>().read_unaligned()),
            ScalarDType::Int32 => f64::from(at(4).cast::<i32>().read_unaligned()),
            ScalarDType::UInt32 => f64::from(at(4).cast::<u32>().read_unaligned()),
            ScalarDType::Int64 => at(8).cast::<i64>().read_unaligned() as f64,
            ScalarDType::UInt64 => at(8).cast::<u64>().read_unaligned() as f64,
            ScalarDType::Float32 => f64::from(at(4).cast::<f32>().read_unaligned()),
            ScalarDType::Float64 => at(8).cast::<f64>().read_unaligned(),
            ScalarDType::Float16 => f64::NAN,
        }
    }
}

unsafe fn write(ptr: *mut u8, dtype: ScalarDType, offset: i64, v: f64) {
    let at = |size: usize| unsafe { ptr.offset(offset as isize * size as isize) };
    unsafe {
        match dtype {
            ScalarDType::Bool => at(1).write(u8::from(v != 0.0)),
            ScalarDType::Int8 => at(1).cast::<i8>().write(v as i8),
            ScalarDType::UInt8 => at(1).write(v as u8),
            ScalarDType::Int16 => at(2).cast::<i16>().write_unaligned(v as i16),
            ScalarDType::UInt16 => at(2).cast::<u16>().write_unaligned(v as u16),
            ScalarDType::Int32 => at(4).cast::<i32>().write_unaligned(v as i32),
            ScalarDType::UInt32 => at(4).cast::<u32>().write_unaligned(v as u32),
            ScalarDType::Int64 => at(8).cast::<i64>().write_unaligned(v as i64),
            ScalarDType::UInt64 => at(8).cast::<u64>().write_unaligned(v as u64),
            ScalarDType::Float32 => at(4).cast::<f32>().write_unaligned(v as f32),
            ScalarDType::Float64 => at(8).cast::<f64>().write_unaligned(v),
            ScalarDType::Float16 => {}
        }
    }
}

impl Program for InterpreterProgram {
    unsafe fn execute(
        &self,
        buffers: &[*mut u8],
        vals: &[i64],
        _global_size: Option<[usize; 3]>,
        local_size: Option<[usize; 3]>,
    ) -> Result<()> {
        if let Some(local) = local_size {
            let size: usize = local.iter().product();
            ensure!(
                size <= self.local_max,
                ExecutionSnafu { name: &self.src.name, reason: format!("workgroup of {size} exceeds {}", self.local_max) }
            );
        }
        ensure!(
            vals.len() == self.src.vars.len(),
            ExecutionSnafu {
                name: &self.src.name,
                reason: format!("expected {} variable values, got {}", self.src.vars.len(), vals.len())
            }
        );
        let var_vals: VarVals = self.src.vars.iter().cloned().zip(vals.iter().copied()).collect();
        let shape = resolve_all(&self.src.full_shape, &var_vals).context(IrSnafu)?;
        if shape.contains(&0) {
            return Ok(());
        }

        ensure!(
            buffers.len() >= self.arity,
            ExecutionSnafu {
                name: &self.src.name,
                reason: format!("expected {} buffers, got {}", self.arity, buffers.len())
            }
        );

        let mut stores = Vec::with_capacity(self.src.stores.len());
        for st in &self.src.stores {
            let view = st.view.resolve(&var_vals).context(IrSnafu)?;
            stores.push((st.buffer, view, self.scalar(&st.dtype)?, self.resolve(&st.src, &var_vals)?));
        }

        let outer: Vec<usize> = (0..shape.len()).filter(|a| !self.src.reduce_axes.contains(a)).collect();
        let walk = Walk { buffers, shape: &shape, reduce_axes: &self.src.reduce_axes };
        let mut idx = vec![0usize; shape.len()];
        loop {
            for (buffer, view, dtype, src) in &stores {
                // SAFETY: the caller guarantees every buffer covers the kernel's accesses.
                unsafe {
                    let v = walk.eval(src, &mut idx);
                    write(buffers[*buffer], *dtype, view.index(&idx), v);
                }
            }
            if !advance(&mut idx, &shape, &outer) {
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.src.name
    }
}
