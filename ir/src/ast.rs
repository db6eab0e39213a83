//! Kernel AST: one fused kernel as stores of element-wise / reduce trees.
//!
//! The AST is a value type. Two ASTs built the same way are equal and hash the
//! same, which is what the kernel cache keys on. Its [`Display`] form is the
//! stable string identity used for persisted search choices.
//!
//! [`Display`]: std::fmt::Display

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use kiln_dtype::DType;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::*;
use crate::shape::View;
use crate::sint::{SInt, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOp {
    Neg,
    Exp2,
    Log2,
    Sqrt,
    Recip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    CmpLt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    pub fn identity(&self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }
}

/// Literal value embedded in a kernel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ConstValue::Int(v) => *v as f64,
            ConstValue::Float(v) => *v,
        }
    }
}

// Bitwise identity so that NaN literals still hash consistently.
impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstValue::Int(a), ConstValue::Int(b)) => a == b,
            (ConstValue::Float(a), ConstValue::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ConstValue::Int(v) => v.hash(state),
            ConstValue::Float(v) => v.to_bits().hash(state),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Float(v) => write!(f, "{v:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AstNode {
    /// Read from kernel buffer argument `buffer` through `view`.
    Load { buffer: usize, view: View, dtype: DType },
    Const { value: ConstValue, dtype: DType },
    Unary { op: UnaryOp, src: Box<AstNode> },
    Binary { op: BinaryOp, lhs: Box<AstNode>, rhs: Box<AstNode> },
    /// Reduce `src` over `axes`, leaving those axes with extent 1.
    Reduce { op: ReduceOp, axes: Vec<usize>, src: Box<AstNode> },
}

impl AstNode {
    pub fn load(buffer: usize, view: View, dtype: DType) -> Self {
        AstNode::Load { buffer, view, dtype }
    }

    pub fn constant(value: ConstValue, dtype: DType) -> Self {
        AstNode::Const { value, dtype }
    }

    pub fn unary(self, op: UnaryOp) -> Self {
        AstNode::Unary { op, src: Box::new(self) }
    }

    pub fn binary(self, op: BinaryOp, rhs: AstNode) -> Self {
        AstNode::Binary { op, lhs: Box::new(self), rhs: Box::new(rhs) }
    }

    pub fn reduce(self, op: ReduceOp, axes: Vec<usize>) -> Self {
        AstNode::Reduce { op, axes, src: Box::new(self) }
    }

    pub fn children(&self) -> Vec<&AstNode> {
        match self {
            AstNode::Load { .. } | AstNode::Const { .. } => vec![],
            AstNode::Unary { src, .. } | AstNode::Reduce { src, .. } => vec![src],
            AstNode::Binary { lhs, rhs, .. } => vec![lhs, rhs],
        }
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a AstNode)) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    fn visit_views_mut(&mut self, f: &mut impl FnMut(&mut View) -> Result<()>) -> Result<()> {
        match self {
            AstNode::Load { view, .. } => f(view),
            AstNode::Const { .. } => Ok(()),
            AstNode::Unary { src, .. } | AstNode::Reduce { src, .. } => src.visit_views_mut(f),
            AstNode::Binary { lhs, rhs, .. } => {
                lhs.visit_views_mut(f)?;
                rhs.visit_views_mut(f)
            }
        }
    }
}

impl std::ops::Add for AstNode {
    type Output = AstNode;

    fn add(self, rhs: AstNode) -> AstNode {
        self.binary(BinaryOp::Add, rhs)
    }
}

impl std::ops::Mul for AstNode {
    type Output = AstNode;

    fn mul(self, rhs: AstNode) -> AstNode {
        self.binary(BinaryOp::Mul, rhs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Store {
    pub buffer: usize,
    pub view: View,
    pub dtype: DType,
    pub src: AstNode,
}

impl Store {
    pub fn new(buffer: usize, view: View, dtype: DType, src: AstNode) -> Self {
        Self { buffer, view, dtype, src }
    }
}

/// One kernel: a list of stores sharing the same iteration space.
///
/// Always holds at least one store, and every view has the same rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Store>", into = "Vec<Store>")]
pub struct KernelAst {
    stores: Vec<Store>,
}

impl TryFrom<Vec<Store>> for KernelAst {
    type Error = Error;

    fn try_from(stores: Vec<Store>) -> Result<Self> {
        Self::new(stores)
    }
}

impl From<KernelAst> for Vec<Store> {
    fn from(ast: KernelAst) -> Self {
        ast.stores
    }
}

impl KernelAst {
    /// Build and validate a kernel: at least one store, one rank throughout.
    pub fn new(stores: Vec<Store>) -> Result<Self> {
        ensure!(!stores.is_empty(), EmptyKernelSnafu);
        let ast = Self { stores };
        let rank = ast.stores[0].view.ndim();
        for view in ast.views() {
            ensure!(view.ndim() == rank, RankMismatchSnafu { expected: rank, actual: view.ndim() });
        }
        Ok(ast)
    }

    pub fn single(store: Store) -> Result<Self> {
        Self::new(vec![store])
    }

    pub fn stores(&self) -> &[Store] {
        &self.stores
    }

    pub fn rank(&self) -> usize {
        self.stores[0].view.ndim()
    }

    pub fn nodes(&self) -> Vec<&AstNode> {
        let mut out = Vec::new();
        for st in &self.stores {
            st.src.visit(&mut |n| out.push(n));
        }
        out
    }

    /// Every view in the kernel, stores first.
    pub fn views(&self) -> Vec<&View> {
        let mut out: Vec<&View> = self.stores.iter().map(|s| &s.view).collect();
        for node in self.nodes() {
            if let AstNode::Load { view, .. } = node {
                out.push(view);
            }
        }
        out
    }

    /// Apply `f` to every view, stores first.
    pub fn map_views(&mut self, mut f: impl FnMut(&mut View) -> Result<()>) -> Result<()> {
        for st in &mut self.stores {
            f(&mut st.view)?;
        }
        for st in &mut self.stores {
            st.src.visit_views_mut(&mut f)?;
        }
        Ok(())
    }

    /// `(buffer, view, dtype)` for every access, stores first.
    pub fn accesses(&self) -> Vec<(usize, &View, &DType)> {
        let mut out: Vec<_> = self.stores.iter().map(|s| (s.buffer, &s.view, &s.dtype)).collect();
        for node in self.nodes() {
            if let AstNode::Load { buffer, view, dtype } = node {
                out.push((*buffer, view, dtype));
            }
        }
        out
    }

    /// Kernel buffer arguments in order, each with the dtype it is accessed as.
    pub fn buffers(&self) -> Vec<(usize, DType)> {
        let mut seen = std::collections::BTreeMap::new();
        for (buffer, _, dtype) in self.accesses() {
            seen.entry(buffer).or_insert_with(|| dtype.clone());
        }
        seen.into_iter().collect()
    }

    pub fn output_buffers(&self) -> Vec<usize> {
        self.stores.iter().map(|s| s.buffer).collect()
    }

    pub fn reduce(&self) -> Option<(ReduceOp, &[usize])> {
        self.nodes().into_iter().find_map(|n| match n {
            AstNode::Reduce { op, axes, .. } => Some((*op, axes.as_slice())),
            _ => None,
        })
    }

    /// Iteration space: per axis the largest extent over all views.
    pub fn full_shape(&self) -> Vec<SInt> {
        let mut shape = self.stores[0].view.shape.clone();
        for view in self.views() {
            for (dst, src) in shape.iter_mut().zip(&view.shape) {
                if *dst == SInt::Const(1) {
                    *dst = src.clone();
                }
            }
        }
        shape
    }

    pub fn vars(&self) -> BTreeSet<Variable> {
        let mut out = BTreeSet::new();
        for view in self.views() {
            out.extend(view.vars());
        }
        out
    }

    /// ALU operations evaluated per point of the iteration space.
    pub fn alu_count(&self) -> usize {
        self.nodes()
            .into_iter()
            .filter(|n| matches!(n, AstNode::Unary { .. } | AstNode::Binary { .. } | AstNode::Reduce { .. }))
            .count()
    }

    /// xxh64 of the display string.
    pub fn content_hash(&self) -> u64 {
        xxhash_rust::xxh64::xxh64(self.to_string().as_bytes(), 0)
    }
}

fn fmt_node(node: &AstNode, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match node {
        AstNode::Load { buffer, view, dtype } => write!(f, "(load {buffer} {dtype} {view})"),
        AstNode::Const { value, dtype } => write!(f, "(const {value} {dtype})"),
        AstNode::Unary { op, src } => {
            write!(f, "({op} ")?;
            fmt_node(src, f)?;
            write!(f, ")")
        }
        AstNode::Binary { op, lhs, rhs } => {
            write!(f, "({op} ")?;
            fmt_node(lhs, f)?;
            write!(f, " ")?;
            fmt_node(rhs, f)?;
            write!(f, ")")
        }
        AstNode::Reduce { op, axes, src } => {
            write!(f, "(reduce {op} {axes:?} ")?;
            fmt_node(src, f)?;
            write!(f, ")")
        }
    }
}

impl fmt::Display for KernelAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, st) in self.stores.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "(store {} {} {} ", st.buffer, st.dtype, st.view)?;
            fmt_node(&st.src, f)?;
            write!(f, ")")?;
        }
        Ok(())
    }
}
