//! What a backend's code generator can express.
//!
//! The optimizer consults these limits before applying any transformation so
//! that every kernel it produces is one the backend can render.

use kiln_dtype::DType;

/// One split step of a tensor-core lowering: halve dimension `0=N, 1=M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcOpt {
    Upcast(usize),
    Local(usize),
}

impl TcOpt {
    pub const fn dim(&self) -> usize {
        match self {
            Self::Upcast(dim) | Self::Local(dim) => *dim,
        }
    }
}

/// A hardware matrix-multiply unit computing an `N x M` tile over `K`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorCore {
    /// Tile dimensions (N, M, K).
    pub dims: (usize, usize, usize),
    pub dtype_in: DType,
    pub dtype_out: DType,
    /// Halving steps over N and M; the remaining factor of each dimension is upcast.
    pub opts: Vec<TcOpt>,
}

impl TensorCore {
    /// Factor left for the trailing upcast of dimension `dim` after all halving steps.
    pub fn remaining(&self, dim: usize) -> usize {
        let total = if dim == 0 { self.dims.0 } else { self.dims.1 };
        let halvings = self.opts.iter().filter(|o| o.dim() == dim).count() as u32;
        total >> halvings
    }
}

#[derive(Debug, Clone)]
pub struct KernelCaps {
    /// Family name, e.g. "CPU".
    pub device: String,
    pub has_local: bool,
    pub has_shared: bool,
    /// Largest workgroup (product of local dims).
    pub local_max: usize,
    /// Largest register tile (product of upcast and unroll dims).
    pub upcast_max: usize,
    pub tensor_cores: Vec<TensorCore>,
}

impl KernelCaps {
    /// Sequential host backend: no workgroups.
    pub fn cpu() -> Self {
        Self {
            device: "CPU".to_string(),
            has_local: false,
            has_shared: false,
            local_max: 1,
            upcast_max: 256,
            tensor_cores: vec![],
        }
    }

    /// Workgroup-style backend with an 8x8x8 float tensor core.
    pub fn gpu(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            has_local: true,
            has_shared: true,
            local_max: 1024,
            upcast_max: 256,
            tensor_cores: vec![TensorCore {
                dims: (8, 8, 8),
                dtype_in: DType::Float32,
                dtype_out: DType::Float32,
                opts: vec![TcOpt::Local(0), TcOpt::Local(1), TcOpt::Local(0), TcOpt::Local(1)],
            }],
        }
    }
}
