pub mod ext;

pub use ext::Element;

#[cfg(test)]
pub mod test;

/// Image element layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum ImageKind {
    /// Half precision texels.
    Half,
    /// Single precision texels.
    Float,
}

/// Scalar data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr, strum::Display)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum ScalarDType {
    #[strum(to_string = "bool")]
    Bool = 0,

    #[strum(to_string = "char")]
    Int8 = 1,
    #[strum(to_string = "uchar")]
    UInt8 = 2,
    #[strum(to_string = "short")]
    Int16 = 3,
    #[strum(to_string = "ushort")]
    UInt16 = 4,
    #[strum(to_string = "int")]
    Int32 = 5,
    #[strum(to_string = "uint")]
    UInt32 = 6,
    #[strum(to_string = "long")]
    Int64 = 7,
    #[strum(to_string = "ulong")]
    UInt64 = 8,

    #[strum(to_string = "half")]
    Float16 = 9,
    #[strum(to_string = "float")]
    Float32 = 10,
    #[strum(to_string = "double")]
    Float64 = 11,
}

/// Element type of a buffer or kernel value.
///
/// Image types describe a 2D texture of `shape = [height, width]` with four
/// channels per texel; their element is always `Float32` once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum DType {
    Scalar(ScalarDType),
    Image { kind: ImageKind, shape: [usize; 2] },
}

impl ScalarDType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }
}

impl From<ScalarDType> for DType {
    fn from(scalar: ScalarDType) -> Self {
        Self::Scalar(scalar)
    }
}

impl DType {
    pub const fn image(kind: ImageKind, height: usize, width: usize) -> Self {
        Self::Image { kind, shape: [height, width] }
    }

    pub fn scalar(&self) -> Option<ScalarDType> {
        match self {
            Self::Scalar(s) => Some(*s),
            Self::Image { .. } => None,
        }
    }

    /// Scalar type values of this dtype are computed in.
    pub fn base(&self) -> ScalarDType {
        match self {
            Self::Scalar(s) => *s,
            Self::Image { .. } => ScalarDType::Float32,
        }
    }

    /// Size in bytes of one element.
    pub fn itemsize(&self) -> usize {
        match self {
            Self::Scalar(s) => s.bytes(),
            Self::Image { kind: ImageKind::Half, .. } => 2,
            Self::Image { kind: ImageKind::Float, .. } => 4,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }

    pub fn is_float(&self) -> bool {
        self.base().is_float()
    }

    pub fn is_int(&self) -> bool {
        self.scalar().is_some_and(|s| s.is_int())
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Scalar(ScalarDType::Bool))
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Image { kind: ImageKind::Half, shape } => write!(f, "imageh({}, {})", shape[0], shape[1]),
            Self::Image { kind: ImageKind::Float, shape } => write!(f, "imagef({}, {})", shape[0], shape[1]),
        }
    }
}

#[allow(non_upper_case_globals)]
impl DType {
    pub const Bool: Self = Self::Scalar(ScalarDType::Bool);
    pub const Int8: Self = Self::Scalar(ScalarDType::Int8);
    pub const UInt8: Self = Self::Scalar(ScalarDType::UInt8);
    pub const Int16: Self = Self::Scalar(ScalarDType::Int16);
    pub const UInt16: Self = Self::Scalar(ScalarDType::UInt16);
    pub const Int32: Self = Self::Scalar(ScalarDType::Int32);
    pub const UInt32: Self = Self::Scalar(ScalarDType::UInt32);
    pub const Int64: Self = Self::Scalar(ScalarDType::Int64);
    pub const UInt64: Self = Self::Scalar(ScalarDType::UInt64);
    pub const Float16: Self = Self::Scalar(ScalarDType::Float16);
    pub const Float32: Self = Self::Scalar(ScalarDType::Float32);
    pub const Float64: Self = Self::Scalar(ScalarDType::Float64);
}
