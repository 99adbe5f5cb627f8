//! Raster element traits for generic cell values

use num_traits::{NumCast, Zero};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::atomic::{
    AtomicI32, AtomicI8, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

/// Storage type of a raster band, selected once per band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    Int8,
    UInt8,
    Int32,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl CellType {
    /// Bytes per cell
    pub fn size_bytes(self) -> usize {
        match self {
            CellType::Int8 | CellType::UInt8 => 1,
            CellType::Int32 | CellType::UInt32 | CellType::Float32 => 4,
            CellType::UInt64 | CellType::Float64 => 8,
        }
    }

    /// Stable numeric tag used by on-disk headers
    pub fn code(self) -> u8 {
        match self {
            CellType::Int8 => 1,
            CellType::UInt8 => 2,
            CellType::Int32 => 3,
            CellType::UInt32 => 4,
            CellType::UInt64 => 5,
            CellType::Float32 => 6,
            CellType::Float64 => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => CellType::Int8,
            2 => CellType::UInt8,
            3 => CellType::Int32,
            4 => CellType::UInt32,
            5 => CellType::UInt64,
            6 => CellType::Float32,
            7 => CellType::Float64,
            _ => return None,
        })
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellType::Int8 => "int8",
            CellType::UInt8 => "uint8",
            CellType::Int32 => "int32",
            CellType::UInt32 => "uint32",
            CellType::UInt64 => "uint64",
            CellType::Float32 => "float32",
            CellType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Trait for types that can be stored in a raster cell.
///
/// This trait bounds the types that can be used as raster values,
/// ensuring they support necessary numeric operations.
pub trait RasterElement:
    Copy + Clone + Debug + PartialOrd + PartialEq + NumCast + Zero + Send + Sync + 'static
{
    /// Band storage type matching this element
    const CELL_TYPE: CellType;

    /// Default no-data value for this type
    fn default_nodata() -> Self;

    /// Check if this value represents no-data
    fn is_nodata(&self, nodata: Option<Self>) -> bool;

    /// Convert self to f64
    fn to_f64(self) -> Option<f64> {
        NumCast::from(self)
    }
}

/// A raster element with a lock-free shared cell representation.
///
/// Cells of a cached band are read and written by several workers at once,
/// so every cell lives in an atomic container. All accesses use relaxed
/// ordering; ordering between cells comes from the locks around them.
pub trait CellValue: RasterElement {
    type Atomic: Send + Sync + Debug;

    fn new_atomic(value: Self) -> Self::Atomic;

    fn load(cell: &Self::Atomic) -> Self;

    fn store(cell: &Self::Atomic, value: Self);
}

macro_rules! impl_cell_int {
    ($t:ty, $atomic:ty, $cell_type:expr) => {
        impl RasterElement for $t {
            const CELL_TYPE: CellType = $cell_type;

            fn default_nodata() -> Self {
                <$t>::MIN
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                match nodata {
                    Some(nd) => *self == nd,
                    None => false,
                }
            }
        }

        impl CellValue for $t {
            type Atomic = $atomic;

            #[inline]
            fn new_atomic(value: Self) -> Self::Atomic {
                <$atomic>::new(value)
            }

            #[inline(always)]
            fn load(cell: &Self::Atomic) -> Self {
                cell.load(Ordering::Relaxed)
            }

            #[inline(always)]
            fn store(cell: &Self::Atomic, value: Self) {
                cell.store(value, Ordering::Relaxed)
            }
        }
    };
}

macro_rules! impl_cell_float {
    ($t:ty, $atomic:ty, $cell_type:expr) => {
        impl RasterElement for $t {
            const CELL_TYPE: CellType = $cell_type;

            fn default_nodata() -> Self {
                <$t>::NAN
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                if self.is_nan() {
                    return true;
                }
                match nodata {
                    Some(nd) => (self - nd).abs() < <$t>::EPSILON * 100.0,
                    None => false,
                }
            }
        }

        impl CellValue for $t {
            type Atomic = $atomic;

            #[inline]
            fn new_atomic(value: Self) -> Self::Atomic {
                <$atomic>::new(value.to_bits())
            }

            #[inline(always)]
            fn load(cell: &Self::Atomic) -> Self {
                <$t>::from_bits(cell.load(Ordering::Relaxed))
            }

            #[inline(always)]
            fn store(cell: &Self::Atomic, value: Self) {
                cell.store(value.to_bits(), Ordering::Relaxed)
            }
        }
    };
}

impl_cell_int!(i8, AtomicI8, CellType::Int8);
impl_cell_int!(u8, AtomicU8, CellType::UInt8);
impl_cell_int!(i32, AtomicI32, CellType::Int32);
impl_cell_int!(u32, AtomicU32, CellType::UInt32);
impl_cell_int!(u64, AtomicU64, CellType::UInt64);
impl_cell_float!(f32, AtomicU32, CellType::Float32);
impl_cell_float!(f64, AtomicU64, CellType::Float64);
