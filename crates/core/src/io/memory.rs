//! In-memory raster band

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use ndarray::{s, Array2};

use super::band::{BandMeta, RasterBand, Window};
use crate::error::{Error, Result};
use crate::raster::{CellType, RasterElement};

/// A raster band held entirely in memory.
///
/// Values are stored as `f64` and rounded to the declared cell type on
/// write, so a band behaves like its on-disk counterpart. Window reads and
/// writes are counted, which lets tests observe what the tile cache
/// actually transfers.
#[derive(Debug)]
pub struct MemoryBand {
    cell_type: CellType,
    data: RwLock<Array2<f64>>,
    meta: RwLock<BandMeta>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryBand {
    /// Create a zero-filled band
    pub fn new(width: usize, height: usize, cell_type: CellType) -> Self {
        Self::from_array(Array2::zeros((height, width)), cell_type)
    }

    /// Create a band from row-major values
    pub fn from_vec(width: usize, height: usize, cell_type: CellType, values: Vec<f64>) -> Result<Self> {
        let array = Array2::from_shape_vec((height, width), values)
            .map_err(|_| Error::InvalidDimensions { width, height })?;
        Ok(Self::from_array(array, cell_type))
    }

    /// Create a band from an `(rows, cols)` array
    pub fn from_array(data: Array2<f64>, cell_type: CellType) -> Self {
        let data = data.mapv(|v| quantize(cell_type, v));
        Self {
            cell_type,
            data: RwLock::new(data),
            meta: RwLock::new(BandMeta::default()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Create an empty band with the size and metadata of another band
    pub fn like(other: &dyn RasterBand, cell_type: CellType) -> Self {
        let band = Self::new(other.width(), other.height(), cell_type);
        *band.meta.write().unwrap_or_else(PoisonError::into_inner) = other.meta();
        band
    }

    pub fn with_nodata(self, nodata: Option<f64>) -> Self {
        self.meta.write().unwrap_or_else(PoisonError::into_inner).nodata = nodata;
        self
    }

    /// Value at (x, y)
    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get((y, x))
            .copied()
    }

    /// Copy of every cell in row-major order
    pub fn to_vec(&self) -> Vec<f64> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Number of window reads served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of window writes received so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn read_cells<T: RasterElement>(&self, window: Window, buf: &mut [T]) -> Result<()> {
        window.validate(self.width(), self.height(), buf.len())?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let view = data.slice(s![
            window.y..window.y + window.height,
            window.x..window.x + window.width
        ]);
        for (out, &v) in buf.iter_mut().zip(view.iter()) {
            *out = num_traits::cast(v).unwrap_or(T::default_nodata());
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_cells<T: RasterElement>(&self, window: Window, buf: &[T]) -> Result<()> {
        window.validate(self.width(), self.height(), buf.len())?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut view = data.slice_mut(s![
            window.y..window.y + window.height,
            window.x..window.x + window.width
        ]);
        for (cell, &v) in view.iter_mut().zip(buf) {
            *cell = quantize(self.cell_type, v.to_f64().unwrap_or(f64::NAN));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Round a value the way the storage type would
fn quantize(cell_type: CellType, v: f64) -> f64 {
    match cell_type {
        CellType::Float64 => v,
        CellType::Float32 => v as f32 as f64,
        CellType::Int8 => v as i8 as f64,
        CellType::UInt8 => v as u8 as f64,
        CellType::Int32 => v as i32 as f64,
        CellType::UInt32 => v as u32 as f64,
        CellType::UInt64 => v as u64 as f64,
    }
}

impl RasterBand for MemoryBand {
    fn width(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).ncols()
    }

    fn height(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).nrows()
    }

    fn cell_type(&self) -> CellType {
        self.cell_type
    }

    fn meta(&self) -> BandMeta {
        self.meta.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_meta(&self, meta: BandMeta) -> Result<()> {
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = meta;
        Ok(())
    }

    forward_typed_io!();
}
