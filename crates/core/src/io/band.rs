//! Raster band interface consumed by the tile cache

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{CellType, CellValue, GeoTransform};

/// Rectangular pixel window, in cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Full-width band of `rows` rows starting at `row_offset`
    pub fn rows(row_offset: usize, rows: usize, width: usize) -> Self {
        Self::new(0, row_offset, width, rows)
    }

    /// Number of cells in the window
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the window against a band's extent and a buffer length
    pub fn validate(&self, band_width: usize, band_height: usize, buffer_len: usize) -> Result<()> {
        if self.x + self.width > band_width || self.y + self.height > band_height {
            return Err(Error::InvalidParameter {
                name: "window",
                value: format!("{:?}", self),
                reason: format!("exceeds band extent {}x{}", band_width, band_height),
            });
        }
        if buffer_len != self.len() {
            return Err(Error::SizeMismatch {
                ew: self.width,
                eh: self.height,
                aw: buffer_len,
                ah: 1,
            });
        }
        Ok(())
    }
}

/// Georeferencing and no-data metadata of a band
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandMeta {
    pub nodata: Option<f64>,
    pub transform: GeoTransform,
    pub crs: Option<CRS>,
}

/// A single raster band that can be read and written by window.
///
/// There is one typed entry point per supported cell type; a band converts
/// between its storage type and the requested one. Implementations must be
/// safe to call from several threads.
pub trait RasterBand: Send + Sync {
    /// Width in cells
    fn width(&self) -> usize;

    /// Height in cells
    fn height(&self) -> usize;

    /// Storage type
    fn cell_type(&self) -> CellType;

    fn meta(&self) -> BandMeta;

    fn set_meta(&self, meta: BandMeta) -> Result<()>;

    fn read_i8(&self, window: Window, buf: &mut [i8]) -> Result<()>;
    fn read_u8(&self, window: Window, buf: &mut [u8]) -> Result<()>;
    fn read_i32(&self, window: Window, buf: &mut [i32]) -> Result<()>;
    fn read_u32(&self, window: Window, buf: &mut [u32]) -> Result<()>;
    fn read_u64(&self, window: Window, buf: &mut [u64]) -> Result<()>;
    fn read_f32(&self, window: Window, buf: &mut [f32]) -> Result<()>;
    fn read_f64(&self, window: Window, buf: &mut [f64]) -> Result<()>;

    fn write_i8(&self, window: Window, buf: &[i8]) -> Result<()>;
    fn write_u8(&self, window: Window, buf: &[u8]) -> Result<()>;
    fn write_i32(&self, window: Window, buf: &[i32]) -> Result<()>;
    fn write_u32(&self, window: Window, buf: &[u32]) -> Result<()>;
    fn write_u64(&self, window: Window, buf: &[u64]) -> Result<()>;
    fn write_f32(&self, window: Window, buf: &[f32]) -> Result<()>;
    fn write_f64(&self, window: Window, buf: &[f64]) -> Result<()>;

    /// Persist buffered writes
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nodata(&self) -> Option<f64> {
        self.meta().nodata
    }

    fn set_nodata(&self, nodata: Option<f64>) -> Result<()> {
        let mut meta = self.meta();
        meta.nodata = nodata;
        self.set_meta(meta)
    }

    fn geo_transform(&self) -> GeoTransform {
        self.meta().transform
    }

    fn set_geo_transform(&self, transform: GeoTransform) -> Result<()> {
        let mut meta = self.meta();
        meta.transform = transform;
        self.set_meta(meta)
    }

    fn crs(&self) -> Option<CRS> {
        self.meta().crs
    }

    fn set_crs(&self, crs: Option<CRS>) -> Result<()> {
        let mut meta = self.meta();
        meta.crs = crs;
        self.set_meta(meta)
    }
}

/// Implements the typed entry points of [`RasterBand`] by forwarding to
/// generic `read_cells`/`write_cells` methods on the implementing type.
macro_rules! forward_typed_io {
    () => {
        fn read_i8(&self, window: Window, buf: &mut [i8]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn read_u8(&self, window: Window, buf: &mut [u8]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn read_i32(&self, window: Window, buf: &mut [i32]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn read_u32(&self, window: Window, buf: &mut [u32]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn read_u64(&self, window: Window, buf: &mut [u64]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn read_f32(&self, window: Window, buf: &mut [f32]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn read_f64(&self, window: Window, buf: &mut [f64]) -> Result<()> {
            self.read_cells(window, buf)
        }
        fn write_i8(&self, window: Window, buf: &[i8]) -> Result<()> {
            self.write_cells(window, buf)
        }
        fn write_u8(&self, window: Window, buf: &[u8]) -> Result<()> {
            self.write_cells(window, buf)
        }
        fn write_i32(&self, window: Window, buf: &[i32]) -> Result<()> {
            self.write_cells(window, buf)
        }
        fn write_u32(&self, window: Window, buf: &[u32]) -> Result<()> {
            self.write_cells(window, buf)
        }
        fn write_u64(&self, window: Window, buf: &[u64]) -> Result<()> {
            self.write_cells(window, buf)
        }
        fn write_f32(&self, window: Window, buf: &[f32]) -> Result<()> {
            self.write_cells(window, buf)
        }
        fn write_f64(&self, window: Window, buf: &[f64]) -> Result<()> {
            self.write_cells(window, buf)
        }
    };
}

/// Cell types the cache can move to and from a band.
///
/// Each implementation picks its typed band entry point at compile time.
pub trait BandCell: CellValue {
    fn read_window(band: &dyn RasterBand, window: Window, buf: &mut [Self]) -> Result<()>;

    fn write_window(band: &dyn RasterBand, window: Window, buf: &[Self]) -> Result<()>;
}

macro_rules! impl_band_cell {
    ($t:ty, $read:ident, $write:ident) => {
        impl BandCell for $t {
            #[inline]
            fn read_window(band: &dyn RasterBand, window: Window, buf: &mut [Self]) -> Result<()> {
                band.$read(window, buf)
            }

            #[inline]
            fn write_window(band: &dyn RasterBand, window: Window, buf: &[Self]) -> Result<()> {
                band.$write(window, buf)
            }
        }
    };
}

impl_band_cell!(i8, read_i8, write_i8);
impl_band_cell!(u8, read_u8, write_u8);
impl_band_cell!(i32, read_i32, write_i32);
impl_band_cell!(u32, read_u32, write_u32);
impl_band_cell!(u64, read_u64, write_u64);
impl_band_cell!(f32, read_f32, write_f32);
impl_band_cell!(f64, read_f64, write_f64);

/// Read a whole band into memory
pub fn read_band<T: BandCell>(band: &dyn RasterBand) -> Result<Vec<T>> {
    let window = Window::rows(0, band.height(), band.width());
    let mut buf = vec![T::zero(); window.len()];
    T::read_window(band, window, &mut buf)?;
    Ok(buf)
}
