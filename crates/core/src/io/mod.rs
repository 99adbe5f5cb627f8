//! Raster band I/O
//!
//! The tile cache only talks to [`RasterBand`]. Three implementations ship
//! with the crate: [`MemoryBand`], the disk-backed [`RawBand`], and
//! [`GdalBand`] behind the `gdal` feature. GeoTIFF files can also be
//! imported and exported natively through the `tiff` crate.

#[macro_use]
mod band;
#[cfg(feature = "gdal")]
mod gdal_io;
mod memory;
mod native;
mod raw;

pub use band::{read_band, BandCell, BandMeta, RasterBand, Window};
#[cfg(feature = "gdal")]
pub use gdal_io::GdalBand;
pub use memory::MemoryBand;
pub use native::{read_geotiff, read_geotiff_from_buffer, write_geotiff, write_geotiff_to_buffer};
pub use raw::RawBand;
