//! # flowtile core
//!
//! Core types, traits and I/O for the flowtile flow-routing engine.
//!
//! This crate provides:
//! - `Grid<T>`: flat 2D buffer of atomic cells
//! - `RasterBand`: windowed band I/O, with in-memory, raw-file, GeoTIFF and
//!   (optionally) GDAL backends
//! - `Canvas<T>`: tile cache giving random cell access to bands larger than memory
//! - D8 direction encoding, `GeoTransform` and `CRS` metadata
//! - The `Algorithm` trait implemented by the engine

pub mod crs;
pub mod error;
#[macro_use]
pub mod io;
pub mod cache;
pub mod raster;

pub use cache::{Access, Canvas, CanvasOptions, CellRef, LockMode};
pub use crs::CRS;
pub use error::{Error, Result};
pub use io::{BandCell, BandMeta, RasterBand};
pub use raster::{CellType, CellValue, GeoTransform, Grid, RasterElement};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cache::{Access, Canvas, CanvasOptions, CellRef, LockMode};
    pub use crate::crs::CRS;
    pub use crate::error::{Error, Result};
    pub use crate::io::{BandCell, BandMeta, MemoryBand, RasterBand, RawBand};
    pub use crate::raster::{d8, CellType, CellValue, GeoTransform, Grid, RasterElement};
    pub use crate::Algorithm;
}

/// Core trait for the algorithms built on flowtile.
///
/// An algorithm transforms its input according to a set of parameters.
pub trait Algorithm {
    /// Input type for the algorithm
    type Input;
    /// Output type for the algorithm
    type Output;
    /// Parameters controlling algorithm behavior
    type Params: Default;
    /// Error type for algorithm execution
    type Error: std::error::Error;

    /// Returns the algorithm name
    fn name(&self) -> &'static str;

    /// Returns a description of what the algorithm does
    fn description(&self) -> &'static str;

    /// Execute the algorithm
    fn execute(&self, input: Self::Input, params: Self::Params) -> std::result::Result<Self::Output, Self::Error>;

    /// Execute with default parameters
    fn execute_default(&self, input: Self::Input) -> std::result::Result<Self::Output, Self::Error> {
        self.execute(input, Self::Params::default())
    }
}
