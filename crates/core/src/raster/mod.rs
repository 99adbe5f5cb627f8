//! Raster data structures and metadata

mod element;
mod geotransform;
mod grid;
mod neighborhood;

pub use element::{CellType, CellValue, RasterElement};
pub use geotransform::GeoTransform;
pub use grid::Grid;
pub use neighborhood::d8;
