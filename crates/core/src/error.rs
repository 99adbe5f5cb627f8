//! Error types for flowtile

use thiserror::Error;

/// Main error type for flowtile operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({x}, {y}) in grid of size ({width}, {height})")]
    IndexOutOfBounds {
        x: isize,
        y: isize,
        width: usize,
        height: usize,
    },

    #[error("Raster size mismatch: expected {ew}x{eh}, got {aw}x{ah}")]
    SizeMismatch { ew: usize, eh: usize, aw: usize, ah: usize },

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Raster has no band {band} (band count {count})")]
    MissingBand { band: usize, count: usize },

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Worker id {worker} is out of range for a canvas sized for {workers} workers")]
    InvalidWorker { worker: usize, workers: usize },

    #[error("Failed to read rows {row_offset}..{} from band: {reason}", .row_offset + .rows)]
    BandRead {
        row_offset: usize,
        rows: usize,
        reason: String,
    },

    #[error("Failed to write rows {row_offset}..{} to band: {reason}", .row_offset + .rows)]
    BandWrite {
        row_offset: usize,
        rows: usize,
        reason: String,
    },

    #[error("Invalid sources file: {0}")]
    InvalidSourceFile(String),

    #[error(
        "Depression at ({x}, {y}): no downhill neighbour. Fill depressions in the elevation raster first"
    )]
    Depression { x: usize, y: usize },

    #[error("Run interrupted because another worker failed")]
    Interrupted,

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    #[error("GDAL error: {0}")]
    #[cfg(feature = "gdal")]
    Gdal(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "gdal")]
impl From<gdal::errors::GdalError> for Error {
    fn from(e: gdal::errors::GdalError) -> Self {
        Error::Gdal(e.to_string())
    }
}

impl Error {
    /// Whether this error only reports that the run was cancelled by another failure
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

/// Result type alias for flowtile operations
pub type Result<T> = std::result::Result<T, Error>;
