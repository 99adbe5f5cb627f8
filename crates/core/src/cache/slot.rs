//! Pooled band storage

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{Error, Result};
use crate::io::{BandCell, RasterBand, Window};
use crate::raster::Grid;

/// Index into the slot arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

const NO_TILE: usize = usize::MAX;

/// One horizontal band of a raster held in memory.
///
/// The grid is allocated on first use with room for a full band and is never
/// reallocated, so references into it stay valid for the life of the canvas.
/// Identity fields are atomics: a worker may read them without the pool lock.
#[derive(Debug)]
pub struct Slot<T: BandCell> {
    grid: OnceLock<Grid<T>>,
    tile_index: AtomicUsize,
    row_offset: AtomicUsize,
    height: AtomicUsize,
    /// Net number of cells that differ from the last load or write-back
    dirty: AtomicIsize,
}

impl<T: BandCell> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            grid: OnceLock::new(),
            tile_index: AtomicUsize::new(NO_TILE),
            row_offset: AtomicUsize::new(0),
            height: AtomicUsize::new(0),
            dirty: AtomicIsize::new(0),
        }
    }

    /// Band currently held, if any
    pub fn tile_index(&self) -> Option<usize> {
        match self.tile_index.load(Ordering::Acquire) {
            NO_TILE => None,
            tile => Some(tile),
        }
    }

    #[inline]
    pub(crate) fn holds(&self, tile: usize) -> bool {
        self.tile_index.load(Ordering::Acquire) == tile
    }

    /// First raster row of the band
    pub fn row_offset(&self) -> usize {
        self.row_offset.load(Ordering::Acquire)
    }

    /// Rows in the band; the last band of a raster may be shorter than the step
    pub fn height(&self) -> usize {
        self.height.load(Ordering::Acquire)
    }

    pub fn dirty_count(&self) -> isize {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_count() != 0
    }

    #[inline]
    pub(crate) fn add_dirty(&self, delta: isize) {
        self.dirty.fetch_add(delta, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn grid(&self) -> Option<&Grid<T>> {
        self.grid.get()
    }

    /// Replace the slot content with rows `row_offset..row_offset + rows` of `band`.
    ///
    /// The slot holds no band while loading, so a failed read never leaves
    /// stale data under a valid tile index.
    pub(crate) fn load(
        &self,
        band: &dyn RasterBand,
        tile: usize,
        row_offset: usize,
        rows: usize,
        step: usize,
    ) -> Result<()> {
        let width = band.width();
        self.tile_index.store(NO_TILE, Ordering::Release);
        let grid = self.grid.get_or_init(|| Grid::new(width, step));

        let window = Window::rows(row_offset, rows, width);
        let mut buf = vec![T::zero(); window.len()];
        T::read_window(band, window, &mut buf).map_err(|e| Error::BandRead {
            row_offset,
            rows,
            reason: e.to_string(),
        })?;
        grid.store_prefix(&buf);

        self.row_offset.store(row_offset, Ordering::Release);
        self.height.store(rows, Ordering::Release);
        self.dirty.store(0, Ordering::Release);
        self.tile_index.store(tile, Ordering::Release);
        debug!("loaded band {} (rows {}..{})", tile, row_offset, row_offset + rows);
        Ok(())
    }

    /// Write the band back to `band` and reset the dirty count
    pub(crate) fn flush(&self, band: &dyn RasterBand) -> Result<()> {
        let Some(grid) = self.grid.get() else {
            return Ok(());
        };
        if self.tile_index().is_none() {
            return Ok(());
        }
        let row_offset = self.row_offset();
        let rows = self.height();
        let window = Window::rows(row_offset, rows, band.width());

        self.dirty.store(0, Ordering::Release);
        let buf = grid.load_prefix(window.len());
        T::write_window(band, window, &buf).map_err(|e| {
            // Keep the slot marked so a later flush retries
            self.dirty.fetch_add(1, Ordering::AcqRel);
            Error::BandWrite {
                row_offset,
                rows,
                reason: e.to_string(),
            }
        })?;
        debug!("flushed rows {}..{}", row_offset, row_offset + rows);
        Ok(())
    }
}
