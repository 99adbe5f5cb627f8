//! Per-cell handles into the tile cache

use crate::cache::Slot;
use crate::error::{Error, Result};
use crate::io::BandCell;

/// Handle to one cell of a [`Canvas`](crate::cache::Canvas).
///
/// The handle remembers the value observed when it was bound. Writes keep
/// the owning slot's dirty count in step with it: diverging from that value
/// marks the slot dirty, restoring it undoes the mark.
///
/// A handle stays bound to its slot, not to its raster position. It must not
/// be used after the next `at` call on the same access lane, which may hand
/// the slot to another band.
///
/// Handles to the same cell must not be held by different writers at once.
/// Each handle compares against its own bind-time value, so interleaved
/// writes through overlapping handles can leave the dirty count at zero on a
/// modified band. Give every cell a single writer, or rebind before each write.
#[derive(Debug)]
pub struct CellRef<'a, T: BandCell> {
    x: isize,
    y: isize,
    bound: Option<Bound<'a, T>>,
    extent: (usize, usize),
}

#[derive(Debug)]
struct Bound<'a, T: BandCell> {
    cell: &'a T::Atomic,
    slot: &'a Slot<T>,
    previous: T,
}

impl<'a, T: BandCell> CellRef<'a, T> {
    pub(crate) fn bind(
        x: isize,
        y: isize,
        cell: &'a T::Atomic,
        slot: &'a Slot<T>,
        extent: (usize, usize),
    ) -> Self {
        Self {
            x,
            y,
            extent,
            bound: Some(Bound {
                cell,
                slot,
                previous: T::load(cell),
            }),
        }
    }

    /// Handle for a position outside the raster
    pub(crate) fn invalid(x: isize, y: isize, extent: (usize, usize)) -> Self {
        Self {
            x,
            y,
            bound: None,
            extent,
        }
    }

    /// Whether the handle points at a raster cell
    pub fn is_valid(&self) -> bool {
        self.bound.is_some()
    }

    pub fn x(&self) -> isize {
        self.x
    }

    pub fn y(&self) -> isize {
        self.y
    }

    /// Current value, `None` outside the raster
    #[inline]
    pub fn get(&self) -> Option<T> {
        self.bound.as_ref().map(|b| T::load(b.cell))
    }

    /// Value observed when the handle was bound
    pub fn previous(&self) -> Option<T> {
        self.bound.as_ref().map(|b| b.previous)
    }

    /// Store a value
    pub fn set(&self, value: T) -> Result<()> {
        let Some(b) = &self.bound else {
            return Err(Error::IndexOutOfBounds {
                x: self.x,
                y: self.y,
                width: self.extent.0,
                height: self.extent.1,
            });
        };
        let current = T::load(b.cell);
        if current == value {
            return Ok(());
        }
        if value == b.previous {
            b.slot.add_dirty(-1);
        } else if current == b.previous {
            b.slot.add_dirty(1);
        }
        T::store(b.cell, value);
        Ok(())
    }
}
