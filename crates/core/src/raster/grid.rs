//! Flat 2D cell buffer

use crate::error::{Error, Result};
use crate::raster::CellValue;

/// A flat, resizable 2D buffer of cells stored in row-major order.
///
/// `Grid<T>` is the elementary storage unit of the tile cache. Cells are
/// kept in `T::Atomic` containers so a grid can be shared between worker
/// threads by reference; reads and writes through `&Grid` never race.
///
/// Coordinates outside the grid yield `None` and writes to them fail: the
/// grid never grows implicitly.
///
/// # Example
///
/// ```
/// use flowtile_core::raster::Grid;
///
/// let grid: Grid<f32> = Grid::new(4, 3);
/// grid.set(1, 2, 42.0).unwrap();
/// assert_eq!(grid.get(1, 2), Some(42.0));
/// assert_eq!(grid.get(4, 0), None);
/// ```
#[derive(Debug)]
pub struct Grid<T: CellValue> {
    width: usize,
    height: usize,
    cells: Vec<T::Atomic>,
}

impl<T: CellValue> Grid<T> {
    /// Create a grid filled with zeros
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, T::zero())
    }

    /// Create a grid filled with a specific value
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        let cells = (0..width * height).map(|_| T::new_atomic(value)).collect();
        Self {
            width,
            height,
            cells,
        }
    }

    /// Create a grid from row-major values
    pub fn from_vec(values: Vec<T>, width: usize, height: usize) -> Result<Self> {
        if values.len() != width * height {
            return Err(Error::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            cells: values.into_iter().map(T::new_atomic).collect(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Linear index of (x, y), or `None` outside the grid
    #[inline]
    pub fn index(&self, x: isize, y: isize) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    /// Shared cell container at (x, y)
    #[inline]
    pub fn cell(&self, x: isize, y: isize) -> Option<&T::Atomic> {
        self.index(x, y).map(|i| &self.cells[i])
    }

    /// Value at (x, y)
    #[inline]
    pub fn get(&self, x: isize, y: isize) -> Option<T> {
        self.cell(x, y).map(T::load)
    }

    /// Set value at (x, y)
    pub fn set(&self, x: isize, y: isize, value: T) -> Result<()> {
        match self.cell(x, y) {
            Some(cell) => {
                T::store(cell, value);
                Ok(())
            }
            None => Err(Error::IndexOutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            }),
        }
    }

    /// Change the grid dimensions.
    ///
    /// Cells are kept by linear index; cells added at the end are zero.
    pub fn resize(&mut self, width: usize, height: usize) {
        let len = width * height;
        if len < self.cells.len() {
            self.cells.truncate(len);
        } else {
            let extra = len - self.cells.len();
            self.cells.extend((0..extra).map(|_| T::new_atomic(T::zero())));
        }
        self.width = width;
        self.height = height;
    }

    /// Overwrite the first `values.len()` cells
    pub fn store_prefix(&self, values: &[T]) {
        for (cell, &value) in self.cells.iter().zip(values) {
            T::store(cell, value);
        }
    }

    /// Copy of the first `len` cells
    pub fn load_prefix(&self, len: usize) -> Vec<T> {
        self.cells.iter().take(len).map(T::load).collect()
    }

    /// Copy of every cell in row-major order
    pub fn to_vec(&self) -> Vec<T> {
        self.load_prefix(self.cells.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_creation() {
        let grid: Grid<f32> = Grid::new(200, 100);
        assert_eq!(grid.width(), 200);
        assert_eq!(grid.height(), 100);
        assert_eq!(grid.len(), 20_000);
        assert_eq!(grid.get(199, 99), Some(0.0));
    }

    #[test]
    fn test_grid_out_of_bounds() {
        let grid: Grid<u8> = Grid::new(3, 3);
        assert_eq!(grid.get(-1, 0), None);
        assert_eq!(grid.get(0, 3), None);
        assert!(grid.set(3, 0, 1).is_err());
        assert_eq!(grid.len(), 9);
    }

    #[test]
    fn test_grid_resize_keeps_prefix() {
        let mut grid = Grid::from_vec(vec![1u32, 2, 3, 4], 2, 2).unwrap();
        grid.resize(2, 3);
        assert_eq!(grid.to_vec(), vec![1, 2, 3, 4, 0, 0]);
        grid.resize(2, 1);
        assert_eq!(grid.to_vec(), vec![1, 2]);
        assert_eq!(grid.get(0, 1), None);
    }

    #[test]
    fn test_grid_shared_writes() {
        let grid: Grid<u64> = Grid::new(64, 4);
        std::thread::scope(|s| {
            for row in 0..4 {
                let grid = &grid;
                s.spawn(move || {
                    for x in 0..64 {
                        grid.set(x, row, (row * 100 + x) as u64).unwrap();
                    }
                });
            }
        });
        assert_eq!(grid.get(10, 3), Some(310));
    }
}
