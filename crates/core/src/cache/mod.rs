//! Tile cache
//!
//! A [`Canvas`] gives random cell access to a raster band while keeping only
//! a bounded number of horizontal bands in memory. Bands live in [`Slot`]s
//! of a fixed arena; [`CellRef`] handles track which slots need writing back.

mod canvas;
mod cell;
mod slot;

pub use canvas::{band_step, Access, Canvas, CanvasOptions, LockMode, DEFAULT_BAND_BUDGET};
pub use cell::CellRef;
pub use slot::{Slot, SlotId};
