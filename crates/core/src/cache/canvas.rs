//! Tiled random-access view of a raster band

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cache::{CellRef, Slot, SlotId};
use crate::error::{Error, Result};
use crate::io::{BandCell, RasterBand};

/// Default memory budget of one resident band
pub const DEFAULT_BAND_BUDGET: usize = 10 * 1024 * 1024;

/// When `Canvas::at` takes the pool lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Lock on every access. Suits scattered access patterns.
    Eager,
    /// Lock only when the pinned band does not hold the requested row.
    /// Suits row-major scans.
    #[default]
    Rare,
}

/// Access lane of a worker.
///
/// Each worker pins one slot per lane. Neighbour probes go through the
/// `Probe` lane so they never evict the band the worker is scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Worker(usize),
    Probe(usize),
}

impl Access {
    /// Worker id behind the lane
    pub fn worker(self) -> usize {
        match self {
            Access::Worker(w) | Access::Probe(w) => w,
        }
    }
}

/// Canvas construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasOptions {
    /// Number of workers that will call `at`; worker ids are `0..workers`
    pub workers: usize,
    pub lock_mode: LockMode,
    /// Persist modified bands on eviction, `flush` and drop
    pub write_back: bool,
    /// Target memory footprint of one band
    pub band_budget_bytes: usize,
}

impl Default for CanvasOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            lock_mode: LockMode::Rare,
            write_back: false,
            band_budget_bytes: DEFAULT_BAND_BUDGET,
        }
    }
}

/// Number of rows per band for a given band budget
pub fn band_step(width: usize, height: usize, cell_bytes: usize, budget_bytes: usize) -> usize {
    let row_bytes = (width * cell_bytes).max(1);
    (budget_bytes / row_bytes).clamp(1, height.max(1))
}

#[derive(Debug)]
struct PoolState {
    allocated: usize,
    pins: Vec<usize>,
}

/// Random-access read/write view of a raster band that keeps only a few
/// horizontal bands resident.
///
/// Rows are grouped into bands of `step` rows. Each worker pins the slot
/// holding the band it last touched, which makes row-major scans lock free.
/// On a miss the worker takes the pool lock, finds or frees a slot, and loads
/// the band. A slot can only be reused for another band when no lane pins it.
///
/// The arena holds `2 * workers + 1` slots, one more than the number of lanes,
/// so a miss always finds a slot.
///
/// # Example
///
/// ```
/// use flowtile_core::cache::{Access, Canvas, CanvasOptions};
/// use flowtile_core::io::MemoryBand;
/// use flowtile_core::raster::CellType;
///
/// let band = MemoryBand::new(64, 64, CellType::UInt32);
/// let options = CanvasOptions { write_back: true, ..Default::default() };
/// let canvas: Canvas<u32> = Canvas::new(&band, options).unwrap();
///
/// canvas.at(3, 40, Access::Worker(0)).unwrap().set(7).unwrap();
/// assert_eq!(canvas.at(3, 40, Access::Worker(0)).unwrap().get(), Some(7));
/// assert!(!canvas.at(-1, 0, Access::Worker(0)).unwrap().is_valid());
///
/// canvas.flush().unwrap();
/// assert_eq!(band.get(3, 40), Some(7.0));
/// ```
pub struct Canvas<'a, T: BandCell> {
    band: &'a dyn RasterBand,
    width: usize,
    height: usize,
    step: usize,
    options: CanvasOptions,
    slots: Box<[Slot<T>]>,
    /// Pinned slot per lane, stored as slot id + 1 (0 = none)
    lanes: Box<[AtomicUsize]>,
    pool: Mutex<PoolState>,
    discarded: AtomicBool,
}

impl<'a, T: BandCell> Canvas<'a, T> {
    pub fn new(band: &'a dyn RasterBand, options: CanvasOptions) -> Result<Self> {
        let (width, height) = (band.width(), band.height());
        if width == 0 || height == 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        if options.workers == 0 {
            return Err(Error::InvalidParameter {
                name: "workers",
                value: "0".to_string(),
                reason: "a canvas needs at least one worker".to_string(),
            });
        }

        let step = band_step(width, height, T::CELL_TYPE.size_bytes(), options.band_budget_bytes);
        let capacity = 2 * options.workers + 1;
        debug!(
            "canvas {}x{} ({}): {} rows per band, {} slots",
            width,
            height,
            T::CELL_TYPE,
            step,
            capacity
        );

        Ok(Self {
            band,
            width,
            height,
            step,
            options,
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            lanes: (0..2 * options.workers).map(|_| AtomicUsize::new(0)).collect(),
            pool: Mutex::new(PoolState {
                allocated: 0,
                pins: vec![0; capacity],
            }),
            discarded: AtomicBool::new(false),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Rows per band
    pub fn step(&self) -> usize {
        self.step
    }

    /// Capacity of the slot arena
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn options(&self) -> &CanvasOptions {
        &self.options
    }

    pub fn band(&self) -> &'a dyn RasterBand {
        self.band
    }

    /// Handle to cell (x, y) for the given lane.
    ///
    /// Positions outside the raster yield an invalid handle rather than an
    /// error. Loading or persisting a band may fail with `BandRead` or
    /// `BandWrite`.
    pub fn at(&self, x: isize, y: isize, access: Access) -> Result<CellRef<'_, T>> {
        let lane = self.lane(access)?;
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return Ok(CellRef::invalid(x, y, (self.width, self.height)));
        }
        let tile = y as usize / self.step;

        let id = match self.options.lock_mode {
            LockMode::Eager => {
                let mut pool = self.lock_pool();
                match self.pinned_holding(lane, tile) {
                    Some(id) => id,
                    None => self.acquire(&mut pool, lane, tile)?,
                }
            }
            LockMode::Rare => match self.pinned_holding(lane, tile) {
                Some(id) => id,
                None => {
                    let mut pool = self.lock_pool();
                    self.acquire(&mut pool, lane, tile)?
                }
            },
        };

        let slot = &self.slots[id];
        let local_y = y - slot.row_offset() as isize;
        let cell = slot
            .grid()
            .and_then(|grid| grid.cell(x, local_y))
            .ok_or_else(|| Error::Other(format!("slot {} lost band {}", id, tile)))?;
        Ok(CellRef::bind(x, y, cell, slot, (self.width, self.height)))
    }

    /// Value at (x, y), `None` outside the raster
    pub fn get(&self, x: isize, y: isize, access: Access) -> Result<Option<T>> {
        Ok(self.at(x, y, access)?.get())
    }

    /// Whether the slot may be repurposed: no lane pins it
    pub fn is_reusable(&self, slot: SlotId) -> bool {
        let pool = self.lock_pool();
        pool.pins.get(slot.0).is_some_and(|&pins| pins == 0)
    }

    /// Slot pinned by a lane
    pub fn pinned_slot(&self, access: Access) -> Option<SlotId> {
        let lane = self.lane(access).ok()?;
        match self.lanes[lane].load(Ordering::Acquire) {
            0 => None,
            id => Some(SlotId(id - 1)),
        }
    }

    /// Band held by a slot
    pub fn slot_band(&self, slot: SlotId) -> Option<usize> {
        self.slots.get(slot.0).and_then(Slot::tile_index)
    }

    /// Indices of the bands currently resident, sorted
    pub fn resident_bands(&self) -> Vec<usize> {
        let pool = self.lock_pool();
        let mut bands: Vec<usize> = self.slots[..pool.allocated]
            .iter()
            .filter_map(Slot::tile_index)
            .collect();
        bands.sort_unstable();
        bands
    }

    /// Persist every dirty resident band.
    ///
    /// Does nothing on canvases without write-back.
    pub fn flush(&self) -> Result<()> {
        if !self.options.write_back {
            return Ok(());
        }
        let pool = self.lock_pool();
        for slot in &self.slots[..pool.allocated] {
            if slot.is_dirty() {
                slot.flush(self.band)?;
            }
        }
        self.band.flush()
    }

    /// Skip the flush on drop. Used when a run failed and its output is invalid.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    fn lane(&self, access: Access) -> Result<usize> {
        let worker = access.worker();
        if worker >= self.options.workers {
            return Err(Error::InvalidWorker {
                worker,
                workers: self.options.workers,
            });
        }
        Ok(match access {
            Access::Worker(w) => 2 * w,
            Access::Probe(w) => 2 * w + 1,
        })
    }

    fn lock_pool(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot pinned by `lane` if it holds `tile`.
    ///
    /// Only the lane's own worker changes its pin, and a pinned slot is never
    /// repurposed, so this check is sound without the pool lock.
    #[inline]
    fn pinned_holding(&self, lane: usize, tile: usize) -> Option<usize> {
        match self.lanes[lane].load(Ordering::Acquire) {
            0 => None,
            pinned => {
                let id = pinned - 1;
                self.slots[id].holds(tile).then_some(id)
            }
        }
    }

    /// Miss path, called with the pool lock held
    fn acquire(&self, pool: &mut PoolState, lane: usize, tile: usize) -> Result<usize> {
        let old = self.lanes[lane].swap(0, Ordering::AcqRel);
        if old != 0 {
            pool.pins[old - 1] -= 1;
        }

        let allocated = pool.allocated;
        let id = match self.slots[..allocated].iter().position(|slot| slot.holds(tile)) {
            Some(id) => id,
            None => {
                let id = match (0..allocated).find(|&id| pool.pins[id] == 0) {
                    Some(id) => {
                        let slot = &self.slots[id];
                        if self.options.write_back && slot.is_dirty() {
                            slot.flush(self.band)?;
                        }
                        id
                    }
                    None if allocated < self.slots.len() => {
                        pool.allocated += 1;
                        allocated
                    }
                    None => {
                        return Err(Error::Other(format!(
                            "all {} slots are pinned",
                            self.slots.len()
                        )))
                    }
                };
                let row_offset = tile * self.step;
                let rows = self.step.min(self.height - row_offset);
                self.slots[id].load(self.band, tile, row_offset, rows, self.step)?;
                id
            }
        };

        pool.pins[id] += 1;
        self.lanes[lane].store(id + 1, Ordering::Release);
        Ok(id)
    }
}

impl<T: BandCell> Drop for Canvas<'_, T> {
    fn drop(&mut self) {
        if self.discarded.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.flush() {
            error!("failed to persist canvas on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BandMeta, MemoryBand, Window};
    use crate::raster::CellType;

    /// Band of u32 cells where every band of the canvas spans two rows
    fn two_row_canvas(band: &MemoryBand, workers: usize, write_back: bool) -> Canvas<'_, u32> {
        let options = CanvasOptions {
            workers,
            lock_mode: LockMode::Rare,
            write_back,
            band_budget_bytes: band.width() * 4 * 2,
        };
        Canvas::new(band, options).unwrap()
    }

    fn ramp(width: usize, height: usize) -> MemoryBand {
        let values = (0..width * height).map(|v| v as f64).collect();
        MemoryBand::from_vec(width, height, CellType::UInt32, values).unwrap()
    }

    #[test]
    fn test_band_step() {
        assert_eq!(band_step(100, 50, 4, 10 * 1024 * 1024), 50);
        assert_eq!(band_step(100, 50, 4, 800), 2);
        assert_eq!(band_step(100, 50, 8, 10), 1);
    }

    #[test]
    fn test_reads_from_band() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 1, false);
        assert_eq!(canvas.step(), 2);
        assert_eq!(canvas.slot_count(), 3);
        assert_eq!(canvas.get(1, 0, Access::Worker(0)).unwrap(), Some(1));
        assert_eq!(canvas.get(3, 5, Access::Worker(0)).unwrap(), Some(23));
        assert_eq!(canvas.get(4, 0, Access::Worker(0)).unwrap(), None);
        assert_eq!(canvas.get(0, -1, Access::Probe(0)).unwrap(), None);
    }

    #[test]
    fn test_read_after_write_across_workers() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 2, true);

        canvas.at(2, 3, Access::Worker(0)).unwrap().set(500).unwrap();
        assert_eq!(canvas.get(2, 3, Access::Worker(1)).unwrap(), Some(500));
        canvas.at(2, 3, Access::Worker(1)).unwrap().set(600).unwrap();
        assert_eq!(canvas.get(2, 3, Access::Worker(0)).unwrap(), Some(600));
    }

    #[test]
    fn test_invalid_cell_rejects_writes() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 1, true);
        let cell = canvas.at(4, 2, Access::Worker(0)).unwrap();
        assert!(!cell.is_valid());
        assert!(matches!(
            cell.set(1),
            Err(Error::IndexOutOfBounds { x: 4, y: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_worker() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 2, false);
        assert!(matches!(
            canvas.at(0, 0, Access::Probe(2)),
            Err(Error::InvalidWorker { worker: 2, workers: 2 })
        ));
    }

    #[test]
    fn test_dirty_band_flushed_before_reuse() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 1, true);

        canvas.at(0, 0, Access::Worker(0)).unwrap().set(77).unwrap();
        assert_eq!(band.get(0, 0), Some(0.0));

        // Moving on releases the only pin, so the same slot is reused
        assert_eq!(canvas.get(0, 4, Access::Worker(0)).unwrap(), Some(16));
        assert_eq!(band.get(0, 0), Some(77.0));
        assert_eq!(canvas.resident_bands(), vec![2]);
        assert_eq!(band.write_count(), 1);
    }

    #[test]
    fn test_restored_cell_is_clean() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 1, true);

        let cell = canvas.at(1, 1, Access::Worker(0)).unwrap();
        cell.set(40).unwrap();
        cell.set(41).unwrap();
        cell.set(5).unwrap();

        let _ = canvas.get(0, 4, Access::Worker(0)).unwrap();
        assert_eq!(band.write_count(), 0);
    }

    #[test]
    fn test_read_only_canvas_never_writes() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 1, false);
        canvas.at(0, 0, Access::Worker(0)).unwrap().set(9).unwrap();
        let _ = canvas.get(0, 5, Access::Worker(0)).unwrap();
        drop(canvas);
        assert_eq!(band.write_count(), 0);
        assert_eq!(band.get(0, 0), Some(0.0));
    }

    #[test]
    fn test_pinned_slot_is_not_reusable() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 2, false);

        let _ = canvas.get(0, 0, Access::Worker(0)).unwrap();
        let _ = canvas.get(0, 2, Access::Worker(1)).unwrap();
        assert_eq!(canvas.pinned_slot(Access::Worker(0)), Some(SlotId(0)));
        assert_eq!(canvas.pinned_slot(Access::Worker(1)), Some(SlotId(1)));
        assert!(!canvas.is_reusable(SlotId(0)));
        assert!(!canvas.is_reusable(SlotId(1)));

        // Worker 1 joins worker 0 on band 0 and releases its own slot
        let _ = canvas.get(1, 1, Access::Worker(1)).unwrap();
        assert_eq!(canvas.pinned_slot(Access::Worker(1)), Some(SlotId(0)));
        assert!(canvas.is_reusable(SlotId(1)));
        assert!(!canvas.is_reusable(SlotId(0)));
        assert_eq!(canvas.resident_bands(), vec![0, 1]);
    }

    #[test]
    fn test_probe_keeps_worker_band() {
        let band = ramp(4, 6);
        let canvas = two_row_canvas(&band, 1, false);

        let _ = canvas.get(0, 1, Access::Worker(0)).unwrap();
        let _ = canvas.get(0, 2, Access::Probe(0)).unwrap();
        let _ = canvas.get(0, 5, Access::Probe(0)).unwrap();

        assert_eq!(canvas.pinned_slot(Access::Worker(0)), Some(SlotId(0)));
        assert_eq!(canvas.slot_band(SlotId(0)), Some(0));
        let reads = band.read_count();
        assert_eq!(canvas.get(3, 0, Access::Worker(0)).unwrap(), Some(3));
        assert_eq!(band.read_count(), reads);
    }

    #[test]
    fn test_eager_mode_matches_rare_mode() {
        let band = ramp(5, 9);
        let options = CanvasOptions {
            workers: 1,
            lock_mode: LockMode::Eager,
            write_back: false,
            band_budget_bytes: 5 * 4 * 3,
        };
        let canvas: Canvas<u32> = Canvas::new(&band, options).unwrap();
        for y in 0..9 {
            for x in 0..5 {
                let expected = (y * 5 + x) as u32;
                assert_eq!(canvas.get(x, y, Access::Worker(0)).unwrap(), Some(expected));
            }
        }
        assert_eq!(band.read_count(), 3);
    }

    #[test]
    fn test_drop_flushes_unless_discarded() {
        let band = ramp(4, 6);
        {
            let canvas = two_row_canvas(&band, 1, true);
            canvas.at(3, 5, Access::Worker(0)).unwrap().set(1000).unwrap();
        }
        assert_eq!(band.get(3, 5), Some(1000.0));

        {
            let canvas = two_row_canvas(&band, 1, true);
            canvas.at(3, 5, Access::Worker(0)).unwrap().set(2000).unwrap();
            canvas.discard();
        }
        assert_eq!(band.get(3, 5), Some(1000.0));
    }

    /// Band whose reads and writes always fail
    struct BrokenBand;

    impl BrokenBand {
        fn read_cells<C>(&self, _window: Window, _buf: &mut [C]) -> Result<()> {
            Err(Error::Other("disk gone".to_string()))
        }

        fn write_cells<C>(&self, _window: Window, _buf: &[C]) -> Result<()> {
            Err(Error::Other("disk gone".to_string()))
        }
    }

    impl RasterBand for BrokenBand {
        fn width(&self) -> usize {
            4
        }

        fn height(&self) -> usize {
            6
        }

        fn cell_type(&self) -> CellType {
            CellType::UInt32
        }

        fn meta(&self) -> BandMeta {
            BandMeta::default()
        }

        fn set_meta(&self, _meta: BandMeta) -> Result<()> {
            Ok(())
        }

        forward_typed_io!();
    }

    #[test]
    fn test_failed_load_surfaces_band_read() {
        let band = BrokenBand;
        let canvas: Canvas<u32> = Canvas::new(&band, CanvasOptions::default()).unwrap();
        let err = canvas.at(0, 0, Access::Worker(0)).unwrap_err();
        assert!(matches!(err, Error::BandRead { row_offset: 0, rows: 6, .. }));
    }

    #[test]
    fn test_rare_locking_stress() {
        const WORKERS: usize = 6;
        const WIDTH: usize = 16;
        const HEIGHT: usize = 60;
        let band = MemoryBand::new(WIDTH, HEIGHT, CellType::UInt32);
        let options = CanvasOptions {
            workers: WORKERS,
            lock_mode: LockMode::Rare,
            write_back: true,
            band_budget_bytes: WIDTH * 4 * 2,
        };
        let canvas: Canvas<u32> = Canvas::new(&band, options).unwrap();
        let value = |x: usize, y: usize| (y * WIDTH + x) as u32 + 1;

        std::thread::scope(|s| {
            for w in 0..WORKERS {
                let canvas = &canvas;
                s.spawn(move || {
                    for round in 0..3 {
                        for y in (w..HEIGHT).step_by(WORKERS) {
                            for x in 0..WIDTH {
                                let (xi, yi) = (x as isize, y as isize);
                                if round == 0 {
                                    canvas.at(xi, yi, Access::Worker(w)).unwrap().set(value(x, y)).unwrap();
                                }
                                assert_eq!(
                                    canvas.get(xi, yi, Access::Worker(w)).unwrap(),
                                    Some(value(x, y))
                                );
                                // Rows owned by other workers are either untouched or final
                                let probed = canvas.get(xi, yi + 1, Access::Probe(w)).unwrap();
                                if let Some(v) = probed {
                                    assert!(v == 0 || v == value(x, y + 1));
                                }
                            }
                        }
                    }
                });
            }
        });

        canvas.flush().unwrap();
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                assert_eq!(band.get(x, y), Some(value(x, y) as f64));
            }
        }
    }
}
