//! Flow accumulation phase
//!
//! Walks the flow path of every source cell downstream, writing the number of
//! upstream cells (the cell itself included) into each cell it passes.
//!
//! A confluence can only be finalized once all of its inbound neighbours are
//! known. The walker that reaches it last, seeing every inbound neighbour
//! filled, sums them and carries on; earlier walkers stop there. The check
//! and the write happen under one lock, so each confluence is written once.

use flowtile_core::cache::{band_step, Access, Canvas, LockMode};
use flowtile_core::io::{BandCell, Window};
use flowtile_core::raster::d8;
use flowtile_core::{RasterBand, Result};
use flowtile_parallel::{Spinlock, WorkQueue, WorkerPool};
use tracing::{debug, info};

use super::control::RunControl;
use super::engine::PhaseSettings;
use super::flow_direction::inbound;
use super::progress::{Phase, Progress};
use super::sources::SourceFile;

/// Result of the accumulation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulationOutput {
    /// Confluence cells finalized
    pub merges: u64,
    /// Cells written in total
    pub cells: u64,
}

struct AccumulationPass<'a> {
    directions: Canvas<'a, i8>,
    accumulation: Canvas<'a, u64>,
    /// Serializes confluence merges; counts them
    merge_lock: Spinlock<u64>,
    control: &'a RunControl,
}

impl AccumulationPass<'_> {
    /// Follow the flow path starting at source (x, y); returns cells written
    fn walk(&self, x: usize, y: usize, worker: usize) -> Result<u64> {
        let access = Access::Worker(worker);
        let probe = Access::Probe(worker);
        let (mut x, mut y) = (x as isize, y as isize);
        let mut value: u64 = 1;
        let mut written = 0;

        loop {
            self.control.check()?;
            let code = match self.directions.get(x, y, access)? {
                Some(code) if code != d8::NO_FLOW => code,
                _ => break,
            };
            if self.accumulation.get(x, y, access)? != Some(0) {
                break;
            }

            if d8::is_confluence(code) {
                let mut merges = self.merge_lock.lock();
                // Another walker may have finalized it since the check above
                if self.accumulation.get(x, y, access)? != Some(0) {
                    break;
                }
                let mut total = 1;
                for (nx, ny) in inbound(&self.directions, x, y, probe)?.iter() {
                    match self.accumulation.get(nx, ny, probe)? {
                        Some(v) if v != 0 => total += v,
                        // Not the last walker to arrive
                        _ => return Ok(written),
                    }
                }
                self.accumulation.at(x, y, access)?.set(total)?;
                *merges += 1;
                value = total + 1;
            } else {
                self.accumulation.at(x, y, access)?.set(value)?;
                value += 1;
            }
            written += 1;

            let Some((dx, dy)) = d8::offset(code) else {
                break;
            };
            x += dx;
            y += dy;
        }
        Ok(written)
    }
}

/// Reset a band to zero, band by band
fn clear_band<T: BandCell>(band: &dyn RasterBand, budget_bytes: usize) -> Result<()> {
    let (width, height) = (band.width(), band.height());
    let step = band_step(width, height, T::CELL_TYPE.size_bytes(), budget_bytes);
    let zeros = vec![T::zero(); width * step];
    for row_offset in (0..height).step_by(step) {
        let rows = step.min(height - row_offset);
        T::write_window(band, Window::rows(row_offset, rows, width), &zeros[..rows * width])?;
    }
    Ok(())
}

/// Accumulate drainage area from `directions` and `sources` into `accumulation`.
///
/// `directions` must come from [`flow_direction`](super::flow_direction()),
/// with confluences marked. The accumulation band is cleared first.
pub fn flow_accumulation(
    directions: &dyn RasterBand,
    accumulation: &dyn RasterBand,
    sources: &SourceFile,
    settings: &PhaseSettings,
    pool: &WorkerPool,
    control: &RunControl,
    progress: &Progress,
) -> Result<AccumulationOutput> {
    let threads = pool.threads();
    clear_band::<u64>(accumulation, settings.band_budget_bytes)?;

    // Flow paths wander across bands, so these canvases lock on every access
    let pass = AccumulationPass {
        directions: Canvas::new(directions, settings.canvas_with(threads, false, LockMode::Eager))?,
        accumulation: Canvas::new(accumulation, settings.canvas_with(threads, true, LockMode::Eager))?,
        merge_lock: Spinlock::new(0),
        control,
    };

    let queue: WorkQueue<_> = sources.chunks(settings.chunk_size).into_iter().collect();
    info!(
        "flow accumulation: {} sources in {} chunks",
        sources.len(),
        queue.len()
    );
    progress.start(Phase::Accumulation, sources.len());

    let result = pool.broadcast("accumulation", |worker| {
        control.guard(|| {
            let mut cells = 0;
            while let Some(chunk) = queue.pop() {
                control.check()?;
                debug!("worker {} takes sources {}..", worker, chunk.offset);
                for (x, y) in sources.read_chunk(chunk)? {
                    cells += pass.walk(x, y, worker)?;
                    progress.advance(1);
                }
            }
            Ok(cells)
        })
    });

    let cells: u64 = match result {
        Ok(cells) => cells.into_iter().sum(),
        Err(e) => {
            pass.accumulation.discard();
            return Err(e);
        }
    };
    pass.accumulation.flush()?;

    let merges = *pass.merge_lock.lock();
    info!("flow accumulation: {} cells, {} confluences merged", cells, merges);
    Ok(AccumulationOutput { merges, cells })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtile_core::io::MemoryBand;
    use flowtile_core::raster::CellType;

    use crate::hydrology::sources::SourceWriter;

    fn directions(width: usize, height: usize, codes: &[i8]) -> MemoryBand {
        let values = codes.iter().map(|&c| c as f64).collect();
        MemoryBand::from_vec(width, height, CellType::Int8, values).unwrap()
    }

    fn sources(records: &[(usize, usize)]) -> SourceFile {
        let mut writer = SourceWriter::create(None).unwrap();
        for &(x, y) in records {
            writer.push(x, y).unwrap();
        }
        writer.finish().unwrap()
    }

    fn run(dirs: &MemoryBand, srcs: &SourceFile, threads: usize) -> (MemoryBand, AccumulationOutput) {
        let acc = MemoryBand::like(dirs, CellType::UInt64);
        let settings = PhaseSettings {
            chunk_size: 2,
            ..Default::default()
        };
        let output = flow_accumulation(
            dirs,
            &acc,
            srcs,
            &settings,
            &WorkerPool::exact(threads),
            &RunControl::new(),
            &Progress::new(),
        )
        .unwrap();
        (acc, output)
    }

    #[test]
    fn test_single_channel() {
        // Four cells in a row draining east and off the raster
        let dirs = directions(4, 1, &[6, 6, 6, 6]);
        let (acc, output) = run(&dirs, &sources(&[(0, 0)]), 1);
        assert_eq!(acc.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(output, AccumulationOutput { merges: 0, cells: 4 });
    }

    #[test]
    fn test_confluence_merged_once() {
        // Two branches join at (1,1), which drains south off the raster
        #[rustfmt::skip]
        let dirs = directions(3, 2, &[
            9, 0, 7,
            0, -8, 0,
        ]);
        let (acc, output) = run(&dirs, &sources(&[(0, 0), (2, 0)]), 2);
        assert_eq!(acc.to_vec(), vec![1.0, 0.0, 1.0, 0.0, 3.0, 0.0]);
        assert_eq!(output.merges, 1);
    }

    #[test]
    fn test_tilted_plane_accumulation() {
        #[rustfmt::skip]
        let dirs = directions(3, 3, &[
            -2, -4, 4,
            -2,  1, 1,
             2,  1, 1,
        ]);
        let srcs = sources(&[(2, 0), (2, 1), (0, 2), (1, 2), (2, 2)]);
        for threads in [1, 3] {
            let (acc, output) = run(&dirs, &srcs, threads);
            #[rustfmt::skip]
            let expected = vec![
                9.0, 3.0, 1.0,
                3.0, 2.0, 1.0,
                1.0, 1.0, 1.0,
            ];
            assert_eq!(acc.to_vec(), expected);
            assert_eq!(output.merges, 3);
        }
    }

    #[test]
    fn test_stops_at_nodata() {
        // The path runs into a no-data cell (direction 0) and ends there
        let dirs = directions(3, 1, &[6, 6, 0]);
        let (acc, _) = run(&dirs, &sources(&[(0, 0)]), 1);
        assert_eq!(acc.to_vec(), vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_clears_previous_output() {
        let dirs = directions(2, 1, &[6, 6]);
        let acc = MemoryBand::from_vec(2, 1, CellType::UInt64, vec![5.0, 5.0]).unwrap();
        flow_accumulation(
            &dirs,
            &acc,
            &sources(&[(0, 0)]),
            &PhaseSettings::default(),
            &WorkerPool::exact(1),
            &RunControl::new(),
            &Progress::new(),
        )
        .unwrap();
        assert_eq!(acc.to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_interrupted_run_discards_output() {
        let dirs = directions(2, 1, &[6, 6]);
        let acc = MemoryBand::like(&dirs, CellType::UInt64);
        let control = RunControl::new();
        control.interrupt();
        let err = flow_accumulation(
            &dirs,
            &acc,
            &sources(&[(0, 0)]),
            &PhaseSettings::default(),
            &WorkerPool::exact(1),
            &control,
            &Progress::new(),
        )
        .unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(acc.to_vec(), vec![0.0, 0.0]);
    }
}
