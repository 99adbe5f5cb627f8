//! D8 flow direction phase
//!
//! Every cell drains to its steepest downslope neighbour. Direction codes
//! index the 3x3 window (see [`d8`]):
//! ```text
//!   1  2  3
//!   4  5  6
//!   7  8  9
//! ```
//! The phase runs in two passes over row stripes, one stripe per worker:
//!
//! 1. assign a direction to every cell;
//! 2. after all workers meet at the barrier, count each cell's inbound
//!    neighbours. Cells without any are written to the sources file, cells
//!    with two or more get their code negated to mark a confluence.

use flowtile_core::cache::{Access, Canvas};
use flowtile_core::raster::{d8, RasterElement};
use flowtile_core::{Error, RasterBand, Result};
use flowtile_parallel::{stripes, Stripe, WorkerPool};
use tracing::{debug, info};

use super::control::RunControl;
use super::engine::PhaseSettings;
use super::progress::{Phase, Progress};
use super::sources::{SourceFile, SourceWriter};

/// Elevation drop assumed towards neighbours off the raster or at no-data.
///
/// Makes edges and no-data holes valid outlets for every adjacent cell.
pub const BOUNDARY_DROP: f64 = 0.001;

/// Result of the direction phase
#[derive(Debug)]
pub struct DirectionOutput {
    /// Cells without inbound neighbours, in stripe order
    pub sources: SourceFile,
    /// Cells with two or more inbound neighbours
    pub confluences: u64,
    /// Cells with elevation data
    pub valid_cells: u64,
}

/// Neighbours of a cell that drain into it
#[derive(Debug, Clone, Copy)]
pub struct Inbound {
    cells: [(isize, isize); 8],
    len: usize,
}

impl Inbound {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (isize, isize)> + '_ {
        self.cells[..self.len].iter().copied()
    }
}

/// Collect the neighbours of (x, y) whose direction points at it.
///
/// The confluence sign is ignored, so the result does not change while other
/// workers mark confluences.
pub fn inbound(directions: &Canvas<'_, i8>, x: isize, y: isize, access: Access) -> Result<Inbound> {
    let mut found = Inbound {
        cells: [(0, 0); 8],
        len: 0,
    };
    for (code, nx, ny) in d8::neighbors(x, y) {
        if let Some(neighbour) = directions.get(nx, ny, access)? {
            if neighbour != d8::NO_FLOW && d8::opposite(neighbour) == code {
                found.cells[found.len] = (nx, ny);
                found.len += 1;
            }
        }
    }
    Ok(found)
}

/// Steepest downslope neighbour of (x, y) with elevation `center`.
///
/// Returns `None` when no neighbour lies lower: the cell is a depression.
/// Ties keep the first neighbour in scan order.
pub fn steepest_descent(
    elevation: &Canvas<'_, f32>,
    x: isize,
    y: isize,
    center: f32,
    nodata: Option<f32>,
    cell_size: f64,
    access: Access,
) -> Result<Option<i8>> {
    let mut best = d8::NO_FLOW;
    let mut max_slope = 0.0_f64;

    for (code, nx, ny) in d8::neighbors(x, y) {
        let drop = match elevation.get(nx, ny, access)? {
            Some(z) if !z.is_nodata(nodata) => center as f64 - z as f64,
            _ => BOUNDARY_DROP,
        };
        let slope = drop / (d8::distance(code) * cell_size);
        if slope > max_slope {
            max_slope = slope;
            best = code;
        }
    }

    Ok((best != d8::NO_FLOW).then_some(best))
}

struct StripeOutput {
    sources: SourceFile,
    confluences: u64,
    valid_cells: u64,
}

struct DirectionPass<'a> {
    elevation: Canvas<'a, f32>,
    directions: Canvas<'a, i8>,
    nodata: Option<f32>,
    cell_size: f64,
    control: &'a RunControl,
    progress: &'a Progress,
}

impl DirectionPass<'_> {
    fn assign(&self, stripe: Stripe, worker: usize) -> Result<u64> {
        let access = Access::Worker(worker);
        let probe = Access::Probe(worker);
        let width = self.elevation.width() as isize;
        let mut valid = 0;

        for y in stripe.row_range() {
            let y = y as isize;
            for x in 0..width {
                self.control.check()?;
                let code = match self.elevation.get(x, y, access)? {
                    Some(z) if !z.is_nodata(self.nodata) => {
                        valid += 1;
                        steepest_descent(&self.elevation, x, y, z, self.nodata, self.cell_size, probe)?
                            .ok_or(Error::Depression {
                                x: x as usize,
                                y: y as usize,
                            })?
                    }
                    _ => d8::NO_FLOW,
                };
                self.directions.at(x, y, access)?.set(code)?;
            }
            self.progress.advance(1);
        }
        Ok(valid)
    }

    fn mark(&self, stripe: Stripe, worker: usize, sources: &mut SourceWriter) -> Result<u64> {
        let access = Access::Worker(worker);
        let probe = Access::Probe(worker);
        let width = self.directions.width() as isize;
        let mut confluences = 0;

        for y in stripe.row_range() {
            let y = y as isize;
            for x in 0..width {
                self.control.check()?;
                let code = self.directions.get(x, y, access)?.unwrap_or(d8::NO_FLOW);
                if code == d8::NO_FLOW {
                    continue;
                }
                match inbound(&self.directions, x, y, probe)?.len() {
                    0 => sources.push(x as usize, y as usize)?,
                    1 => {}
                    _ => {
                        self.directions.at(x, y, access)?.set(-code.abs())?;
                        confluences += 1;
                    }
                }
            }
            self.progress.advance(1);
        }
        Ok(confluences)
    }
}

/// Compute D8 directions of `elevation` into `directions` and collect sources.
///
/// Fails with [`Error::Depression`] if a cell with data has no lower
/// neighbour; the elevation raster must be depression-filled beforehand.
/// On failure the directions band is left partially written.
pub fn flow_direction(
    elevation: &dyn RasterBand,
    directions: &dyn RasterBand,
    settings: &PhaseSettings,
    pool: &WorkerPool,
    control: &RunControl,
    progress: &Progress,
) -> Result<DirectionOutput> {
    let threads = pool.threads();
    let height = elevation.height();
    let pass = DirectionPass {
        elevation: Canvas::new(elevation, settings.canvas(threads, false))?,
        directions: Canvas::new(directions, settings.canvas(threads, true))?,
        nodata: elevation.nodata().map(|v| v as f32),
        cell_size: settings.cell_size,
        control,
        progress,
    };
    let parts = stripes(height, threads);
    info!(
        "flow direction: {} stripes, {} rows per band",
        parts.len(),
        pass.elevation.step()
    );
    progress.start(Phase::Direction, 2 * height as u64);

    let result = pool.broadcast("direction", |worker| {
        control.guard(|| {
            let stripe = parts[worker];
            debug!(
                "worker {} owns rows {}..{}",
                worker,
                stripe.row_offset,
                stripe.row_end()
            );
            let valid_cells = pass.assign(stripe, worker)?;
            control.rendezvous(threads)?;

            let mut sources = SourceWriter::create(settings.temp_dir.as_deref())?;
            let confluences = pass.mark(stripe, worker, &mut sources)?;
            Ok(StripeOutput {
                sources: sources.finish()?,
                confluences,
                valid_cells,
            })
        })
    });

    let outputs = match result {
        Ok(outputs) => outputs,
        Err(e) => {
            pass.directions.discard();
            return Err(e);
        }
    };
    pass.directions.flush()?;

    let confluences = outputs.iter().map(|o| o.confluences).sum();
    let valid_cells = outputs.iter().map(|o| o.valid_cells).sum();
    let parts = outputs.into_iter().map(|o| o.sources).collect();
    let sources = SourceFile::concat(parts, settings.temp_dir.as_deref())?;
    info!(
        "flow direction: {} sources, {} confluences",
        sources.len(),
        confluences
    );

    Ok(DirectionOutput {
        sources,
        confluences,
        valid_cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtile_core::cache::CanvasOptions;
    use flowtile_core::io::MemoryBand;
    use flowtile_core::raster::CellType;

    fn band(width: usize, height: usize, f: impl Fn(usize, usize) -> f64) -> MemoryBand {
        let values = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        MemoryBand::from_vec(width, height, CellType::Float32, values).unwrap()
    }

    fn run(elevation: &MemoryBand, threads: usize) -> Result<(MemoryBand, DirectionOutput)> {
        let directions = MemoryBand::like(elevation, CellType::Int8);
        let output = flow_direction(
            elevation,
            &directions,
            &PhaseSettings::default(),
            &WorkerPool::exact(threads),
            &RunControl::new(),
            &Progress::new(),
        )?;
        Ok((directions, output))
    }

    #[test]
    fn test_steepest_descent_slope_east() {
        // Elevation decreases to the east
        let dem = band(5, 5, |x, _| (5 - x) as f64 * 10.0);
        let canvas: Canvas<f32> = Canvas::new(&dem, CanvasOptions::default()).unwrap();
        let code = steepest_descent(&canvas, 2, 2, 30.0, None, 1.0, Access::Probe(0)).unwrap();
        assert_eq!(code, Some(6));
    }

    #[test]
    fn test_steepest_descent_prefers_diagonal_drop() {
        // (1,1) drops 3 to the SE (3/sqrt2 = 2.12) and 2 to the S
        let dem = band(3, 3, |x, y| match (x, y) {
            (2, 2) => 2.0,
            (1, 2) => 3.0,
            _ => 5.0,
        });
        let canvas: Canvas<f32> = Canvas::new(&dem, CanvasOptions::default()).unwrap();
        let code = steepest_descent(&canvas, 1, 1, 5.0, None, 1.0, Access::Probe(0)).unwrap();
        assert_eq!(code, Some(9));
    }

    #[test]
    fn test_edge_cell_drains_off_raster() {
        // Flat raster: only the boundary margin offers a drop, first in scan order wins
        let dem = band(4, 4, |_, _| 1.0);
        let canvas: Canvas<f32> = Canvas::new(&dem, CanvasOptions::default()).unwrap();
        let top = steepest_descent(&canvas, 2, 0, 1.0, None, 1.0, Access::Probe(0)).unwrap();
        assert_eq!(top, Some(2));
        let left = steepest_descent(&canvas, 0, 2, 1.0, None, 1.0, Access::Probe(0)).unwrap();
        assert_eq!(left, Some(4));
        let inner = steepest_descent(&canvas, 1, 1, 1.0, None, 1.0, Access::Probe(0)).unwrap();
        assert_eq!(inner, None);
    }

    #[test]
    fn test_tilted_plane_directions() {
        let dem = band(3, 3, |x, y| (x + y) as f64);
        let (directions, output) = run(&dem, 1).unwrap();

        #[rustfmt::skip]
        let expected = vec![
            -2.0, -4.0,  4.0,
            -2.0,  1.0,  1.0,
             2.0,  1.0,  1.0,
        ];
        assert_eq!(directions.to_vec(), expected);
        assert_eq!(output.confluences, 3);
        assert_eq!(output.valid_cells, 9);
        assert_eq!(
            output.sources.read_all().unwrap(),
            vec![(2, 0), (2, 1), (0, 2), (1, 2), (2, 2)]
        );
    }

    #[test]
    fn test_nodata_cells_get_no_flow() {
        // Elevation falls towards a no-data column on the east edge
        let dem = band(4, 3, |x, _| if x == 3 { -9999.0 } else { 10.0 - x as f64 })
            .with_nodata(Some(-9999.0));
        let (directions, output) = run(&dem, 2).unwrap();

        for y in 0..3 {
            assert_eq!(directions.get(3, y), Some(0.0));
        }
        // Next to the hole the margin ties with the top edge, which is scanned first
        assert_eq!(directions.get(2, 0).map(f64::abs), Some(2.0));
        assert_eq!(directions.get(2, 1).map(f64::abs), Some(6.0));
        assert_eq!(directions.get(2, 2).map(f64::abs), Some(6.0));
        assert_eq!(output.valid_cells, 9);
        let sources = output.sources.read_all().unwrap();
        assert!(sources.iter().all(|&(x, _)| x != 3));
    }

    #[test]
    fn test_depression_aborts() {
        let dem = band(5, 5, |x, y| if (x, y) == (2, 2) { 1.0 } else { 10.0 });
        let err = run(&dem, 1).unwrap_err();
        assert!(matches!(err, Error::Depression { x: 2, y: 2 }));
    }

    #[test]
    fn test_stripes_agree_with_single_worker() {
        let dem = band(23, 31, |x, y| {
            let dx = x as f64 - 11.0;
            let dy = y as f64 + 5.0;
            (dx * dx + dy * dy).sqrt() + ((x * 7 + y * 13) % 5) as f64 * 0.01
        });
        let (single, single_out) = run(&dem, 1).unwrap();
        let threads = flowtile_parallel::available_threads().min(4);
        let (multi, multi_out) = run(&dem, threads).unwrap();

        assert_eq!(single.to_vec(), multi.to_vec());
        assert_eq!(single_out.confluences, multi_out.confluences);
        assert_eq!(
            single_out.sources.read_all().unwrap(),
            multi_out.sources.read_all().unwrap()
        );
    }
}
