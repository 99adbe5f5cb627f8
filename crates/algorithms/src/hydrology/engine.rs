//! Flow routing run orchestration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowtile_core::cache::{CanvasOptions, LockMode, DEFAULT_BAND_BUDGET};
use flowtile_core::io::MemoryBand;
use flowtile_core::raster::CellType;
use flowtile_core::{Algorithm, BandMeta, Error, RasterBand, Result};
use flowtile_parallel::WorkerPool;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::control::RunControl;
use super::flow_accumulation::flow_accumulation;
use super::flow_direction::flow_direction;
use super::progress::Progress;

/// Parameters for a flow routing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    /// Requested worker threads, capped at the hardware; 0 = all cores
    pub threads: usize,
    /// Horizontal cell size; `None` takes it from the elevation geotransform
    pub cell_size: Option<f64>,
    /// Memory budget of one resident band per canvas
    pub band_budget_bytes: usize,
    /// Sources handed to an accumulation worker at a time
    pub chunk_size: usize,
    /// Locking regime of the direction phase canvases
    pub lock_mode: LockMode,
    /// Directory for the sources file; system temp dir if `None`
    pub temp_dir: Option<PathBuf>,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            threads: 0,
            cell_size: None,
            band_budget_bytes: DEFAULT_BAND_BUDGET,
            chunk_size: 100_000,
            lock_mode: LockMode::Rare,
            temp_dir: None,
        }
    }
}

/// Settings shared by the phases of one run, resolved from [`FlowParams`]
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    pub cell_size: f64,
    pub band_budget_bytes: usize,
    pub chunk_size: usize,
    pub lock_mode: LockMode,
    pub temp_dir: Option<PathBuf>,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        let params = FlowParams::default();
        Self {
            cell_size: 1.0,
            band_budget_bytes: params.band_budget_bytes,
            chunk_size: params.chunk_size,
            lock_mode: params.lock_mode,
            temp_dir: None,
        }
    }
}

impl PhaseSettings {
    /// Canvas options with the configured lock mode
    pub fn canvas(&self, workers: usize, write_back: bool) -> CanvasOptions {
        self.canvas_with(workers, write_back, self.lock_mode)
    }

    pub fn canvas_with(&self, workers: usize, write_back: bool, lock_mode: LockMode) -> CanvasOptions {
        CanvasOptions {
            workers,
            lock_mode,
            write_back,
            band_budget_bytes: self.band_budget_bytes,
        }
    }
}

/// Input and output bands of a run
#[derive(Clone)]
pub struct FlowBands {
    pub elevation: Arc<dyn RasterBand>,
    /// Signed D8 codes, negative at confluences
    pub directions: Arc<dyn RasterBand>,
    /// Upstream cell counts
    pub accumulation: Arc<dyn RasterBand>,
}

impl FlowBands {
    /// Pair an elevation band with new in-memory output bands
    pub fn in_memory(elevation: Arc<dyn RasterBand>) -> Self {
        let directions = Arc::new(MemoryBand::like(&*elevation, CellType::Int8));
        let accumulation = Arc::new(MemoryBand::like(&*elevation, CellType::UInt64));
        Self {
            elevation,
            directions,
            accumulation,
        }
    }
}

/// Statistics of a finished run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSummary {
    pub width: usize,
    pub height: usize,
    pub threads: usize,
    /// Cells with elevation data
    pub valid_cells: u64,
    pub sources: u64,
    pub confluences: u64,
    pub direction_time: Duration,
    pub accumulation_time: Duration,
}

/// D8 flow direction and flow accumulation over out-of-core rasters.
///
/// One instance can run several times; each run gets its own worker pool,
/// interrupt flag and sources file. [`FlowRouting::progress`] can be polled
/// from another thread while a run executes.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use flowtile_algorithms::hydrology::{FlowBands, FlowParams, FlowRouting};
/// use flowtile_core::io::MemoryBand;
/// use flowtile_core::raster::CellType;
///
/// // A plane tilted towards the north-west corner
/// let values = (0..9).map(|i| (i % 3 + i / 3) as f64).collect();
/// let dem = MemoryBand::from_vec(3, 3, CellType::Float32, values).unwrap();
/// let bands = FlowBands::in_memory(Arc::new(dem));
///
/// let summary = FlowRouting::new().run(&bands, &FlowParams::default()).unwrap();
/// assert_eq!(summary.sources, 5);
/// assert_eq!(bands.accumulation.nodata(), Some(0.0));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlowRouting {
    progress: Arc<Progress>,
}

impl FlowRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress of the current or last run
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Compute directions and accumulation for `bands`.
    ///
    /// On failure the output bands hold partial data and must be discarded.
    pub fn run(&self, bands: &FlowBands, params: &FlowParams) -> Result<FlowSummary> {
        let result = self.run_phases(bands, params);
        match &result {
            Ok(_) => self.progress.finish(),
            Err(e) => {
                error!("flow routing failed: {}", e);
                self.progress.fail();
            }
        }
        result
    }

    fn run_phases(&self, bands: &FlowBands, params: &FlowParams) -> Result<FlowSummary> {
        let elevation = &*bands.elevation;
        let (width, height) = (elevation.width(), elevation.height());
        check_output(elevation, &*bands.directions)?;
        check_output(elevation, &*bands.accumulation)?;
        if !matches!(
            bands.directions.cell_type(),
            CellType::Int8 | CellType::Int32 | CellType::Float32 | CellType::Float64
        ) {
            return Err(Error::UnsupportedDataType(format!(
                "directions band must be signed, got {}",
                bands.directions.cell_type()
            )));
        }
        let settings = resolve(elevation, params)?;

        let meta = elevation.meta();
        let output_meta = BandMeta {
            nodata: Some(0.0),
            ..meta.clone()
        };
        bands.directions.set_meta(output_meta.clone())?;
        bands.accumulation.set_meta(output_meta)?;

        let pool = WorkerPool::new(params.threads);
        info!(
            "flow routing {}x{} with {} threads, cell size {}, no-data {:?}",
            width,
            height,
            pool.threads(),
            settings.cell_size,
            meta.nodata
        );
        let control = RunControl::new();

        let start = Instant::now();
        let direction = flow_direction(
            elevation,
            &*bands.directions,
            &settings,
            &pool,
            &control,
            &self.progress,
        )?;
        control.check()?;
        let direction_time = start.elapsed();

        let start = Instant::now();
        flow_accumulation(
            &*bands.directions,
            &*bands.accumulation,
            &direction.sources,
            &settings,
            &pool,
            &control,
            &self.progress,
        )?;
        control.check()?;
        let accumulation_time = start.elapsed();

        info!(
            "flow routing done: direction {:.2?}, accumulation {:.2?}",
            direction_time, accumulation_time
        );
        Ok(FlowSummary {
            width,
            height,
            threads: pool.threads(),
            valid_cells: direction.valid_cells,
            sources: direction.sources.len(),
            confluences: direction.confluences,
            direction_time,
            accumulation_time,
        })
    }
}

fn check_output(elevation: &dyn RasterBand, output: &dyn RasterBand) -> Result<()> {
    if output.width() != elevation.width() || output.height() != elevation.height() {
        return Err(Error::SizeMismatch {
            ew: elevation.width(),
            eh: elevation.height(),
            aw: output.width(),
            ah: output.height(),
        });
    }
    Ok(())
}

fn resolve(elevation: &dyn RasterBand, params: &FlowParams) -> Result<PhaseSettings> {
    let cell_size = params
        .cell_size
        .unwrap_or_else(|| elevation.geo_transform().cell_size());
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return Err(Error::InvalidParameter {
            name: "cell_size",
            value: cell_size.to_string(),
            reason: "must be a positive number".to_string(),
        });
    }
    if params.chunk_size == 0 {
        return Err(Error::InvalidParameter {
            name: "chunk_size",
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if params.band_budget_bytes == 0 {
        return Err(Error::InvalidParameter {
            name: "band_budget_bytes",
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(PhaseSettings {
        cell_size,
        band_budget_bytes: params.band_budget_bytes,
        chunk_size: params.chunk_size,
        lock_mode: params.lock_mode,
        temp_dir: params.temp_dir.clone(),
    })
}

impl Algorithm for FlowRouting {
    type Input = FlowBands;
    type Output = FlowSummary;
    type Params = FlowParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flow Routing (D8)"
    }

    fn description(&self) -> &'static str {
        "D8 flow direction and flow accumulation over out-of-core rasters"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        self.run(&input, &params)
    }
}

/// Run D8 flow routing with a fresh engine
pub fn flow_routing(bands: &FlowBands, params: &FlowParams) -> Result<FlowSummary> {
    FlowRouting::new().run(bands, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use flowtile_core::GeoTransform;

    fn dem(width: usize, height: usize, values: Vec<f64>) -> Arc<dyn RasterBand> {
        Arc::new(MemoryBand::from_vec(width, height, CellType::Float32, values).unwrap())
    }

    #[test]
    fn test_params_defaults() {
        let params = FlowParams::default();
        assert_eq!(params.threads, 0);
        assert_eq!(params.band_budget_bytes, 10 * 1024 * 1024);
        assert_eq!(params.chunk_size, 100_000);
        assert_eq!(params.lock_mode, LockMode::Rare);
    }

    #[test]
    fn test_cell_size_from_geotransform() {
        let band = MemoryBand::new(2, 2, CellType::Float32);
        band.set_geo_transform(GeoTransform::new(0.0, 10.0, 30.0, -30.0)).unwrap();
        let settings = resolve(&band, &FlowParams::default()).unwrap();
        assert_relative_eq!(settings.cell_size, 30.0);

        let params = FlowParams {
            cell_size: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&band, &params),
            Err(Error::InvalidParameter { name: "cell_size", .. })
        ));
    }

    #[test]
    fn test_output_size_mismatch() {
        let bands = FlowBands {
            elevation: dem(2, 2, vec![0.0; 4]),
            directions: Arc::new(MemoryBand::new(3, 2, CellType::Int8)),
            accumulation: Arc::new(MemoryBand::new(2, 2, CellType::UInt64)),
        };
        let err = flow_routing(&bands, &FlowParams::default()).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { aw: 3, .. }));
    }

    #[test]
    fn test_unsigned_directions_rejected() {
        let elevation = dem(2, 2, vec![0.0; 4]);
        let bands = FlowBands {
            directions: Arc::new(MemoryBand::new(2, 2, CellType::UInt8)),
            ..FlowBands::in_memory(elevation)
        };
        let err = flow_routing(&bands, &FlowParams::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDataType(_)));
    }

    #[test]
    fn test_progress_after_failure() {
        // 3x3 with a pit in the middle
        let mut values = vec![5.0; 9];
        values[4] = 1.0;
        let bands = FlowBands::in_memory(dem(3, 3, values));
        let engine = FlowRouting::new();
        let err = engine.run(&bands, &FlowParams::default()).unwrap_err();
        assert!(matches!(err, Error::Depression { x: 1, y: 1 }));
        assert_eq!(engine.progress().percent(), -1);
    }

    #[test]
    fn test_algorithm_trait() {
        let values = (0..9).map(|i| (i % 3 + i / 3) as f64).collect();
        let bands = FlowBands::in_memory(dem(3, 3, values));
        let engine = FlowRouting::new();
        assert_eq!(engine.name(), "Flow Routing (D8)");
        let summary = engine.execute_default(bands.clone()).unwrap();
        assert_eq!(summary.valid_cells, 9);
        assert_eq!(summary.confluences, 3);
        assert_eq!(engine.progress().percent(), 100);
    }
}
