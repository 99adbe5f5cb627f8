//! flowtile CLI - out-of-core D8 flow routing

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use flowtile_algorithms::hydrology::{FlowBands, FlowParams, FlowRouting, Phase, Progress};
use flowtile_core::cache::{LockMode, DEFAULT_BAND_BUDGET};
use flowtile_core::io::{write_geotiff, RawBand};
use flowtile_core::raster::CellType;
use flowtile_core::RasterBand;

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "flowtile")]
#[command(author, version, about = "Out-of-core D8 flow direction and accumulation", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about a raster file
    Info {
        /// Input raster file (.tif or raw band)
        input: PathBuf,
    },
    /// D8 flow direction and flow accumulation from a depression-free DEM
    D8 {
        /// Input DEM file
        input: PathBuf,
        /// Output direction raster (codes 1-9, negative at confluences)
        #[arg(short, long)]
        directions: PathBuf,
        /// Output accumulation raster (upstream cell count)
        #[arg(short, long)]
        accumulation: PathBuf,
        /// Worker threads (0 = all cores)
        #[arg(short, long, default_value = "0")]
        threads: usize,
        /// Horizontal cell size (default: from the DEM geotransform)
        #[arg(long)]
        cell_size: Option<f64>,
        /// Memory budget per band cache in MiB
        #[arg(long, default_value_t = DEFAULT_BAND_BUDGET >> 20)]
        budget_mb: usize,
        /// Sources per accumulation work chunk
        #[arg(long, default_value = "100000")]
        chunk_size: usize,
        /// Lock the tile cache on every access in the direction phase
        #[arg(long)]
        eager_locking: bool,
        /// Directory for the temporary sources file
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")
}

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn is_geotiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        .unwrap_or(false)
}

#[cfg(not(feature = "gdal"))]
fn open_geotiff(path: &Path) -> Result<Arc<dyn RasterBand>> {
    let pb = spinner("Reading raster...")?;
    let band = flowtile_core::io::read_geotiff(path).with_context(|| format!("Failed to read {}", path.display()))?;
    pb.finish_and_clear();
    Ok(Arc::new(band))
}

/// With GDAL available, GeoTIFF inputs are read window by window
#[cfg(feature = "gdal")]
fn open_geotiff(path: &Path) -> Result<Arc<dyn RasterBand>> {
    let band = flowtile_core::io::GdalBand::open(path, 1)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Arc::new(band))
}

fn open_input(path: &Path) -> Result<Arc<dyn RasterBand>> {
    if is_geotiff(path) {
        return open_geotiff(path);
    }
    let band = RawBand::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Arc::new(band))
}

/// Output band plus what to do with it once the run ends.
///
/// File-backed outputs are written under a `.partial` name that only becomes
/// the requested path after a successful run.
struct Output {
    path: PathBuf,
    partial: Option<PathBuf>,
    band: Arc<dyn RasterBand>,
}

fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

/// GeoTIFF outputs stay in memory and are encoded once the run succeeded
#[cfg(not(feature = "gdal"))]
fn create_geotiff(
    _path: &Path,
    like: &dyn RasterBand,
    cell_type: CellType,
) -> Result<(Option<PathBuf>, Arc<dyn RasterBand>)> {
    let band = flowtile_core::io::MemoryBand::like(like, cell_type);
    Ok((None, Arc::new(band)))
}

/// With GDAL available, GeoTIFF outputs are written window by window
#[cfg(feature = "gdal")]
fn create_geotiff(
    path: &Path,
    like: &dyn RasterBand,
    cell_type: CellType,
) -> Result<(Option<PathBuf>, Arc<dyn RasterBand>)> {
    let partial = partial_path(path);
    let band = flowtile_core::io::GdalBand::create(&partial, like.width(), like.height(), cell_type)
        .with_context(|| format!("Failed to create {}", partial.display()))?;
    Ok((Some(partial), Arc::new(band)))
}

impl Output {
    fn create(path: &Path, like: &dyn RasterBand, cell_type: CellType) -> Result<Self> {
        let (partial, band) = if is_geotiff(path) {
            create_geotiff(path, like, cell_type)?
        } else {
            let partial = partial_path(path);
            let band = RawBand::create(&partial, like.width(), like.height(), cell_type)
                .with_context(|| format!("Failed to create {}", partial.display()))?;
            (Some(partial), Arc::new(band) as Arc<dyn RasterBand>)
        };
        Ok(Self {
            path: path.to_path_buf(),
            partial,
            band,
        })
    }

    fn commit(self) -> Result<()> {
        match self.partial {
            None => {
                let pb = spinner("Writing output...")?;
                write_geotiff(&*self.band, &self.path)
                    .with_context(|| format!("Failed to write {}", self.path.display()))?;
                pb.finish_and_clear();
            }
            Some(partial) => {
                self.band.flush()?;
                drop(self.band);
                std::fs::rename(&partial, &self.path)
                    .with_context(|| format!("Failed to move output to {}", self.path.display()))?;
            }
        }
        Ok(())
    }

    fn abort(self) {
        if let Some(partial) = self.partial {
            drop(self.band);
            if let Err(e) = std::fs::remove_file(&partial) {
                warn!("could not remove {}: {}", partial.display(), e);
            }
        }
    }
}

fn track(progress: &Progress, pb: &ProgressBar) {
    loop {
        let phase = progress.phase();
        if matches!(phase, Phase::Finished | Phase::Failed) {
            break;
        }
        pb.set_message(format!("{} {}%", phase, progress.percent().max(0)));
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn info(input: &Path) -> Result<()> {
    let band = open_input(input)?;
    let (width, height) = (band.width(), band.height());
    let transform = band.geo_transform();
    let bounds = transform.bounds(width, height);

    println!("File: {}", input.display());
    println!("Dimensions: {} x {} ({} cells)", width, height, width * height);
    println!("Cell type: {}", band.cell_type());
    println!("Cell size: {}", transform.cell_size());
    println!(
        "Bounds: ({:.6}, {:.6}) - ({:.6}, {:.6})",
        bounds.0, bounds.1, bounds.2, bounds.3
    );
    if let Some(crs) = band.crs() {
        println!("CRS: {}", crs);
    }
    match band.nodata() {
        Some(nodata) => println!("NoData: {}", nodata),
        None => println!("NoData: none"),
    }
    Ok(())
}

fn d8(input: &Path, directions: &Path, accumulation: &Path, params: FlowParams) -> Result<()> {
    if directions == accumulation {
        bail!("direction and accumulation outputs must be different files");
    }
    let elevation = open_input(input)?;
    let dir_out = Output::create(directions, &*elevation, CellType::Int8)?;
    let acc_out = Output::create(accumulation, &*elevation, CellType::UInt64)?;
    let bands = FlowBands {
        elevation,
        directions: Arc::clone(&dir_out.band),
        accumulation: Arc::clone(&acc_out.band),
    };

    let engine = FlowRouting::new();
    let progress = engine.progress();
    let pb = spinner("Starting...")?;
    let start = Instant::now();
    let result = std::thread::scope(|s| {
        s.spawn(|| track(&progress, &pb));
        engine.run(&bands, &params)
    });
    pb.finish_and_clear();
    drop(bands);

    match result {
        Ok(summary) => {
            dir_out.commit()?;
            acc_out.commit()?;
            info!(
                "{} valid cells, {} sources, {} confluences, {} threads",
                summary.valid_cells, summary.sources, summary.confluences, summary.threads
            );
            println!(
                "D8 flow routing: {} and {} ({:.2?})",
                directions.display(),
                accumulation.display(),
                start.elapsed()
            );
            Ok(())
        }
        Err(e) => {
            dir_out.abort();
            acc_out.abort();
            Err(e).context("Flow routing failed")
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Info { input } => info(&input),
        Commands::D8 {
            input,
            directions,
            accumulation,
            threads,
            cell_size,
            budget_mb,
            chunk_size,
            eager_locking,
            temp_dir,
        } => {
            let params = FlowParams {
                threads,
                cell_size,
                band_budget_bytes: budget_mb.saturating_mul(1 << 20),
                chunk_size,
                lock_mode: if eager_locking { LockMode::Eager } else { LockMode::Rare },
                temp_dir,
            };
            d8(&input, &directions, &accumulation, params)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtile_core::io::MemoryBand;

    fn written_output(path: &Path) -> Output {
        let like = MemoryBand::new(4, 3, CellType::Float32);
        let output = Output::create(path, &like, CellType::UInt64).unwrap();
        let cells: Vec<u64> = (0..12).collect();
        output
            .band
            .write_u64(flowtile_core::io::Window::rows(0, 3, 4), &cells)
            .unwrap();
        output
    }

    #[test]
    fn test_raw_output_renamed_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acc.ftr");
        let output = written_output(&path);
        assert!(dir.path().join("acc.ftr.partial").exists());
        assert!(!path.exists());

        output.commit().unwrap();
        assert!(!dir.path().join("acc.ftr.partial").exists());
        let band = RawBand::open(&path).unwrap();
        assert_eq!(flowtile_core::io::read_band::<u64>(&band).unwrap()[11], 11);
    }

    #[test]
    fn test_raw_output_removed_on_abort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dir.ftr");
        written_output(&path).abort();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_geotiff_output_written_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acc.tif");
        written_output(&path).commit().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("acc.tif")]);
        let band = open_input(&path).unwrap();
        assert_eq!((band.width(), band.height()), (4, 3));
        assert_eq!(flowtile_core::io::read_band::<u64>(&*band).unwrap()[5], 5);
    }

    #[test]
    fn test_geotiff_output_removed_on_abort() {
        let dir = tempfile::tempdir().unwrap();
        written_output(&dir.path().join("dir.tif")).abort();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
