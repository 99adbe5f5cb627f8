//! Benchmarks for flow routing

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowtile_algorithms::hydrology::{flow_routing, FlowBands, FlowParams};
use flowtile_core::cache::LockMode;
use flowtile_core::io::MemoryBand;
use flowtile_core::raster::CellType;
use flowtile_core::{GeoTransform, RasterBand};

/// Create a DEM sloping toward an outlet just off the west edge
fn create_basin_dem(size: usize) -> Arc<dyn RasterBand> {
    let outlet = (-1.0, size as f64 / 2.0);
    let mut values = Vec::with_capacity(size * size);
    for row in 0..size {
        for col in 0..size {
            let dx = col as f64 - outlet.0;
            let dy = row as f64 - outlet.1;
            let dist = (dx * dx + dy * dy).sqrt();
            // Small noise to avoid flat areas
            let noise = ((row * 7 + col * 13) % 17) as f64 * 0.01;
            values.push(dist + noise);
        }
    }
    let dem = MemoryBand::from_vec(size, size, CellType::Float32, values).unwrap();
    dem.set_geo_transform(GeoTransform::new(0.0, size as f64, 1.0, -1.0))
        .unwrap();
    Arc::new(dem)
}

fn bench_flow_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/flow_routing");
    group.sample_size(10);
    for size in [256, 512, 1024] {
        let dem = create_basin_dem(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let bands = FlowBands::in_memory(Arc::clone(&dem));
                flow_routing(black_box(&bands), &FlowParams::default()).unwrap()
            })
        });
    }
    group.finish();
}

/// Small budgets force frequent band eviction
fn bench_band_budget(c: &mut Criterion) {
    let size = 512;
    let dem = create_basin_dem(size);
    let mut group = c.benchmark_group("hydrology/band_budget");
    group.sample_size(10);
    for rows in [4, 32, 256] {
        let params = FlowParams {
            band_budget_bytes: rows * size * 4,
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(rows), &params, |b, params| {
            b.iter(|| {
                let bands = FlowBands::in_memory(Arc::clone(&dem));
                flow_routing(black_box(&bands), params).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_lock_mode(c: &mut Criterion) {
    let size = 512;
    let dem = create_basin_dem(size);
    let mut group = c.benchmark_group("hydrology/lock_mode");
    group.sample_size(10);
    for (name, lock_mode) in [("eager", LockMode::Eager), ("rare", LockMode::Rare)] {
        let params = FlowParams {
            lock_mode,
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &params, |b, params| {
            b.iter(|| {
                let bands = FlowBands::in_memory(Arc::clone(&dem));
                flow_routing(black_box(&bands), params).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flow_routing, bench_band_budget, bench_lock_mode);
criterion_main!(benches);
