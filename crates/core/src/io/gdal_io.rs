//! Raster bands backed by GDAL datasets

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use gdal::raster::{Buffer, GdalDataType, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};

use super::band::{BandMeta, RasterBand, Window};
use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{CellType, GeoTransform, RasterElement};

/// One band of a GDAL dataset.
///
/// GDAL datasets are not safe for concurrent use, so every call takes the
/// dataset lock.
pub struct GdalBand {
    dataset: Mutex<Dataset>,
    band: usize,
    width: usize,
    height: usize,
    cell_type: CellType,
}

impl GdalBand {
    /// Open band `band` (1-indexed) of an existing raster
    pub fn open<P: AsRef<Path>>(path: P, band: usize) -> Result<Self> {
        let dataset = Dataset::open(path.as_ref())?;
        let count = dataset.raster_count();
        if band == 0 || band > count {
            return Err(Error::MissingBand { band, count });
        }
        let (width, height) = dataset.raster_size();
        let cell_type = match dataset.rasterband(band)?.band_type() {
            GdalDataType::Int8 => CellType::Int8,
            GdalDataType::UInt8 => CellType::UInt8,
            GdalDataType::Int16 | GdalDataType::Int32 => CellType::Int32,
            GdalDataType::UInt16 | GdalDataType::UInt32 => CellType::UInt32,
            GdalDataType::UInt64 => CellType::UInt64,
            GdalDataType::Float32 => CellType::Float32,
            GdalDataType::Float64 => CellType::Float64,
            other => return Err(Error::UnsupportedDataType(format!("{:?}", other))),
        };
        Ok(Self {
            dataset: Mutex::new(dataset),
            band,
            width,
            height,
            cell_type,
        })
    }

    /// Create a single-band GeoTIFF
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: usize,
        height: usize,
        cell_type: CellType,
    ) -> Result<Self> {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let path = path.as_ref();
        let dataset = match cell_type {
            CellType::Int8 => driver.create_with_band_type::<i8, _>(path, width, height, 1)?,
            CellType::UInt8 => driver.create_with_band_type::<u8, _>(path, width, height, 1)?,
            CellType::Int32 => driver.create_with_band_type::<i32, _>(path, width, height, 1)?,
            CellType::UInt32 => driver.create_with_band_type::<u32, _>(path, width, height, 1)?,
            CellType::UInt64 => driver.create_with_band_type::<u64, _>(path, width, height, 1)?,
            CellType::Float32 => driver.create_with_band_type::<f32, _>(path, width, height, 1)?,
            CellType::Float64 => driver.create_with_band_type::<f64, _>(path, width, height, 1)?,
        };
        Ok(Self {
            dataset: Mutex::new(dataset),
            band: 1,
            width,
            height,
            cell_type,
        })
    }

    fn read_cells<T: RasterElement + GdalType>(&self, window: Window, buf: &mut [T]) -> Result<()> {
        window.validate(self.width, self.height, buf.len())?;
        let dataset = self.dataset.lock().unwrap_or_else(PoisonError::into_inner);
        let band = dataset.rasterband(self.band)?;
        let size = (window.width, window.height);
        let data = band.read_as::<T>((window.x as isize, window.y as isize), size, size, None)?;
        buf.copy_from_slice(data.data());
        Ok(())
    }

    fn write_cells<T: RasterElement + GdalType>(&self, window: Window, buf: &[T]) -> Result<()> {
        window.validate(self.width, self.height, buf.len())?;
        let dataset = self.dataset.lock().unwrap_or_else(PoisonError::into_inner);
        let mut band = dataset.rasterband(self.band)?;
        let size = (window.width, window.height);
        let mut data = Buffer::new(size, buf.to_vec());
        band.write((window.x as isize, window.y as isize), size, &mut data)?;
        Ok(())
    }
}

impl RasterBand for GdalBand {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn cell_type(&self) -> CellType {
        self.cell_type
    }

    fn meta(&self) -> BandMeta {
        let dataset = self.dataset.lock().unwrap_or_else(PoisonError::into_inner);
        let nodata = dataset
            .rasterband(self.band)
            .ok()
            .and_then(|band| band.no_data_value());
        let transform = dataset
            .geo_transform()
            .map(GeoTransform::from_gdal)
            .unwrap_or_default();
        let crs = dataset.spatial_ref().ok().and_then(|srs| {
            let wkt = srs.to_wkt().ok()?;
            let crs = CRS::from_wkt(wkt);
            Some(match srs.auth_code() {
                Ok(code) => crs.with_epsg(code as u32),
                Err(_) => crs,
            })
        });
        BandMeta {
            nodata,
            transform,
            crs,
        }
    }

    fn set_meta(&self, meta: BandMeta) -> Result<()> {
        let mut dataset = self.dataset.lock().unwrap_or_else(PoisonError::into_inner);
        dataset.set_geo_transform(&meta.transform.to_gdal())?;
        if let Some(crs) = &meta.crs {
            let srs = match (crs.epsg(), crs.wkt()) {
                (Some(code), _) => SpatialRef::from_epsg(code)?,
                (None, Some(wkt)) => SpatialRef::from_wkt(wkt)?,
                (None, None) => return Ok(()),
            };
            dataset.set_spatial_ref(&srs)?;
        }
        let mut band = dataset.rasterband(self.band)?;
        band.set_no_data_value(meta.nodata)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut dataset = self.dataset.lock().unwrap_or_else(PoisonError::into_inner);
        dataset.flush_cache()?;
        Ok(())
    }

    forward_typed_io!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::band::read_band;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acc.tif");
        {
            let band = GdalBand::create(&path, 3, 2, CellType::UInt64).unwrap();
            band.set_meta(BandMeta {
                nodata: Some(0.0),
                transform: GeoTransform::new(100.0, 200.0, 10.0, -10.0),
                crs: None,
            })
            .unwrap();
            band.write_u64(Window::rows(1, 1, 3), &[4, 5, 6]).unwrap();
            band.flush().unwrap();
        }

        let band = GdalBand::open(&path, 1).unwrap();
        assert_eq!(band.cell_type(), CellType::UInt64);
        assert_eq!(band.nodata(), Some(0.0));
        assert_eq!(band.geo_transform().origin_x, 100.0);
        assert_eq!(read_band::<u64>(&band).unwrap(), vec![0, 0, 0, 4, 5, 6]);
    }

    #[test]
    fn test_missing_band() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        GdalBand::create(&path, 2, 2, CellType::Float32).unwrap();
        assert!(matches!(
            GdalBand::open(&path, 2),
            Err(Error::MissingBand { band: 2, count: 1 })
        ));
    }
}
