//! Disk-backed raw raster band
//!
//! A flat little-endian cell file with a fixed-size header. Windows are read
//! and written in place, so rasters far larger than memory can be cached
//! band by band.
//!
//! Layout:
//! ```text
//! offset  size  field
//! 0       4     magic "FTRB"
//! 4       2     version (1)
//! 6       1     cell type code
//! 7       1     has no-data flag
//! 8       8     width (u64)
//! 16      8     height (u64)
//! 24      8     no-data (f64)
//! 32      48    geotransform, GDAL order (6 x f64)
//! 80      4     EPSG code (0 = none)
//! 84      4     WKT length
//! 88      ...   WKT bytes (UTF-8)
//! 4096    ...   cells, row-major
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use num_traits::NumCast;
use tracing::debug;

use super::band::{BandMeta, RasterBand, Window};
use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{CellType, GeoTransform, RasterElement};

const MAGIC: &[u8; 4] = b"FTRB";
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 4096;
const WKT_OFFSET: usize = 88;

/// Raster band stored in a raw cell file
#[derive(Debug)]
pub struct RawBand {
    path: PathBuf,
    file: Mutex<File>,
    width: usize,
    height: usize,
    cell_type: CellType,
    meta: RwLock<BandMeta>,
}

impl RawBand {
    /// Create a zero-filled band file, replacing any existing file
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: usize,
        height: usize,
        cell_type: CellType,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(HEADER_LEN + (width * height * cell_type.size_bytes()) as u64)?;

        let band = Self {
            path,
            file: Mutex::new(file),
            width,
            height,
            cell_type,
            meta: RwLock::new(BandMeta::default()),
        };
        band.write_header(&BandMeta::default())?;
        debug!(
            "Created raw band {} ({}x{} {})",
            band.path.display(),
            width,
            height,
            cell_type
        );
        Ok(band)
    }

    /// Open an existing band file for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = vec![0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|_| Error::UnsupportedDataType(format!("{} is not a raw band", path.display())))?;
        if &header[0..4] != MAGIC {
            return Err(Error::UnsupportedDataType(format!(
                "{} is not a raw band",
                path.display()
            )));
        }
        let version = LittleEndian::read_u16(&header[4..6]);
        if version != VERSION {
            return Err(Error::UnsupportedDataType(format!(
                "raw band version {}",
                version
            )));
        }
        let cell_type = CellType::from_code(header[6])
            .ok_or_else(|| Error::UnsupportedDataType(format!("cell type code {}", header[6])))?;
        let has_nodata = header[7] != 0;
        let width = LittleEndian::read_u64(&header[8..16]) as usize;
        let height = LittleEndian::read_u64(&header[16..24]) as usize;
        let nodata = LittleEndian::read_f64(&header[24..32]);
        let mut coeffs = [0f64; 6];
        LittleEndian::read_f64_into(&header[32..80], &mut coeffs);
        let epsg = LittleEndian::read_u32(&header[80..84]);
        let wkt_len = LittleEndian::read_u32(&header[84..88]) as usize;
        let wkt = header
            .get(WKT_OFFSET..WKT_OFFSET + wkt_len)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();

        let expected = HEADER_LEN + (width * height * cell_type.size_bytes()) as u64;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(Error::InvalidDimensions { width, height });
        }

        let crs = match (epsg, wkt.is_empty()) {
            (0, true) => None,
            (0, false) => Some(CRS::from_wkt(wkt)),
            (code, true) => Some(CRS::from_epsg(code)),
            (code, false) => Some(CRS::from_wkt(wkt).with_epsg(code)),
        };
        let meta = BandMeta {
            nodata: has_nodata.then_some(nodata),
            transform: GeoTransform::from_gdal(coeffs),
            crs,
        };

        Ok(Self {
            path,
            file: Mutex::new(file),
            width,
            height,
            cell_type,
            meta: RwLock::new(meta),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&self, meta: &BandMeta) -> Result<()> {
        let wkt = meta
            .crs
            .as_ref()
            .and_then(|crs| crs.wkt())
            .unwrap_or_default()
            .as_bytes();
        if WKT_OFFSET + wkt.len() > HEADER_LEN as usize {
            return Err(Error::InvalidParameter {
                name: "crs",
                value: format!("{} bytes of WKT", wkt.len()),
                reason: "does not fit the raw band header".to_string(),
            });
        }

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.write_u16::<LittleEndian>(VERSION)?;
        header.write_u8(self.cell_type.code())?;
        header.write_u8(meta.nodata.is_some() as u8)?;
        header.write_u64::<LittleEndian>(self.width as u64)?;
        header.write_u64::<LittleEndian>(self.height as u64)?;
        header.write_f64::<LittleEndian>(meta.nodata.unwrap_or(0.0))?;
        for coeff in meta.transform.to_gdal() {
            header.write_f64::<LittleEndian>(coeff)?;
        }
        header.write_u32::<LittleEndian>(meta.crs.as_ref().and_then(|c| c.epsg()).unwrap_or(0))?;
        header.write_u32::<LittleEndian>(wkt.len() as u32)?;
        header.extend_from_slice(wkt);
        header.resize(HEADER_LEN as usize, 0);

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        Ok(())
    }

    fn cell_offset(&self, x: usize, y: usize) -> u64 {
        HEADER_LEN + ((y * self.width + x) * self.cell_type.size_bytes()) as u64
    }

    fn read_cells<T: RasterElement>(&self, window: Window, buf: &mut [T]) -> Result<()> {
        window.validate(self.width, self.height, buf.len())?;
        if window.is_empty() {
            return Ok(());
        }
        let size = self.cell_type.size_bytes();
        let mut bytes = vec![0u8; window.len() * size];
        {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            if window.width == self.width {
                file.seek(SeekFrom::Start(self.cell_offset(0, window.y)))?;
                file.read_exact(&mut bytes)?;
            } else {
                for (row, chunk) in bytes.chunks_mut(window.width * size).enumerate() {
                    file.seek(SeekFrom::Start(self.cell_offset(window.x, window.y + row)))?;
                    file.read_exact(chunk)?;
                }
            }
        }
        decode_cells(self.cell_type, &bytes, buf);
        Ok(())
    }

    fn write_cells<T: RasterElement>(&self, window: Window, buf: &[T]) -> Result<()> {
        window.validate(self.width, self.height, buf.len())?;
        if window.is_empty() {
            return Ok(());
        }
        let size = self.cell_type.size_bytes();
        let bytes = encode_cells(self.cell_type, buf)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if window.width == self.width {
            file.seek(SeekFrom::Start(self.cell_offset(0, window.y)))?;
            file.write_all(&bytes)?;
        } else {
            for (row, chunk) in bytes.chunks(window.width * size).enumerate() {
                file.seek(SeekFrom::Start(self.cell_offset(window.x, window.y + row)))?;
                file.write_all(chunk)?;
            }
        }
        Ok(())
    }
}

/// Decode stored little-endian cells into the requested element type
fn decode_cells<T: RasterElement>(cell_type: CellType, bytes: &[u8], out: &mut [T]) {
    fn convert<S: NumCast, T: RasterElement>(v: S) -> T {
        num_traits::cast(v).unwrap_or(T::default_nodata())
    }

    let size = cell_type.size_bytes();
    for (cell, raw) in out.iter_mut().zip(bytes.chunks_exact(size)) {
        *cell = match cell_type {
            CellType::Int8 => convert(raw[0] as i8),
            CellType::UInt8 => convert(raw[0]),
            CellType::Int32 => convert(LittleEndian::read_i32(raw)),
            CellType::UInt32 => convert(LittleEndian::read_u32(raw)),
            CellType::UInt64 => convert(LittleEndian::read_u64(raw)),
            CellType::Float32 => convert(LittleEndian::read_f32(raw)),
            CellType::Float64 => convert(LittleEndian::read_f64(raw)),
        };
    }
}

/// Encode cells into the stored little-endian representation
fn encode_cells<T: RasterElement>(cell_type: CellType, cells: &[T]) -> Result<Vec<u8>> {
    fn narrow<S: NumCast, T: RasterElement>(v: T, cell_type: CellType) -> Result<S> {
        num_traits::cast(v).ok_or_else(|| {
            Error::UnsupportedDataType(format!("value {:?} does not fit a {} band", v, cell_type))
        })
    }

    let size = cell_type.size_bytes();
    let mut bytes = vec![0u8; cells.len() * size];
    for (&v, raw) in cells.iter().zip(bytes.chunks_exact_mut(size)) {
        match cell_type {
            CellType::Int8 => raw[0] = narrow::<i8, T>(v, cell_type)? as u8,
            CellType::UInt8 => raw[0] = narrow::<u8, T>(v, cell_type)?,
            CellType::Int32 => LittleEndian::write_i32(raw, narrow(v, cell_type)?),
            CellType::UInt32 => LittleEndian::write_u32(raw, narrow(v, cell_type)?),
            CellType::UInt64 => LittleEndian::write_u64(raw, narrow(v, cell_type)?),
            CellType::Float32 => LittleEndian::write_f32(raw, narrow(v, cell_type)?),
            CellType::Float64 => LittleEndian::write_f64(raw, narrow(v, cell_type)?),
        }
    }
    Ok(bytes)
}

impl RasterBand for RawBand {
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
        self.meta.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_meta(&self, meta: BandMeta) -> Result<()> {
        self.write_header(&meta)?;
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = meta;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    forward_typed_io!();
}
