//! Native GeoTIFF reading/writing (without GDAL dependency)
//!
//! Uses the `tiff` crate for basic TIFF I/O. Images are decoded whole into a
//! [`MemoryBand`]; use [`RawBand`](super::RawBand) for rasters that do not fit
//! in memory. For full GeoTIFF support enable the `gdal` feature.

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{
    ColorType, Gray32, Gray32Float, Gray64, Gray64Float, Gray8, GrayI32, GrayI8,
};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind, TiffValue};
use tiff::tags::Tag;

use super::band::{read_band, BandMeta, RasterBand};
use super::memory::MemoryBand;
use crate::error::{Error, Result};
use crate::raster::{CellType, GeoTransform};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

/// Read a GeoTIFF file into a memory band
pub fn read_geotiff<P: AsRef<Path>>(path: P) -> Result<MemoryBand> {
    let file = File::open(path.as_ref())?;
    decode_geotiff(file)
}

/// Read a GeoTIFF from an in-memory buffer
pub fn read_geotiff_from_buffer(data: &[u8]) -> Result<MemoryBand> {
    decode_geotiff(Cursor::new(data))
}

/// Internal: decode a GeoTIFF from any `Read + Seek` source
fn decode_geotiff<R: Read + Seek>(reader: R) -> Result<MemoryBand> {
    let mut decoder = Decoder::new(reader)
        .map_err(|e| Error::Other(format!("TIFF decode error: {}", e)))?;

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| Error::Other(format!("Cannot read dimensions: {}", e)))?;
    let (width, height) = (width as usize, height as usize);

    let result = decoder
        .read_image()
        .map_err(|e| Error::Other(format!("Cannot read image data: {}", e)))?;

    fn widen<S: Copy + Into<f64>>(buf: Vec<S>) -> Vec<f64> {
        buf.into_iter().map(Into::into).collect()
    }

    let (cell_type, values) = match result {
        DecodingResult::U8(buf) => (CellType::UInt8, widen(buf)),
        DecodingResult::I8(buf) => (CellType::Int8, widen(buf)),
        DecodingResult::U16(buf) => (CellType::UInt32, widen(buf)),
        DecodingResult::I16(buf) => (CellType::Int32, widen(buf)),
        DecodingResult::U32(buf) => (CellType::UInt32, widen(buf)),
        DecodingResult::I32(buf) => (CellType::Int32, widen(buf)),
        DecodingResult::U64(buf) => (CellType::UInt64, buf.into_iter().map(|v| v as f64).collect()),
        DecodingResult::F32(buf) => (CellType::Float32, widen(buf)),
        DecodingResult::F64(buf) => (CellType::Float64, buf),
        _ => {
            return Err(Error::UnsupportedDataType(
                "Unsupported TIFF pixel format".to_string(),
            ))
        }
    };

    if values.len() != width * height {
        // Multi-sample images decode to more values than cells
        return Err(Error::InvalidDimensions { width, height });
    }

    let band = MemoryBand::from_vec(width, height, cell_type, values)?;
    let meta = BandMeta {
        nodata: read_nodata(&mut decoder),
        transform: read_geotransform(&mut decoder).unwrap_or_default(),
        crs: None,
    };
    band.set_meta(meta)?;
    Ok(band)
}

/// GDAL stores no-data as an ASCII tag
fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse().ok())
}

/// Attempt to read GeoTransform from ModelPixelScale + ModelTiepoint tags
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))
        .ok()?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT))
        .ok()?;

    if scale.len() >= 2 && tiepoint.len() >= 6 {
        // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
        let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
        let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
        return Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]));
    }
    None
}

/// Write any band to a GeoTIFF file, keeping its cell type
pub fn write_geotiff<P: AsRef<Path>>(band: &dyn RasterBand, path: P) -> Result<()> {
    let file = BufWriter::new(File::create(path.as_ref())?);
    encode_geotiff(band, file)
}

/// Write any band to an in-memory GeoTIFF buffer
pub fn write_geotiff_to_buffer(band: &dyn RasterBand) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_geotiff(band, Cursor::new(&mut buf))?;
    Ok(buf)
}

fn encode_geotiff<W: Write + Seek>(band: &dyn RasterBand, writer: W) -> Result<()> {
    let mut encoder = TiffEncoder::new(writer)
        .map_err(|e| Error::Other(format!("TIFF encoder error: {}", e)))?;

    match band.cell_type() {
        CellType::Int8 => encode_image::<GrayI8, _>(&mut encoder, band, &read_band::<i8>(band)?),
        CellType::UInt8 => encode_image::<Gray8, _>(&mut encoder, band, &read_band::<u8>(band)?),
        CellType::Int32 => encode_image::<GrayI32, _>(&mut encoder, band, &read_band::<i32>(band)?),
        CellType::UInt32 => encode_image::<Gray32, _>(&mut encoder, band, &read_band::<u32>(band)?),
        CellType::UInt64 => encode_image::<Gray64, _>(&mut encoder, band, &read_band::<u64>(band)?),
        CellType::Float32 => {
            encode_image::<Gray32Float, _>(&mut encoder, band, &read_band::<f32>(band)?)
        }
        CellType::Float64 => {
            encode_image::<Gray64Float, _>(&mut encoder, band, &read_band::<f64>(band)?)
        }
    }
}

fn encode_image<C, W>(
    encoder: &mut TiffEncoder<W>,
    band: &dyn RasterBand,
    data: &[C::Inner],
) -> Result<()>
where
    C: ColorType,
    [C::Inner]: TiffValue,
    W: Write + Seek,
{
    let mut image = encoder
        .new_image::<C>(band.width() as u32, band.height() as u32)
        .map_err(|e| Error::Other(format!("Cannot create TIFF image: {}", e)))?;

    write_geo_tags(image.encoder(), &band.meta())?;

    image
        .write_data(data)
        .map_err(|e| Error::Other(format!("Cannot write image data: {}", e)))
}

fn write_geo_tags<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<'_, W, K>,
    meta: &BandMeta,
) -> Result<()> {
    let gt = meta.transform;
    let tag_err = |e: tiff::TiffError| Error::Other(format!("Cannot write GeoTIFF tag: {}", e));

    let scale = [gt.pixel_width, gt.pixel_height.abs(), 0.0];
    dir.write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &scale[..])
        .map_err(tag_err)?;

    let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
    dir.write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT), &tiepoint[..])
        .map_err(tag_err)?;

    // GTModelTypeGeoKey = projected, GTRasterTypeGeoKey = pixel is area
    let geokeys: [u16; 12] = [1, 1, 0, 2, 1024, 0, 1, 1, 1025, 0, 1, 1];
    dir.write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY), &geokeys[..])
        .map_err(tag_err)?;

    if let Some(nodata) = meta.nodata {
        dir.write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), nodata.to_string().as_str())
            .map_err(tag_err)?;
    }
    Ok(())
}
