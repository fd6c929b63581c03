//! Byte encodings of cached artifacts.
//!
//! Rasters are single-page grayscale TIFF: 8-bit unsigned for masks,
//! 32-bit unsigned for labels and 32-bit IEEE float for densities, written
//! uncompressed in row-major order. Boundary paths and neighborhood
//! outcomes are gzip-compressed JSON.

use std::io::{Cursor, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use image::{ImageBuffer, Luma, Primitive};
use plexmap_pipeline::{BoundaryPath, NeighborhoodOutcome};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{TiffEncoder, TiffValue};

use crate::error::StoreError;

/// A value that can be persisted by the artifact cache.
pub trait Artifact: Sized {
    /// Serialize to the on-disk byte form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    fn encode(&self) -> Result<Vec<u8>, StoreError>;

    /// Parse the on-disk byte form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] for malformed input.
    fn decode(bytes: &[u8]) -> Result<Self, StoreError>;
}

/// Raster sample types with a grayscale TIFF representation.
pub trait TiffSample: Primitive {
    type Color: ColorType<Inner = Self>;
    const BITS: u8;

    /// The samples of a decoded image, if they have this type.
    fn from_decoded(decoded: DecodingResult) -> Option<Vec<Self>>;
}

impl TiffSample for u8 {
    type Color = colortype::Gray8;
    const BITS: u8 = 8;
    fn from_decoded(decoded: DecodingResult) -> Option<Vec<Self>> {
        match decoded {
            DecodingResult::U8(samples) => Some(samples),
            _ => None,
        }
    }
}

impl TiffSample for u32 {
    type Color = colortype::Gray32;
    const BITS: u8 = 32;
    fn from_decoded(decoded: DecodingResult) -> Option<Vec<Self>> {
        match decoded {
            DecodingResult::U32(samples) => Some(samples),
            _ => None,
        }
    }
}

impl TiffSample for f32 {
    type Color = colortype::Gray32Float;
    const BITS: u8 = 32;
    fn from_decoded(decoded: DecodingResult) -> Option<Vec<Self>> {
        match decoded {
            DecodingResult::F32(samples) => Some(samples),
            _ => None,
        }
    }
}

fn tiff_error(err: tiff::TiffError) -> StoreError {
    StoreError::Codec(format!("tiff: {err}"))
}

/// Gzip-compress a byte slice.
///
/// # Errors
///
/// Returns an I/O error if compression fails.
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip stream.
///
/// # Errors
///
/// Returns [`StoreError::Codec`] if the input is not valid gzip.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| StoreError::Codec(format!("gzip: {e}")))?;
    Ok(out)
}

/// Encode a single-channel raster as TIFF.
///
/// # Errors
///
/// Returns [`StoreError::Codec`] if the encoder rejects the raster.
pub fn encode_raster<P>(raster: &ImageBuffer<Luma<P>, Vec<P>>) -> Result<Vec<u8>, StoreError>
where
    P: TiffSample,
    [P]: TiffValue,
{
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut out).map_err(tiff_error)?;
        encoder
            .write_image::<P::Color>(raster.width(), raster.height(), raster.as_raw())
            .map_err(tiff_error)?;
    }
    Ok(out.into_inner())
}

/// Decode a single-channel TIFF raster, checking bit depth, sample format
/// and length.
///
/// # Errors
///
/// Returns [`StoreError::Codec`] for any mismatch.
pub fn decode_raster<P: TiffSample>(bytes: &[u8]) -> Result<ImageBuffer<Luma<P>, Vec<P>>, StoreError> {
    let mut decoder = Decoder::new(Cursor::new(bytes))
        .map_err(tiff_error)?
        .with_limits(Limits::unlimited());
    match decoder.colortype().map_err(tiff_error)? {
        tiff::ColorType::Gray(bits) if bits == P::BITS => {}
        other => {
            return Err(StoreError::Codec(format!(
                "expected {}-bit grayscale raster, found {other:?}",
                P::BITS
            )));
        }
    }
    let (width, height) = decoder.dimensions().map_err(tiff_error)?;
    let samples = P::from_decoded(decoder.read_image().map_err(tiff_error)?)
        .ok_or_else(|| StoreError::Codec("raster sample format mismatch".into()))?;
    ImageBuffer::from_raw(width, height, samples)
        .ok_or_else(|| StoreError::Codec("raster buffer size mismatch".into()))
}

/// Serialize to gzip-compressed JSON.
///
/// # Errors
///
/// Returns an error if serialization or compression fails.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    gzip(&serde_json::to_vec(value)?)
}

/// Parse gzip-compressed JSON.
///
/// # Errors
///
/// Returns [`StoreError::Codec`] for invalid gzip or JSON.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(&gunzip(bytes)?).map_err(|e| StoreError::Codec(format!("json: {e}")))
}

impl<P> Artifact for ImageBuffer<Luma<P>, Vec<P>>
where
    P: TiffSample,
    [P]: TiffValue,
{
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode_raster(self)
    }
    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode_raster(bytes)
    }
}

impl Artifact for Vec<BoundaryPath> {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode_json(self)
    }
    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode_json(bytes)
    }
}

impl Artifact for NeighborhoodOutcome {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode_json(self)
    }
    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode_json(bytes)
    }
}
