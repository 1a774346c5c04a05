//! Image adapters and intensity normalization.
//!
//! DICOM files go through `dicom-object`/`dicom-pixeldata`; the first frame of a
//! single-sample (grayscale) image is used. Raw inputs are headerless
//! little-endian sample streams in row-major order.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, bail};
use clap::ValueEnum;
use dicom_object::{DefaultDicomObject, open_file};
use dicom_pixeldata::PixelDecoder;
use ndarray::Array2;

pub fn load_dicom(path: &Path) -> anyhow::Result<Array2<f64>> {
    let obj = open_file(path).with_context(|| format!("opening {}", path.display()))?;
    dicom_pixels(&obj).with_context(|| format!("decoding pixel data of {}", path.display()))
}

/// First frame of the pixel data, modality rescale applied.
pub fn dicom_pixels(obj: &DefaultDicomObject) -> anyhow::Result<Array2<f64>> {
    let decoded = obj.decode_pixel_data()?;
    let rows = decoded.rows() as usize;
    let cols = decoded.columns() as usize;
    if decoded.samples_per_pixel() != 1 {
        bail!(
            "expected a grayscale image, found {} samples per pixel",
            decoded.samples_per_pixel()
        );
    }
    if decoded.number_of_frames() > 1 {
        tracing::warn!(
            frames = decoded.number_of_frames(),
            "multi-frame image, using the first frame"
        );
    }

    let mut samples: Vec<f64> = decoded.to_vec()?;
    if samples.len() < rows * cols {
        bail!(
            "pixel data holds {} samples, a {rows}x{cols} frame needs {}",
            samples.len(),
            rows * cols
        );
    }
    samples.truncate(rows * cols);
    Ok(Array2::from_shape_vec((rows, cols), samples)?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SampleFormat {
    U8,
    U16,
    F32,
    F64,
}

impl SampleFormat {
    pub fn width(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::U16 => 2,
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    fn decode(&self, chunk: &[u8]) -> f64 {
        match self {
            SampleFormat::U8 => chunk[0] as f64,
            SampleFormat::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as f64,
            SampleFormat::F32 => {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            SampleFormat::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(chunk);
                f64::from_le_bytes(b)
            }
        }
    }
}

pub fn read_raw(
    path: &Path,
    rows: usize,
    cols: usize,
    format: SampleFormat,
) -> anyhow::Result<Array2<f64>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_raw(&bytes, rows, cols, format).with_context(|| format!("decoding {}", path.display()))
}

pub fn decode_raw(
    bytes: &[u8],
    rows: usize,
    cols: usize,
    format: SampleFormat,
) -> anyhow::Result<Array2<f64>> {
    let expected = rows * cols * format.width();
    if bytes.len() != expected {
        bail!(
            "expected {expected} bytes for a {rows}x{cols} {format:?} image, found {}",
            bytes.len()
        );
    }
    let samples: Vec<f64> = bytes
        .chunks_exact(format.width())
        .map(|chunk| format.decode(chunk))
        .collect();
    Ok(Array2::from_shape_vec((rows, cols), samples)?)
}

/// Min-max rescale into `[0, 1]`. A constant image maps to zeros.
pub fn normalize(pixels: &Array2<f64>) -> Array2<f64> {
    let lo = pixels.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = pixels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if pixels.is_empty() || hi == lo {
        return Array2::zeros(pixels.dim());
    }
    pixels.mapv(|v| (v - lo) / (hi - lo))
}

/// Row-major little-endian f32 dump.
pub fn write_f32_field<W: Write>(w: &mut W, field: &Array2<f64>) -> io::Result<()> {
    for &x in field.iter() {
        w.write_all(&(x as f32).to_le_bytes())?;
    }
    Ok(())
}
