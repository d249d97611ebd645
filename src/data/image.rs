//! Grayscale raster images with spatial calibration.
//!
//! Camera-like devices return [`ImageData`]. The pixel buffer is stored
//! losslessly as TIFF (8- or 16-bit); pixel size, world position and any
//! extra attributes travel in the index entry of the file so they survive a
//! write/read cycle unchanged.

use crate::error::{AppResult, DaqError};
use image::codecs::tiff::TiffEncoder;
use image::{DynamicImage, ExtendedColorType};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Pixel storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    /// 8-bit grayscale
    Gray8(Vec<u8>),
    /// 16-bit grayscale (native format of scientific cameras)
    Gray16(Vec<u16>),
}

impl Pixels {
    fn len(&self) -> usize {
        match self {
            Pixels::Gray8(p) => p.len(),
            Pixels::Gray16(p) => p.len(),
        }
    }
}

/// A single calibrated image frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major pixel values
    pub pixels: Pixels,
    /// Physical size of one pixel (x, y), in meters
    pub pixel_size: Option<[f64; 2]>,
    /// World position of the image origin (x, y), in meters
    pub position: Option<[f64; 2]>,
    /// Additional attributes
    pub attrs: Map<String, Value>,
}

impl ImageData {
    /// Uncalibrated image; fails when the buffer does not match the dimensions.
    pub fn new(width: u32, height: u32, pixels: Pixels) -> AppResult<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(DaqError::InvalidState(format!(
                "image data size mismatch: expected {} pixels for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            pixel_size: None,
            position: None,
            attrs: Map::new(),
        })
    }

    /// Set the pixel size.
    pub fn with_pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = Some([x, y]);
        self
    }

    /// Set the world position.
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some([x, y]);
        self
    }

    /// Calibration as index attributes (`pixelSize`, `position`, `attrs`).
    pub fn calibration_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        if let Some(size) = self.pixel_size {
            info.insert("pixelSize".to_string(), Value::from(size.to_vec()));
        }
        if let Some(pos) = self.position {
            info.insert("position".to_string(), Value::from(pos.to_vec()));
        }
        if !self.attrs.is_empty() {
            info.insert("attrs".to_string(), Value::Object(self.attrs.clone()));
        }
        info
    }

    /// Restore calibration from index attributes.
    pub fn apply_calibration(&mut self, info: &Map<String, Value>) {
        self.pixel_size = info.get("pixelSize").and_then(pair);
        self.position = info.get("position").and_then(pair);
        self.attrs = info
            .get("attrs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
    }

    /// Encode as TIFF and sync the file.
    pub fn write_tiff(&self, path: &Path) -> AppResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        {
            let encoder = TiffEncoder::new(&mut writer);
            match &self.pixels {
                Pixels::Gray8(p) => {
                    encoder.encode(p, self.width, self.height, ExtendedColorType::L8)?
                }
                Pixels::Gray16(p) => {
                    let bytes: Vec<u8> = p.iter().flat_map(|v| v.to_ne_bytes()).collect();
                    encoder.encode(&bytes, self.width, self.height, ExtendedColorType::L16)?
                }
            }
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        tracing::debug!(
            path = ?path,
            dimensions = format!("{}x{}", self.width, self.height),
            "Wrote TIFF image"
        );
        Ok(())
    }

    /// Decode a TIFF file; calibration is left empty.
    pub fn read_tiff(path: &Path) -> AppResult<Self> {
        let decoded = image::open(path)?;
        let (width, height) = (decoded.width(), decoded.height());
        let pixels = match decoded {
            DynamicImage::ImageLuma8(buf) => Pixels::Gray8(buf.into_raw()),
            DynamicImage::ImageLuma16(buf) => Pixels::Gray16(buf.into_raw()),
            other => Pixels::Gray16(other.into_luma16().into_raw()),
        };
        Self::new(width, height, pixels)
    }
}

/// True when `head` looks like a TIFF stream (either byte order).
pub fn probe(head: &[u8]) -> bool {
    head.starts_with(b"II*\x00") || head.starts_with(b"MM\x00*")
}

fn pair(value: &Value) -> Option<[f64; 2]> {
    let items = value.as_array()?;
    match items.as_slice() {
        [x, y] => Some([x.as_f64()?, y.as_f64()?]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sixteen_bit_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        let pixels: Vec<u16> = (0..64 * 32).map(|i| (i * 31 % 65_536) as u16).collect();
        let img = ImageData::new(64, 32, Pixels::Gray16(pixels)).unwrap();
        img.write_tiff(&path).unwrap();

        let back = ImageData::read_tiff(&path).unwrap();
        assert_eq!(back.pixels, img.pixels);
        assert_eq!((back.width, back.height), (64, 32));
    }

    #[test]
    fn calibration_round_trips_through_info() {
        let mut img = ImageData::new(2, 2, Pixels::Gray8(vec![1, 2, 3, 4]))
            .unwrap()
            .with_pixel_size(1.5e-6, 1.5e-6)
            .with_position(-0.001, 0.002);
        img.attrs.insert("objective".into(), Value::from("40x"));

        let info = img.calibration_info();
        let mut restored = ImageData::new(2, 2, Pixels::Gray8(vec![1, 2, 3, 4])).unwrap();
        restored.apply_calibration(&info);
        assert_eq!(restored, img);
    }

    #[test]
    fn size_mismatch_rejected() {
        let err = ImageData::new(4, 4, Pixels::Gray8(vec![0; 3])).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
