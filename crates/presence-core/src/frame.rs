use chrono::{DateTime, Local};
use image::GrayImage;
use thiserror::Error;

use crate::types::FaceRegion;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("invalid frame: unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(u8),
    #[error("invalid frame: zero-sized {width}x{height}")]
    Empty { width: u32, height: u32 },
    #[error("invalid frame: buffer holds {actual} bytes, {width}x{height}x{channels} needs {expected}")]
    SizeMismatch {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },
    #[error("invalid frame: region {0:?} outside frame bounds")]
    RegionOutOfBounds(FaceRegion),
}

/// One captured frame, interleaved 8-bit samples (gray or RGB).
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
        captured_at: DateTime<Local>,
    ) -> Self {
        Self {
            width,
            height,
            channels,
            data,
            captured_at,
        }
    }

    /// Single-channel frame from an existing grayscale image.
    pub fn from_gray(image: &GrayImage, captured_at: DateTime<Local>) -> Self {
        Self::new(
            image.width(),
            image.height(),
            1,
            image.as_raw().clone(),
            captured_at,
        )
    }

    /// Check channel count and buffer size against the declared geometry.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.channels != 1 && self.channels != 3 {
            return Err(FrameError::UnsupportedChannels(self.channels));
        }
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        if self.data.len() != expected {
            return Err(FrameError::SizeMismatch {
                width: self.width,
                height: self.height,
                channels: self.channels,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Grayscale copy of the frame (ITU-R 601 luma for RGB input).
    pub fn to_gray(&self) -> Result<GrayImage, FrameError> {
        self.validate()?;
        let luma = match self.channels {
            1 => self.data.clone(),
            _ => self
                .data
                .chunks_exact(3)
                .map(|px| {
                    let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                    y.round().min(255.0) as u8
                })
                .collect(),
        };
        GrayImage::from_raw(self.width, self.height, luma).ok_or(FrameError::SizeMismatch {
            width: self.width,
            height: self.height,
            channels: 1,
            expected: self.width as usize * self.height as usize,
            actual: 0,
        })
    }
}

/// Cut a region out of a grayscale image.
pub fn crop_gray(gray: &GrayImage, region: &FaceRegion) -> Result<GrayImage, FrameError> {
    if !region.fits_within(gray.width(), gray.height()) {
        return Err(FrameError::RegionOutOfBounds(*region));
    }
    Ok(image::imageops::crop_imm(gray, region.x, region.y, region.width, region.height).to_image())
}
