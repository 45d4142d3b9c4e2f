use image::GrayImage;
use std::path::Path;
use thiserror::Error;

use crate::cascade::{Cascade, CascadeError, DetectParams};
use crate::config::LocalizerConfig;
use crate::frame::{Frame, FrameError};
use crate::types::FaceRegion;

#[derive(Error, Debug)]
pub enum LocalizerError {
    #[error(transparent)]
    InvalidFrame(#[from] FrameError),
    #[error("detector fault: {0}")]
    Internal(String),
}

/// Finds face bounding boxes in a single frame.
///
/// Implementations hold no per-frame memory; an empty result is a normal
/// outcome, not an error.
pub trait FaceLocalizer: Send {
    /// Locate faces in a frame already converted to grayscale.
    fn locate_gray(&self, gray: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError>;

    fn locate(&self, frame: &Frame) -> Result<Vec<FaceRegion>, LocalizerError> {
        self.locate_gray(&frame.to_gray()?)
    }
}

/// Face localizer backed by a boosted Haar cascade.
pub struct CascadeLocalizer {
    cascade: Cascade,
    params: DetectParams,
}

impl CascadeLocalizer {
    pub fn new(cascade: Cascade, config: &LocalizerConfig) -> Self {
        Self {
            cascade,
            params: DetectParams {
                scale_factor: config.scale_factor,
                min_neighbors: config.min_neighbors,
                min_size: config.min_size,
                max_size: config.max_size,
            },
        }
    }

    pub fn load(path: &Path, config: &LocalizerConfig) -> Result<Self, CascadeError> {
        let cascade = Cascade::load(path)?;
        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            window = ?(cascade.window_width, cascade.window_height),
            "face cascade loaded"
        );
        Ok(Self::new(cascade, config))
    }
}

impl FaceLocalizer for CascadeLocalizer {
    fn locate_gray(&self, gray: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError> {
        Ok(self
            .cascade
            .detect_multi_scale(gray, &self.params)
            .into_iter()
            .filter_map(|r| r.clamp_to(gray.width(), gray.height()))
            .collect())
    }
}
