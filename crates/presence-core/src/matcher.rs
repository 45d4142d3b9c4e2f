use image::GrayImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::lbph::LbphModel;
use crate::types::IdentityId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("appearance model unavailable")]
    ModelUnavailable,
    #[error("matcher fault: {0}")]
    Internal(String),
    #[error("match cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to open model {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid model: {0}")]
    Invalid(String),
}

/// Nearest enrolled identity for a face crop and its distance (lower is closer).
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub identity: IdentityId,
    pub distance: f32,
}

/// Pre-trained appearance model. Read-only, shared by all concurrent matches.
pub trait AppearanceModel: Send + Sync {
    fn predict(&self, face: &GrayImage) -> Result<Prediction, MatchError>;
    fn identities(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Set only when the nearest identity clears the acceptance cutoff.
    pub identity_id: Option<IdentityId>,
    /// Nearest identity regardless of cutoff, for the operator overlay.
    pub candidate: Option<IdentityId>,
    pub distance_score: f32,
    /// `100 − distance`, clamped to 0..=100.
    pub confidence: f32,
}

pub fn confidence_from_distance(distance: f32) -> f32 {
    (100.0 - distance).clamp(0.0, 100.0)
}

/// Maps face crops to enrolled identities.
///
/// Cloning is cheap; clones share the model.
#[derive(Clone)]
pub struct IdentityMatcher {
    model: Option<Arc<dyn AppearanceModel>>,
    cutoff: f32,
}

impl IdentityMatcher {
    pub fn new(model: Arc<dyn AppearanceModel>, cutoff: f32) -> Self {
        Self {
            model: Some(model),
            cutoff,
        }
    }

    /// A matcher with no model; every match fails with `ModelUnavailable`.
    pub fn unavailable(cutoff: f32) -> Self {
        Self {
            model: None,
            cutoff,
        }
    }

    /// Load an LBPH model file. A load failure is logged and yields an
    /// unavailable matcher rather than an error.
    pub fn load(path: &Path, cutoff: f32) -> Self {
        match LbphModel::load(path) {
            Ok(model) => {
                tracing::info!(
                    path = %path.display(),
                    identities = model.templates.len(),
                    "appearance model loaded"
                );
                Self::new(Arc::new(model), cutoff)
            }
            Err(e) => {
                tracing::warn!(error = %e, "appearance model unavailable; matches will be skipped");
                Self::unavailable(cutoff)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.model.as_ref().is_some_and(|m| m.identities() > 0)
    }

    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    pub fn match_face(&self, face: &GrayImage) -> Result<MatchResult, MatchError> {
        let model = self.model.as_ref().ok_or(MatchError::ModelUnavailable)?;
        let prediction = model.predict(face)?;
        let confidence = confidence_from_distance(prediction.distance);
        let accepted = confidence >= self.cutoff;
        Ok(MatchResult {
            identity_id: accepted.then(|| prediction.identity.clone()),
            candidate: Some(prediction.identity),
            distance_score: prediction.distance,
            confidence,
        })
    }
}
