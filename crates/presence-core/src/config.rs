//! Pipeline tuning knobs.
//!
//! Every threshold here is a starting point, not a physical constant: they
//! were tuned by hand against a handful of webcams and should be re-validated
//! for each checkpoint's lighting and sensor.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum matcher confidence (0..100) for an identity to be accepted.
    pub accept_cutoff: f32,
    pub liveness: LivenessConfig,
    pub tracking: TrackingConfig,
    pub localizer: LocalizerConfig,
    pub matcher: MatcherConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            accept_cutoff: 50.0,
            liveness: LivenessConfig::default(),
            tracking: TrackingConfig::default(),
            localizer: LocalizerConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Verdict stays Pending until this much time has passed since track creation.
    pub check_duration_ms: u64,
    /// Signals that must have passed (out of 4) for a Live verdict.
    pub min_passed_signals: usize,
    /// Eye box height/width below which the eye counts as closed.
    pub blink_ratio: f32,
    /// Consecutive closed frames needed before a reopen counts as a blink.
    pub blink_closed_frames: u32,
    /// Centroid variance (px²) on either axis that counts as head movement.
    pub movement_variance: f32,
    /// Mean Laplacian variance of the face crop that counts as real skin texture.
    pub texture_variance: f32,
    /// Mean absolute frame difference (grey levels) that counts as micro-motion.
    pub motion_magnitude: f32,
    pub movement_capacity: usize,
    pub movement_min_samples: usize,
    pub texture_capacity: usize,
    pub texture_min_samples: usize,
    pub motion_capacity: usize,
    pub motion_min_samples: usize,
    /// Side length the face crop is resampled to before texture/motion analysis.
    pub analysis_size: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_duration_ms: 3_000,
            min_passed_signals: 3,
            blink_ratio: 0.25,
            blink_closed_frames: 2,
            movement_variance: 4.0,
            texture_variance: 80.0,
            motion_magnitude: 2.0,
            movement_capacity: 10,
            movement_min_samples: 5,
            texture_capacity: 5,
            texture_min_samples: 3,
            motion_capacity: 10,
            motion_min_samples: 5,
            analysis_size: 96,
        }
    }
}

impl LivenessConfig {
    pub fn check_duration(&self) -> Duration {
        Duration::from_millis(self.check_duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames a track may go unmatched before it is evicted.
    pub grace_frames: u32,
    /// A region within this centroid distance (px) of a track associates with it.
    pub max_centroid_distance: f32,
    /// A region overlapping a track by at least this IoU associates with it.
    pub min_iou: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            grace_frames: 5,
            max_centroid_distance: 80.0,
            min_iou: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_size: u32,
    pub max_size: Option<u32>,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: 48,
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Worker threads for identity matching. 0 runs matches inline on the frame thread.
    pub threads: usize,
    /// Time a frame may spend waiting on match results before deferring them.
    pub frame_budget_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            frame_budget_ms: 33,
        }
    }
}

impl MatcherConfig {
    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(self.frame_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.accept_cutoff, 50.0);
        assert_eq!(cfg.liveness.check_duration(), Duration::from_secs(3));
        assert_eq!(cfg.liveness.min_passed_signals, 3);
        assert_eq!(cfg.tracking.grace_frames, 5);
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{"accept_cutoff": 65.0, "liveness": {"check_duration_ms": 1500}}"#,
        )
        .unwrap();
        assert_eq!(cfg.accept_cutoff, 65.0);
        assert_eq!(cfg.liveness.check_duration_ms, 1500);
        assert_eq!(cfg.liveness.min_passed_signals, 3);
        assert_eq!(cfg.matcher.threads, 2);
    }
}
