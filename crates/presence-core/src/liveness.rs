//! Passive multi-signal liveness detection.
//!
//! A printed photograph or a phone screen held in front of the camera differs
//! from a live face in four cheap-to-measure ways, each tracked in a bounded
//! per-track window:
//!
//! - **Blink** — eye openness (height/width of the detected eye boxes) dips
//!   below a threshold for a few frames and recovers. Frames where no eye box
//!   is found carry no blink evidence either way.
//! - **Movement** — the face centroid jitters; a rigidly held print does not.
//! - **Texture** — skin has fine detail (high Laplacian variance); prints and
//!   screens are flatter.
//! - **Motion** — consecutive crops of a live face differ by continuous
//!   micro-motion; a static image does not.
//!
//! A signal passes once its window has enough samples and its statistic
//! crosses the configured threshold; a pass latches for the rest of the track.
//! The verdict stays `Pending` until the check duration has elapsed since the
//! track was created, then resolves once to `Live` (enough signals passed) or
//! `Spoof` and never changes again.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs and static screen images.
//! - **Does not block:** video replay with natural motion, high-quality masks.
//!   This is a heuristic gate, not a certified presentation-attack detector.

use chrono::{DateTime, Local};
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::{s, Array2};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::cascade::{Cascade, DetectParams};
use crate::config::LivenessConfig;
use crate::frame::{crop_gray, FrameError};
use crate::localizer::LocalizerError;
use crate::ring::RingBuffer;
use crate::types::FaceRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalName {
    Blink,
    Movement,
    Texture,
    Motion,
}

impl SignalName {
    pub const ALL: [SignalName; 4] = [
        SignalName::Blink,
        SignalName::Movement,
        SignalName::Texture,
        SignalName::Motion,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LivenessStatus {
    Pending,
    Live,
    Spoof,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessVerdict {
    pub per_signal_pass: BTreeMap<SignalName, bool>,
    /// Share of passed signals, 0..=100.
    pub confidence: u8,
    pub status: LivenessStatus,
}

impl LivenessVerdict {
    pub fn passed_count(&self) -> usize {
        self.per_signal_pass.values().filter(|p| **p).count()
    }
}

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error(transparent)]
    InvalidFrame(#[from] FrameError),
    #[error("eye locator fault: {0}")]
    EyeLocator(#[from] LocalizerError),
    #[error("analysis fault: {0}")]
    Analysis(String),
}

/// Finds eye boxes inside a grayscale face crop, in crop coordinates.
pub trait EyeLocator: Send {
    fn locate_eyes(&self, face: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError>;
}

/// Eye locator backed by a Haar cascade, searching the upper half of the face.
pub struct CascadeEyeLocator {
    cascade: Cascade,
    params: DetectParams,
}

impl CascadeEyeLocator {
    pub fn new(cascade: Cascade) -> Self {
        Self {
            cascade,
            params: DetectParams {
                scale_factor: 1.1,
                min_neighbors: 2,
                min_size: 8,
                max_size: None,
            },
        }
    }
}

impl EyeLocator for CascadeEyeLocator {
    fn locate_eyes(&self, face: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError> {
        let upper = FaceRegion::new(0, 0, face.width(), (face.height() / 2).max(1));
        let band = crop_gray(face, &upper)?;
        Ok(self.cascade.detect_multi_scale(&band, &self.params))
    }
}

/// Counts blinks: `closed_frames` or more consecutive closed samples followed
/// by an open sample is one blink.
#[derive(Debug, Clone, Default)]
struct BlinkCounter {
    closed_run: u32,
    blinks: u32,
}

impl BlinkCounter {
    fn observe(&mut self, openness: f32, threshold: f32, closed_frames: u32) {
        if openness < threshold {
            self.closed_run += 1;
        } else {
            if self.closed_run >= closed_frames {
                self.blinks += 1;
            }
            self.closed_run = 0;
        }
    }
}

/// Bounded per-track signal history.
#[derive(Debug, Clone)]
pub struct SignalWindow {
    centroids: RingBuffer<(f32, f32)>,
    texture: RingBuffer<f32>,
    motion: RingBuffer<f32>,
    /// Previous resampled crop, for frame differencing.
    previous: Option<Array2<f32>>,
}

impl SignalWindow {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            centroids: RingBuffer::with_capacity(config.movement_capacity),
            texture: RingBuffer::with_capacity(config.texture_capacity),
            motion: RingBuffer::with_capacity(config.motion_capacity),
            previous: None,
        }
    }
}

/// Liveness state owned by one track.
#[derive(Debug, Clone)]
pub struct TrackLiveness {
    created_at: DateTime<Local>,
    window: SignalWindow,
    blinks: BlinkCounter,
    passed: [bool; 4],
    resolved: Option<LivenessVerdict>,
}

impl TrackLiveness {
    pub fn new(created_at: DateTime<Local>, config: &LivenessConfig) -> Self {
        Self {
            created_at,
            window: SignalWindow::new(config),
            blinks: BlinkCounter::default(),
            passed: [false; 4],
            resolved: None,
        }
    }

    pub fn status(&self) -> LivenessStatus {
        self.resolved
            .as_ref()
            .map_or(LivenessStatus::Pending, |v| v.status)
    }

    fn verdict(&self, status: LivenessStatus) -> LivenessVerdict {
        let per_signal_pass: BTreeMap<_, _> = SignalName::ALL
            .iter()
            .map(|s| (*s, self.passed[s.index()]))
            .collect();
        let passed = self.passed.iter().filter(|p| **p).count();
        LivenessVerdict {
            per_signal_pass,
            confidence: (100 * passed / SignalName::ALL.len()) as u8,
            status,
        }
    }
}

pub struct LivenessEvaluator {
    config: LivenessConfig,
    eyes: Box<dyn EyeLocator>,
}

impl LivenessEvaluator {
    pub fn new(config: LivenessConfig, eyes: Box<dyn EyeLocator>) -> Self {
        Self { config, eyes }
    }

    pub fn new_track(&self, created_at: DateTime<Local>) -> TrackLiveness {
        TrackLiveness::new(created_at, &self.config)
    }

    /// Feed one frame of a track and return the current verdict.
    ///
    /// Once the verdict has resolved it is returned unchanged and no further
    /// analysis is done for the track.
    pub fn update(
        &self,
        track: &mut TrackLiveness,
        region: &FaceRegion,
        gray: &GrayImage,
        at: DateTime<Local>,
    ) -> Result<LivenessVerdict, LivenessError> {
        if let Some(resolved) = &track.resolved {
            return Ok(resolved.clone());
        }

        let crop = crop_gray(gray, region)?;
        let cfg = &self.config;

        // Blink. A detector miss neither opens nor closes the eyes.
        if let Some(openness) = eye_openness(&self.eyes.locate_eyes(&crop)?) {
            track
                .blinks
                .observe(openness, cfg.blink_ratio, cfg.blink_closed_frames);
        }

        // Movement
        track.window.centroids.push(region.centroid());

        // Texture and motion share the resampled crop.
        let sample = resample(&crop, cfg.analysis_size)?;
        track.window.texture.push(laplacian_variance(&sample));
        if let Some(previous) = &track.window.previous {
            track.window.motion.push(mean_abs_diff(&sample, previous));
        }
        track.window.previous = Some(sample);

        let current = self.signals_passing(track);
        for (latched, now) in track.passed.iter_mut().zip(current) {
            *latched |= now;
        }

        let elapsed = (at - track.created_at).to_std().unwrap_or_default();
        if elapsed < cfg.check_duration() {
            let verdict = track.verdict(LivenessStatus::Pending);
            tracing::debug!(
                confidence = verdict.confidence,
                blinks = track.blinks.blinks,
                elapsed_ms = elapsed.as_millis() as u64,
                "liveness: collecting"
            );
            return Ok(verdict);
        }

        let mut verdict = track.verdict(LivenessStatus::Spoof);
        if verdict.passed_count() >= cfg.min_passed_signals {
            verdict.status = LivenessStatus::Live;
        }
        track.resolved = Some(verdict.clone());
        Ok(verdict)
    }

    fn signals_passing(&self, track: &TrackLiveness) -> [bool; 4] {
        let cfg = &self.config;
        let w = &track.window;

        let blink = track.blinks.blinks >= 1;
        let movement = w.centroids.len() >= cfg.movement_min_samples
            && w.centroids
                .variance_xy()
                .is_some_and(|(vx, vy)| vx > cfg.movement_variance || vy > cfg.movement_variance);
        let texture = w.texture.len() >= cfg.texture_min_samples
            && w.texture.mean().is_some_and(|m| m > cfg.texture_variance);
        let motion = w.motion.len() >= cfg.motion_min_samples
            && w.motion.mean().is_some_and(|m| m > cfg.motion_magnitude);

        let mut out = [false; 4];
        out[SignalName::Blink.index()] = blink;
        out[SignalName::Movement.index()] = movement;
        out[SignalName::Texture.index()] = texture;
        out[SignalName::Motion.index()] = motion;
        out
    }
}

/// Mean height/width of up to two eye boxes (largest first), `None` when no
/// eye was found.
fn eye_openness(eyes: &[FaceRegion]) -> Option<f32> {
    let mut eyes: Vec<&FaceRegion> = eyes.iter().filter(|e| e.width > 0).collect();
    if eyes.is_empty() {
        return None;
    }
    eyes.sort_by_key(|e| std::cmp::Reverse(e.area()));
    let eyes = &eyes[..eyes.len().min(2)];
    let sum: f32 = eyes.iter().map(|e| e.height as f32 / e.width as f32).sum();
    Some(sum / eyes.len() as f32)
}

fn resample(crop: &GrayImage, size: u32) -> Result<Array2<f32>, LivenessError> {
    let size = size.max(3);
    let resized = if crop.dimensions() == (size, size) {
        crop.clone()
    } else {
        image::imageops::resize(crop, size, size, FilterType::Triangle)
    };
    let values = resized.into_raw().into_iter().map(f32::from).collect();
    Array2::from_shape_vec((size as usize, size as usize), values)
        .map_err(|e| LivenessError::Analysis(e.to_string()))
}

/// Variance of the 4-neighbour Laplacian over the interior of `img`.
fn laplacian_variance(img: &Array2<f32>) -> f32 {
    let centre = img.slice(s![1..-1, 1..-1]);
    let lap = &img.slice(s![..-2, 1..-1])
        + &img.slice(s![2.., 1..-1])
        + &img.slice(s![1..-1, ..-2])
        + &img.slice(s![1..-1, 2..])
        - &centre.mapv(|v| 4.0 * v);
    lap.var(0.0)
}

fn mean_abs_diff(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    (a - b).mapv(f32::abs).mean().unwrap_or(0.0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::cell::Cell;

    /// Eye state for one scripted frame.
    #[derive(Clone, Copy)]
    pub(crate) enum Eye {
        Open,
        Closed,
        /// The detector finds nothing.
        Missed,
    }

    /// Eye locator that replays a script, one entry per call.
    pub(crate) struct ScriptedEyes {
        script: Vec<Eye>,
        calls: Cell<usize>,
    }

    impl ScriptedEyes {
        pub(crate) fn always_open() -> Self {
            Self::cycle(vec![Eye::Open])
        }

        /// Eyes closed for frames 3 and 4 of every 10.
        pub(crate) fn blinking() -> Self {
            Self::every_tenth(Eye::Closed)
        }

        /// Eyes open throughout, `state` on frames 3 and 4 of every 10.
        pub(crate) fn every_tenth(state: Eye) -> Self {
            Self::cycle(
                (0..10)
                    .map(|i| if i == 3 || i == 4 { state } else { Eye::Open })
                    .collect(),
            )
        }

        pub(crate) fn cycle(script: Vec<Eye>) -> Self {
            Self {
                script,
                calls: Cell::new(0),
            }
        }
    }

    impl EyeLocator for ScriptedEyes {
        fn locate_eyes(&self, _face: &GrayImage) -> Result<Vec<FaceRegion>, LocalizerError> {
            let i = self.calls.get();
            self.calls.set(i + 1);
            let h = match self.script[i % self.script.len()] {
                Eye::Open => 10,
                Eye::Closed => 2,
                Eye::Missed => return Ok(Vec::new()),
            };
            Ok(vec![FaceRegion::new(10, 10, 20, h), FaceRegion::new(50, 10, 20, h)])
        }
    }

    pub(crate) fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    pub(crate) fn at(frame: i64) -> DateTime<Local> {
        t0() + Duration::milliseconds(frame * 100)
    }

    pub(crate) fn flat_frame() -> GrayImage {
        GrayImage::from_pixel(320, 240, image::Luma([128]))
    }

    pub(crate) fn textured_frame() -> GrayImage {
        GrayImage::from_fn(320, 240, |x, y| {
            image::Luma([if (x / 4 + y / 4) % 2 == 0 { 40 } else { 220 }])
        })
    }

    /// Face region, jittered horizontally on odd frames when `jitter` is set.
    pub(crate) fn region(frame: i64, jitter: bool) -> FaceRegion {
        let dx = if jitter && frame % 2 == 1 { 6 } else { 0 };
        FaceRegion::new(100 + dx, 60, 96, 96)
    }

    fn run(
        evaluator: &LivenessEvaluator,
        frames: i64,
        gray: &GrayImage,
        jitter: bool,
    ) -> Vec<LivenessVerdict> {
        let mut track = evaluator.new_track(t0());
        (0..frames)
            .map(|i| {
                evaluator
                    .update(&mut track, &region(i, jitter), gray, at(i))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_blink_needs_consecutive_closed_frames() {
        let mut counter = BlinkCounter::default();
        for openness in [0.5, 0.1, 0.5] {
            counter.observe(openness, 0.25, 2);
        }
        assert_eq!(counter.blinks, 0);
        for openness in [0.1, 0.1, 0.5] {
            counter.observe(openness, 0.25, 2);
        }
        assert_eq!(counter.blinks, 1);
    }

    #[test]
    fn test_detector_misses_are_not_blinks() {
        let evaluator = LivenessEvaluator::new(
            LivenessConfig::default(),
            Box::new(ScriptedEyes::every_tenth(Eye::Missed)),
        );
        let mut track = evaluator.new_track(t0());
        let textured = textured_frame();
        let mut last = None;
        for i in 0..40 {
            last = Some(
                evaluator
                    .update(&mut track, &region(i, true), &textured, at(i))
                    .unwrap(),
            );
        }
        assert_eq!(track.blinks.blinks, 0);
        assert!(!last.unwrap().per_signal_pass[&SignalName::Blink]);
    }

    #[test]
    fn test_miss_inside_closed_run_still_counts_blink() {
        let evaluator = LivenessEvaluator::new(
            LivenessConfig::default(),
            Box::new(ScriptedEyes::cycle(vec![
                Eye::Open,
                Eye::Closed,
                Eye::Missed,
                Eye::Closed,
                Eye::Open,
            ])),
        );
        let mut track = evaluator.new_track(t0());
        for i in 0..5 {
            evaluator
                .update(&mut track, &region(i, false), &flat_frame(), at(i))
                .unwrap();
        }
        assert_eq!(track.blinks.blinks, 1);
    }

    #[test]
    fn test_cascade_eyes_searched_in_upper_half() {
        use crate::cascade::tests::{bright_centre_cascade, square_image};

        let locator = CascadeEyeLocator::new(bright_centre_cascade());
        let upper = square_image(96, FaceRegion::new(34, 8, 28, 28));
        let eyes = locator.locate_eyes(&upper).unwrap();
        assert!(!eyes.is_empty());
        for eye in &eyes {
            assert!(eye.y + eye.height <= 48, "eye {eye:?} below the band");
        }

        let lower = square_image(96, FaceRegion::new(34, 60, 28, 28));
        assert!(locator.locate_eyes(&lower).unwrap().is_empty());
    }

    #[test]
    fn test_eye_openness() {
        assert_eq!(eye_openness(&[]), None);
        let eyes = [FaceRegion::new(0, 0, 20, 10), FaceRegion::new(30, 0, 20, 6)];
        assert!((eye_openness(&eyes).unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_laplacian_flat_vs_textured() {
        let flat = Array2::from_elem((16, 16), 128.0f32);
        assert_eq!(laplacian_variance(&flat), 0.0);
        let checker = Array2::from_shape_fn((16, 16), |(y, x)| {
            if (x / 2 + y / 2) % 2 == 0 {
                0.0
            } else {
                255.0
            }
        });
        assert!(laplacian_variance(&checker) > 1000.0);
    }

    #[test]
    fn test_static_print_is_spoof() {
        let evaluator =
            LivenessEvaluator::new(LivenessConfig::default(), Box::new(ScriptedEyes::always_open()));
        let verdicts = run(&evaluator, 40, &flat_frame(), false);
        let last = verdicts.last().unwrap();
        assert_eq!(last.status, LivenessStatus::Spoof);
        assert_eq!(last.confidence, 0);
    }

    #[test]
    fn test_static_print_with_camera_jitter_is_spoof() {
        let evaluator =
            LivenessEvaluator::new(LivenessConfig::default(), Box::new(ScriptedEyes::always_open()));
        let verdicts = run(&evaluator, 40, &flat_frame(), true);
        let last = verdicts.last().unwrap();
        assert_eq!(last.status, LivenessStatus::Spoof);
        assert!(last.confidence <= 50);
        assert!(last.per_signal_pass[&SignalName::Movement]);
        assert!(!last.per_signal_pass[&SignalName::Texture]);
        assert!(!last.per_signal_pass[&SignalName::Motion]);
        assert!(!last.per_signal_pass[&SignalName::Blink]);
    }

    #[test]
    fn test_blink_movement_texture_is_live() {
        let evaluator =
            LivenessEvaluator::new(LivenessConfig::default(), Box::new(ScriptedEyes::blinking()));
        let verdicts = run(&evaluator, 40, &textured_frame(), true);
        let last = verdicts.last().unwrap();
        assert_eq!(last.status, LivenessStatus::Live);
        assert!(last.per_signal_pass[&SignalName::Blink]);
        assert!(last.per_signal_pass[&SignalName::Movement]);
        assert!(last.passed_count() >= 3);
    }

    #[test]
    fn test_blink_and_movement_meet_lowered_minimum() {
        let config = LivenessConfig {
            min_passed_signals: 2,
            ..LivenessConfig::default()
        };
        let evaluator = LivenessEvaluator::new(config, Box::new(ScriptedEyes::blinking()));
        let verdicts = run(&evaluator, 40, &flat_frame(), true);
        let last = verdicts.last().unwrap();
        assert_eq!(last.status, LivenessStatus::Live);
        assert_eq!(last.confidence, 50);
    }

    #[test]
    fn test_pending_until_check_duration() {
        let evaluator =
            LivenessEvaluator::new(LivenessConfig::default(), Box::new(ScriptedEyes::blinking()));
        let verdicts = run(&evaluator, 40, &textured_frame(), true);
        // Frame 29 is at 2.9 s, frame 30 at exactly 3.0 s.
        for (i, v) in verdicts.iter().enumerate() {
            if i < 30 {
                assert_eq!(v.status, LivenessStatus::Pending, "frame {i}");
            } else {
                assert_ne!(v.status, LivenessStatus::Pending, "frame {i}");
            }
        }
        assert!(verdicts[20].passed_count() >= 3);
    }

    #[test]
    fn test_verdict_never_reverts() {
        let evaluator =
            LivenessEvaluator::new(LivenessConfig::default(), Box::new(ScriptedEyes::blinking()));
        let mut track = evaluator.new_track(t0());
        let flat = flat_frame();
        let textured = textured_frame();
        // Static first: resolves to Spoof at 3 s.
        for i in 0..31 {
            evaluator.update(&mut track, &region(i, false), &flat, at(i)).unwrap();
        }
        assert_eq!(track.status(), LivenessStatus::Spoof);
        // Live-looking input afterwards must not flip the verdict.
        for i in 31..80 {
            let v = evaluator
                .update(&mut track, &region(i, true), &textured, at(i))
                .unwrap();
            assert_eq!(v.status, LivenessStatus::Spoof);
        }
    }

    #[test]
    fn test_region_outside_frame_is_invalid() {
        let evaluator =
            LivenessEvaluator::new(LivenessConfig::default(), Box::new(ScriptedEyes::always_open()));
        let mut track = evaluator.new_track(t0());
        let err = evaluator
            .update(&mut track, &FaceRegion::new(300, 200, 96, 96), &flat_frame(), t0())
            .unwrap_err();
        assert!(matches!(err, LivenessError::InvalidFrame(_)));
    }
}
