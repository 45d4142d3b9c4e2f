//! Boosted cascade of Haar-like features.
//!
//! A cascade is a list of stages; each stage sums the votes of its weak
//! classifiers and rejects the window early if the sum falls below the stage
//! threshold. Features are weighted rectangle means evaluated on an integral
//! image and normalized by the window's standard deviation, so detection is
//! insensitive to global brightness and contrast.
//!
//! Cascades are trained offline and shipped as JSON.

use image::GrayImage;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::FaceRegion;

/// Below this window standard deviation (on a 0..1 scale) a window is treated as flat.
const MIN_WINDOW_STD: f64 = 1.0 / 255.0;
/// Relative size tolerance when grouping overlapping detections.
const GROUP_EPS: f32 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("failed to open cascade {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse cascade {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<WeightedRect>,
    pub threshold: f32,
    /// Vote when the feature value is below `threshold`.
    pub below: f32,
    /// Vote when the feature value is at or above `threshold`.
    pub above: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

/// Multi-scale search parameters.
#[derive(Debug, Clone, Copy)]
pub struct DetectParams {
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_size: u32,
    pub max_size: Option<u32>,
}

impl Cascade {
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        let file = File::open(path).map_err(|source| CascadeError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let cascade: Cascade =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| CascadeError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        cascade.validate()?;
        Ok(cascade)
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(CascadeError::Invalid("zero-sized window".into()));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("no stages".into()));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Invalid(format!("stage {i} has no classifiers")));
            }
            for rect in stage.classifiers.iter().flat_map(|c| &c.rects) {
                if rect.width == 0
                    || rect.height == 0
                    || rect.x + rect.width > self.window_width
                    || rect.y + rect.height > self.window_height
                {
                    return Err(CascadeError::Invalid(format!(
                        "stage {i}: rect {rect:?} outside {}x{} window",
                        self.window_width, self.window_height
                    )));
                }
            }
        }
        Ok(())
    }

    /// Slide the cascade over `gray` at every scale and group the hits.
    pub fn detect_multi_scale(&self, gray: &GrayImage, params: &DetectParams) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        let integral = IntegralImage::new(gray);
        let scale_factor = params.scale_factor.max(1.01);

        let mut hits = Vec::new();
        let mut scale = 1.0f32;
        loop {
            let win_w = (self.window_width as f32 * scale).round() as u32;
            let win_h = (self.window_height as f32 * scale).round() as u32;
            if win_w > width || win_h > height {
                break;
            }
            if params.max_size.is_some_and(|max| win_w > max || win_h > max) {
                break;
            }
            if win_w >= params.min_size && win_h >= params.min_size {
                let step = (scale.round() as usize).max(2);
                for y in (0..=height - win_h).step_by(step) {
                    for x in (0..=width - win_w).step_by(step) {
                        let window = FaceRegion::new(x, y, win_w, win_h);
                        if self.accepts(&integral, &window, scale) {
                            hits.push(window);
                        }
                    }
                }
            }
            scale *= scale_factor;
        }

        group_rectangles(hits, params.min_neighbors)
    }

    fn accepts(&self, integral: &IntegralImage, window: &FaceRegion, scale: f32) -> bool {
        let area = window.area() as f64;
        let mean = integral.sum(window) / area;
        let variance = integral.sq_sum(window) / area - mean * mean;
        let norm = variance.max(0.0).sqrt().max(MIN_WINDOW_STD);

        self.stages.iter().all(|stage| {
            let votes: f32 = stage
                .classifiers
                .iter()
                .map(|weak| {
                    let value = feature_value(integral, window, scale, &weak.rects) / norm;
                    if (value as f32) < weak.threshold {
                        weak.below
                    } else {
                        weak.above
                    }
                })
                .sum();
            votes >= stage.threshold
        })
    }
}

fn feature_value(
    integral: &IntegralImage,
    window: &FaceRegion,
    scale: f32,
    rects: &[WeightedRect],
) -> f64 {
    rects
        .iter()
        .map(|r| {
            let x = ((r.x as f32 * scale).round() as u32).min(window.width - 1);
            let y = ((r.y as f32 * scale).round() as u32).min(window.height - 1);
            let w = ((r.width as f32 * scale).round() as u32).clamp(1, window.width - x);
            let h = ((r.height as f32 * scale).round() as u32).clamp(1, window.height - y);
            let scaled = FaceRegion::new(window.x + x, window.y + y, w, h);
            r.weight as f64 * integral.sum(&scaled) / scaled.area() as f64
        })
        .sum()
}

/// Summed-area tables of pixel values (scaled to 0..1) and their squares.
struct IntegralImage {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = gray.get_pixel(x as u32, y as u32)[0] as f64 / 255.0;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn sum(&self, r: &FaceRegion) -> f64 {
        Self::lookup(&self.sum, self.stride, r)
    }

    fn sq_sum(&self, r: &FaceRegion) -> f64 {
        Self::lookup(&self.sq, self.stride, r)
    }

    fn lookup(table: &[f64], stride: usize, r: &FaceRegion) -> f64 {
        let (x0, y0) = (r.x as usize, r.y as usize);
        let (x1, y1) = (x0 + r.width as usize, y0 + r.height as usize);
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    }
}

fn similar(a: &FaceRegion, b: &FaceRegion) -> bool {
    let delta = GROUP_EPS * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Cluster similar rectangles and keep clusters with more than `min_neighbors` members,
/// each replaced by its average rectangle. `min_neighbors == 0` returns the raw hits.
fn group_rectangles(hits: Vec<FaceRegion>, min_neighbors: u32) -> Vec<FaceRegion> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits;
    }

    let mut parent: Vec<usize> = (0..hits.len()).collect();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j]) {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut clusters: std::collections::BTreeMap<usize, (u64, u64, u64, u64, u32)> =
        std::collections::BTreeMap::new();
    for (i, hit) in hits.iter().enumerate() {
        let r = root(&mut parent, i);
        let entry = clusters.entry(r).or_default();
        entry.0 += hit.x as u64;
        entry.1 += hit.y as u64;
        entry.2 += hit.width as u64;
        entry.3 += hit.height as u64;
        entry.4 += 1;
    }

    clusters
        .into_values()
        .filter(|c| c.4 > min_neighbors)
        .map(|(x, y, w, h, n)| {
            let n = n as u64;
            FaceRegion::new((x / n) as u32, (y / n) as u32, (w / n) as u32, (h / n) as u32)
        })
        .collect()
}
