//! Local Binary Pattern Histogram appearance model.
//!
//! Each face crop is resampled to a fixed square, every interior pixel is
//! encoded as an 8-bit pattern of which neighbours are at least as bright as
//! the centre, and the pattern codes are histogrammed per cell of a
//! `grid × grid` layout. Two faces are compared with the symmetric chi-square
//! distance `Σ 2(p − q)² / (p + q)` summed over every bin of every cell.
//! Identical crops score 0; each cell contributes at most 4, so the distance
//! is not bounded by 100 and the matcher's confidence clamps at 0.

use image::imageops::FilterType;
use image::GrayImage;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::matcher::{AppearanceModel, MatchError, ModelError, Prediction};
use crate::types::IdentityId;

const BINS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub identity: IdentityId,
    pub histogram: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    pub input_size: u32,
    pub grid: u32,
    pub templates: Vec<Template>,
}

impl LbphModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let file = File::open(path).map_err(|source| ModelError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let model: LbphModel =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ModelError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.grid == 0 || self.input_size < self.grid * 3 {
            return Err(ModelError::Invalid(format!(
                "input size {} too small for {}x{} grid",
                self.input_size, self.grid, self.grid
            )));
        }
        let expected = self.histogram_len();
        if let Some(t) = self.templates.iter().find(|t| t.histogram.len() != expected) {
            return Err(ModelError::Invalid(format!(
                "template for {} has {} bins, expected {expected}",
                t.identity,
                t.histogram.len()
            )));
        }
        Ok(())
    }

    /// Build a model from labelled reference crops.
    pub fn from_references(
        input_size: u32,
        grid: u32,
        references: &[(IdentityId, GrayImage)],
    ) -> Self {
        let mut model = Self {
            input_size,
            grid,
            templates: Vec::with_capacity(references.len()),
        };
        for (identity, face) in references {
            let histogram = model.describe(face).to_vec();
            model.templates.push(Template {
                identity: identity.clone(),
                histogram,
            });
        }
        model
    }

    fn histogram_len(&self) -> usize {
        (self.grid * self.grid) as usize * BINS
    }

    /// Concatenated per-cell LBP histograms, each cell normalized to sum 1.
    fn describe(&self, face: &GrayImage) -> Array1<f32> {
        let n = self.input_size;
        let resized = if face.dimensions() == (n, n) {
            face.clone()
        } else {
            image::imageops::resize(face, n, n, FilterType::Triangle)
        };
        let codes = lbp_codes(&resized);
        let (rows, cols) = codes.dim();
        let grid = self.grid as usize;
        let mut hist = Array2::<f32>::zeros((grid * grid, BINS));

        for ((y, x), &code) in codes.indexed_iter() {
            let cell = (y * grid / rows) * grid + (x * grid / cols);
            hist[[cell, code as usize]] += 1.0;
        }
        for mut row in hist.axis_iter_mut(Axis(0)) {
            let total = row.sum();
            if total > 0.0 {
                row /= total;
            }
        }
        hist.into_shape_with_order(grid * grid * BINS)
            .unwrap_or_else(|_| Array1::zeros(grid * grid * BINS))
    }

    fn distance(&self, a: &Array1<f32>, b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(&p, &q)| {
                let s = p + q;
                if s > f32::EPSILON {
                    2.0 * (p - q) * (p - q) / s
                } else {
                    0.0
                }
            })
            .sum()
    }
}

impl AppearanceModel for LbphModel {
    fn predict(&self, face: &GrayImage) -> Result<Prediction, MatchError> {
        if self.templates.is_empty() {
            return Err(MatchError::ModelUnavailable);
        }
        let query = self.describe(face);
        self.templates
            .iter()
            .map(|t| (t, self.distance(&query, &t.histogram)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, distance)| Prediction {
                identity: t.identity.clone(),
                distance,
            })
            .ok_or(MatchError::ModelUnavailable)
    }

    fn identities(&self) -> usize {
        self.templates.len()
    }
}

/// 3×3 LBP codes for the interior pixels of `img`.
fn lbp_codes(img: &GrayImage) -> Array2<u8> {
    let (w, h) = img.dimensions();
    let (w, h) = (w as usize, h as usize);
    const OFFSETS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];
    Array2::from_shape_fn((h - 2, w - 2), |(y, x)| {
        let (cx, cy) = (x as i32 + 1, y as i32 + 1);
        let centre = img.get_pixel(cx as u32, cy as u32)[0];
        OFFSETS
            .iter()
            .enumerate()
            .fold(0u8, |code, (bit, (dx, dy))| {
                let v = img.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0];
                if v >= centre {
                    code | (1 << bit)
                } else {
                    code
                }
            })
    })
}
