//! SH L2 sample: 3 color channels x 9 band coefficients.
//!
//! Band order follows the real SH basis used by the training pipeline:
//! 0 = L00, 1 = L1-1 (y), 2 = L10 (z), 3 = L11 (x),
//! 4 = xy, 5 = yz, 6 = 3z^2 - 1, 7 = xz, 8 = x^2 - y^2.

use std::ops::{Index, IndexMut};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{EstimatorError, Result};

pub const CHANNELS: usize = 3;
pub const BANDS: usize = 9;
pub const COEFFICIENT_COUNT: usize = CHANNELS * BANDS;

/// Rec. 709 luminance weights (R, G, B).
pub const LUMINANCE: [f32; 3] = [0.2126, 0.7152, 0.0722];

const Y00: f32 = 0.282095;
const Y1: f32 = 0.488603;
const Y2_A: f32 = 1.092548;
const Y2_B: f32 = 0.315392;
const Y2_C: f32 = 0.546274;
/// Directional light normalization (16 * pi / 17).
const DIRECTIONAL_NORMALIZATION: f32 = 2.956_793;

/// How a flat 27-float model output maps onto (channel, band).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `flat[band * 3 + channel]`; the training code flattens `[9, 3]`.
    #[default]
    Interleaved,
    /// `flat[channel * 9 + band]`.
    ChannelMajor,
}

impl OutputLayout {
    #[inline]
    pub fn flat_index(&self, channel: usize, band: usize) -> usize {
        match self {
            OutputLayout::Interleaved => band * CHANNELS + channel,
            OutputLayout::ChannelMajor => channel * BANDS + band,
        }
    }
}

/// Real SH basis evaluated at a unit direction.
pub fn basis(dir: Vec3) -> [f32; BANDS] {
    let (x, y, z) = (dir.x, dir.y, dir.z);
    [
        Y00,
        Y1 * y,
        Y1 * z,
        Y1 * x,
        Y2_A * x * y,
        Y2_A * y * z,
        Y2_B * (3.0 * z * z - 1.0),
        Y2_A * x * z,
        Y2_C * (x * x - y * y),
    ]
}

/// One spherical-harmonics L2 sample; `coefficients[channel][band]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShBuffer {
    pub coefficients: [[f32; BANDS]; CHANNELS],
}

impl ShBuffer {
    pub const ZERO: Self = Self { coefficients: [[0.0; BANDS]; CHANNELS] };

    /// Every cell set to `value`.
    pub fn splat(value: f32) -> Self {
        Self { coefficients: [[value; BANDS]; CHANNELS] }
    }

    pub fn from_array(coefficients: [[f32; BANDS]; CHANNELS]) -> Self {
        Self { coefficients }
    }

    pub fn to_array(&self) -> [[f32; BANDS]; CHANNELS] {
        self.coefficients
    }

    /// Reshape a raw model output. Length must be exactly 27.
    pub fn from_flat(flat: &[f32], layout: OutputLayout) -> Result<Self> {
        if flat.len() != COEFFICIENT_COUNT {
            return Err(EstimatorError::Conversion(format!(
                "model output has {} values, expected {COEFFICIENT_COUNT}",
                flat.len()
            )));
        }
        let mut sh = Self::ZERO;
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                sh.coefficients[c][b] = flat[layout.flat_index(c, b)];
            }
        }
        Ok(sh)
    }

    /// Inverse of [`from_flat`](Self::from_flat).
    pub fn to_flat(&self, layout: OutputLayout) -> [f32; COEFFICIENT_COUNT] {
        let mut flat = [0.0; COEFFICIENT_COUNT];
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                flat[layout.flat_index(c, b)] = self.coefficients[c][b];
            }
        }
        flat
    }

    pub fn cells(&self) -> impl Iterator<Item = f32> + '_ {
        self.coefficients.iter().flat_map(|ch| ch.iter().copied())
    }

    pub fn is_finite(&self) -> bool {
        self.cells().all(f32::is_finite)
    }

    pub fn add(&mut self, other: &ShBuffer) {
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                self.coefficients[c][b] += other.coefficients[c][b];
            }
        }
    }

    pub fn sub(&mut self, other: &ShBuffer) {
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                self.coefficients[c][b] -= other.coefficients[c][b];
            }
        }
    }

    pub fn scale(&mut self, s: f32) {
        for ch in &mut self.coefficients {
            for v in ch {
                *v *= s;
            }
        }
    }

    /// `self + (other - self) * t`, per cell.
    pub fn lerp(&self, other: &ShBuffer, t: f32) -> ShBuffer {
        let mut out = *self;
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                let a = self.coefficients[c][b];
                out.coefficients[c][b] = a + (other.coefficients[c][b] - a) * t;
            }
        }
        out
    }

    /// Linear RGB value of the SH function in direction `dir` (normalized internally).
    pub fn evaluate(&self, dir: Vec3) -> Vec3 {
        let y = basis(dir.normalize_or_zero());
        let mut rgb = [0.0f32; CHANNELS];
        for (c, out) in rgb.iter_mut().enumerate() {
            *out = self.coefficients[c].iter().zip(y.iter()).map(|(k, b)| k * b).sum();
        }
        Vec3::from_array(rgb)
    }

    /// Accumulate the signature of a directional light arriving from `dir`.
    pub fn add_directional_light(&mut self, dir: Vec3, color: Vec3, intensity: f32) {
        let y = basis(dir.normalize_or_zero());
        let scaled = color * (intensity * DIRECTIONAL_NORMALIZATION);
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                self.coefficients[c][b] += y[b] * scaled[c];
            }
        }
    }

    /// Add a constant term so [`evaluate`](Self::evaluate) grows by `color` in every direction.
    pub fn add_ambient_light(&mut self, color: Vec3) {
        for c in 0..CHANNELS {
            self.coefficients[c][0] += color[c] / Y00;
        }
    }

    /// First-order bands of one channel as (x, y, z) = bands (3, 1, 2).
    pub fn first_order(&self, channel: usize) -> Vec3 {
        let k = &self.coefficients[channel];
        Vec3::new(k[3], k[1], k[2])
    }

    /// Luminance-weighted first-order vector; points toward the brightest direction.
    pub fn luminance_vector(&self) -> Vec3 {
        (0..CHANNELS).map(|c| self.first_order(c) * LUMINANCE[c]).sum()
    }
}

impl Index<(usize, usize)> for ShBuffer {
    type Output = f32;
    fn index(&self, (channel, band): (usize, usize)) -> &f32 {
        &self.coefficients[channel][band]
    }
}

impl IndexMut<(usize, usize)> for ShBuffer {
    fn index_mut(&mut self, (channel, band): (usize, usize)) -> &mut f32 {
        &mut self.coefficients[channel][band]
    }
}
