//! Built-in analytic model: average-pool the frame into a coarse grid and project each cell's mean
//! color into SH as radiance arriving from that cell's view direction.
//! Deterministic and weight-free to ship; used by the debug tools and tests.

use std::f32::consts::PI;

use glam::Vec3;

use super::{Layer, Model, TensorShape};
use crate::error::{EstimatorError, Result};
use crate::sh::{self, OutputLayout, BANDS, CHANNELS, COEFFICIENT_COUNT};

impl Model {
    /// Two-layer model over a 2x2 grid. Output uses the interleaved layout.
    ///
    /// Tensor row 0 is treated as the bottom of the view (the preprocessor mirrors rows by
    /// default), +X is right and the camera looks down +Z.
    pub fn quadrant_projector(width: u32, height: u32) -> Result<Self> {
        let (w, h) = (width as usize, height as usize);
        if w < 2 || h < 2 {
            return Err(EstimatorError::Model(format!(
                "quadrant projector needs at least 2x2 input, got {w}x{h}"
            )));
        }
        let input = TensorShape::new(3, h, w);
        let kernel = [h / 2, w / 2];
        let pool = Layer::AvgPool2d { kernel, stride: kernel };
        let grid = pool.output_shape(input)?;
        let cells = grid.height * grid.width;
        let solid_angle = 4.0 * PI / cells as f32;

        let in_features = grid.len();
        let mut weights = vec![0.0f32; COEFFICIENT_COUNT * in_features];
        for gy in 0..grid.height {
            for gx in 0..grid.width {
                let u = (gx as f32 + 0.5) / grid.width as f32 * 2.0 - 1.0;
                let v = (gy as f32 + 0.5) / grid.height as f32 * 2.0 - 1.0;
                let y = sh::basis(Vec3::new(u, v, 1.0).normalize());
                for c in 0..CHANNELS {
                    let input_index = (c * grid.height + gy) * grid.width + gx;
                    for b in 0..BANDS {
                        let out = OutputLayout::Interleaved.flat_index(c, b);
                        weights[out * in_features + input_index] = y[b] * solid_angle;
                    }
                }
            }
        }
        let linear = Layer::Linear {
            in_features,
            out_features: COEFFICIENT_COUNT,
            weights,
            bias: Vec::new(),
        };
        Model::new(input, vec![pool, linear])
    }
}
