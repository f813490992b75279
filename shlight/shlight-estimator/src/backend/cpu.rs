//! CPU reference backend: runs the model layer by layer on two preallocated ping-pong buffers.
//! Readback is modeled as a transfer that lands after a configurable number of polls.

use log::{debug, info};
use rayon::prelude::*;

use super::{ModelBackend, ReadbackCompletion};
use crate::error::{EstimatorError, Result};
use crate::frame::FrameTensor;
use crate::model::{Layer, Model, TensorShape};

struct PendingReadback {
    completion: ReadbackCompletion,
    output: Vec<f32>,
    polls_left: u32,
}

pub struct CpuBackend {
    model: Model,
    /// Ping-pong activations, each sized for the largest activation.
    buffers: [Vec<f32>; 2],
    current: usize,
    next_unit: usize,
    bound: bool,
    readback_latency: u32,
    pending: Option<PendingReadback>,
    disposed: bool,
}

impl CpuBackend {
    pub fn new(model: Model) -> Self {
        let len = model.max_activation_len();
        info!(
            "cpu backend: {} layers, input {:?}, {} floats per activation buffer",
            model.unit_count(),
            model.input_shape(),
            len
        );
        Self {
            model,
            buffers: [vec![0.0; len], vec![0.0; len]],
            current: 0,
            next_unit: 0,
            bound: false,
            readback_latency: 0,
            pending: None,
            disposed: false,
        }
    }

    /// Number of `poll_device` calls after `request_readback` before the copy lands.
    pub fn with_readback_latency(mut self, polls: u32) -> Self {
        self.readback_latency = polls;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn units_done(&self) -> usize {
        self.next_unit
    }

    pub fn has_pending_readback(&self) -> bool {
        self.pending.is_some()
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(EstimatorError::TornDown);
        }
        Ok(())
    }

    fn run_unit(&mut self, index: usize) {
        let layer = &self.model.layers()[index];
        let input = self.model.shape_before(index);
        let output = self.model.shape_after(index);
        let (first, second) = self.buffers.split_at_mut(1);
        let (src, dst) = if self.current == 0 {
            (&first[0][..input.len()], &mut second[0][..output.len()])
        } else {
            (&second[0][..input.len()], &mut first[0][..output.len()])
        };
        run_layer(layer, input, output, src, dst);
        self.current = 1 - self.current;
    }
}

impl ModelBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn input_shape(&self) -> TensorShape {
        self.model.input_shape()
    }

    fn total_units(&self) -> usize {
        self.model.unit_count()
    }

    fn bind_input(&mut self, input: &FrameTensor) -> Result<()> {
        self.check_live()?;
        if input.shape() != self.model.input_shape() {
            return Err(EstimatorError::Conversion(format!(
                "input tensor {:?} does not match model input {:?}",
                input.shape(),
                self.model.input_shape()
            )));
        }
        let data = input.as_slice();
        self.buffers[0][..data.len()].copy_from_slice(data);
        self.current = 0;
        self.next_unit = 0;
        self.bound = true;
        Ok(())
    }

    fn step(&mut self, budget: usize) -> Result<usize> {
        self.check_live()?;
        if !self.bound {
            return Err(EstimatorError::Backend("step called without a bound input".to_string()));
        }
        let end = (self.next_unit + budget).min(self.model.unit_count());
        let ran = end - self.next_unit;
        for index in self.next_unit..end {
            self.run_unit(index);
        }
        self.next_unit = end;
        Ok(ran)
    }

    fn request_readback(&mut self, completion: ReadbackCompletion) -> Result<()> {
        self.check_live()?;
        if !self.bound || self.next_unit < self.model.unit_count() {
            return Err(EstimatorError::Backend(format!(
                "readback requested after {}/{} units",
                self.next_unit,
                self.model.unit_count()
            )));
        }
        let output = self.buffers[self.current][..self.model.output_len()].to_vec();
        self.pending =
            Some(PendingReadback { completion, output, polls_left: self.readback_latency });
        self.bound = false;
        Ok(())
    }

    fn poll_device(&mut self) -> Result<()> {
        self.check_live()?;
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(());
        }
        if let Some(PendingReadback { completion, output, .. }) = self.pending.take() {
            let cycle = completion.cycle();
            if !completion.complete(Ok(output)) {
                debug!("cpu backend: readback for cycle {cycle} had no live owner");
            }
        }
        Ok(())
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.pending = None;
        self.buffers = [Vec::new(), Vec::new()];
        self.bound = false;
        self.disposed = true;
        debug!("cpu backend disposed");
    }
}

/// Run one layer from `src` (shape `input`) into `dst` (shape `output`).
pub(crate) fn run_layer(
    layer: &Layer,
    input: TensorShape,
    output: TensorShape,
    src: &[f32],
    dst: &mut [f32],
) {
    let in_plane = input.height * input.width;
    let out_plane = output.height * output.width;
    match layer {
        Layer::Conv2d { in_channels, kernel, stride, padding, weights, bias, .. } => {
            let (k, s, p) = (*kernel, *stride, *padding as isize);
            dst.par_chunks_mut(out_plane).enumerate().for_each(|(oc, plane)| {
                let b = bias.get(oc).copied().unwrap_or(0.0);
                for oy in 0..output.height {
                    for ox in 0..output.width {
                        let mut acc = b;
                        for ic in 0..*in_channels {
                            let w_base = (oc * in_channels + ic) * k * k;
                            let s_base = ic * in_plane;
                            for ky in 0..k {
                                let iy = (oy * s + ky) as isize - p;
                                if iy < 0 || iy >= input.height as isize {
                                    continue;
                                }
                                let row = s_base + iy as usize * input.width;
                                for kx in 0..k {
                                    let ix = (ox * s + kx) as isize - p;
                                    if ix < 0 || ix >= input.width as isize {
                                        continue;
                                    }
                                    acc += weights[w_base + ky * k + kx] * src[row + ix as usize];
                                }
                            }
                        }
                        plane[oy * output.width + ox] = acc;
                    }
                }
            });
        }
        Layer::BatchNorm { scale, shift } => {
            for c in 0..input.channels {
                let range = c * in_plane..(c + 1) * in_plane;
                for (d, s) in dst[range.clone()].iter_mut().zip(&src[range]) {
                    *d = s * scale[c] + shift[c];
                }
            }
        }
        Layer::Relu => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s.max(0.0);
            }
        }
        Layer::MaxPool2d { kernel, stride, padding } => {
            let p = *padding as isize;
            for c in 0..output.channels {
                for oy in 0..output.height {
                    for ox in 0..output.width {
                        let mut best = f32::NEG_INFINITY;
                        for ky in 0..*kernel {
                            let iy = (oy * stride + ky) as isize - p;
                            if iy < 0 || iy >= input.height as isize {
                                continue;
                            }
                            for kx in 0..*kernel {
                                let ix = (ox * stride + kx) as isize - p;
                                if ix < 0 || ix >= input.width as isize {
                                    continue;
                                }
                                let at = c * in_plane + iy as usize * input.width + ix as usize;
                                best = best.max(src[at]);
                            }
                        }
                        dst[c * out_plane + oy * output.width + ox] = best;
                    }
                }
            }
        }
        Layer::AvgPool2d { kernel, stride } => {
            let inv = 1.0 / (kernel[0] * kernel[1]) as f32;
            for c in 0..output.channels {
                for oy in 0..output.height {
                    for ox in 0..output.width {
                        let mut sum = 0.0f32;
                        for ky in 0..kernel[0] {
                            let row = c * in_plane + (oy * stride[0] + ky) * input.width;
                            for kx in 0..kernel[1] {
                                sum += src[row + ox * stride[1] + kx];
                            }
                        }
                        dst[c * out_plane + oy * output.width + ox] = sum * inv;
                    }
                }
            }
        }
        Layer::GlobalAvgPool => {
            for c in 0..input.channels {
                let sum: f32 = src[c * in_plane..(c + 1) * in_plane].iter().sum();
                dst[c] = sum / in_plane as f32;
            }
        }
        Layer::Linear { in_features, weights, bias, .. } => {
            let x = &src[..*in_features];
            dst.par_iter_mut().enumerate().for_each(|(o, out)| {
                let row = &weights[o * in_features..(o + 1) * in_features];
                let dot: f32 = row.iter().zip(x).map(|(w, v)| w * v).sum();
                *out = dot + bias.get(o).copied().unwrap_or(0.0);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReadbackMessage;
    use approx::assert_relative_eq;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn shape(c: usize, h: usize, w: usize) -> TensorShape {
        TensorShape::new(c, h, w)
    }

    #[test]
    fn conv_with_padding_sums_neighbourhood() {
        let conv = Layer::Conv2d {
            in_channels: 1,
            out_channels: 1,
            kernel: 3,
            stride: 1,
            padding: 1,
            weights: vec![1.0; 9],
            bias: vec![0.5],
        };
        let src = vec![1.0; 9];
        let mut dst = vec![0.0; 9];
        run_layer(&conv, shape(1, 3, 3), shape(1, 3, 3), &src, &mut dst);
        assert_eq!(dst[4], 9.5);
        assert_eq!(dst[0], 4.5);
    }

    #[test]
    fn max_pool_ignores_padding() {
        let pool = Layer::MaxPool2d { kernel: 3, stride: 2, padding: 1 };
        let src = vec![-1.0, -2.0, -3.0, -4.0];
        let mut dst = vec![0.0; 1];
        run_layer(&pool, shape(1, 2, 2), shape(1, 1, 1), &src, &mut dst);
        assert_eq!(dst[0], -1.0);
    }

    #[test]
    fn avg_pool_and_linear() {
        let pool = Layer::AvgPool2d { kernel: [1, 2], stride: [1, 2] };
        let src = vec![1.0, 3.0, 5.0, 7.0];
        let mut pooled = vec![0.0; 2];
        run_layer(&pool, shape(1, 2, 2), shape(1, 2, 1), &src, &mut pooled);
        assert_eq!(pooled, vec![2.0, 6.0]);

        let linear = Layer::Linear {
            in_features: 2,
            out_features: 2,
            weights: vec![1.0, 1.0, 0.5, 0.0],
            bias: vec![0.0, 1.0],
        };
        let mut out = vec![0.0; 2];
        run_layer(&linear, shape(1, 2, 1), shape(2, 1, 1), &pooled, &mut out);
        assert_eq!(out, vec![8.0, 2.0]);
    }

    #[test]
    fn batch_norm_and_relu() {
        let bn = Layer::BatchNorm { scale: vec![2.0, -1.0], shift: vec![0.0, 0.5] };
        let src = vec![1.0, 1.0];
        let mut dst = vec![0.0; 2];
        run_layer(&bn, shape(2, 1, 1), shape(2, 1, 1), &src, &mut dst);
        assert_eq!(dst, vec![2.0, -0.5]);
        let mut relu = vec![0.0; 2];
        run_layer(&Layer::Relu, shape(2, 1, 1), shape(2, 1, 1), &dst, &mut relu);
        assert_eq!(relu, vec![2.0, 0.0]);
    }

    #[test]
    fn steps_respect_budget_and_readback_waits_for_latency() {
        let model = Model::quadrant_projector(4, 4).unwrap();
        let mut backend = CpuBackend::new(model).with_readback_latency(2);
        let input = FrameTensor::from_chw(4, 4, vec![1.0; 48]).unwrap();
        backend.bind_input(&input).unwrap();
        assert_eq!(backend.step(1).unwrap(), 1);
        assert_eq!(backend.step(5).unwrap(), 1);
        assert_eq!(backend.step(5).unwrap(), 0);

        let owner = Arc::new(());
        let (tx, rx) = mpsc::channel::<ReadbackMessage>();
        backend.request_readback(ReadbackCompletion::new(1, &owner, tx)).unwrap();
        backend.poll_device().unwrap();
        backend.poll_device().unwrap();
        assert!(rx.try_recv().is_err());
        backend.poll_device().unwrap();
        let out = rx.try_recv().unwrap().result.unwrap();
        assert_eq!(out.len(), 27);
        // uniform white: band 0 of each channel evaluates back to 1
        assert_relative_eq!(out[0] * 0.282095, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn readback_before_pass_completes_is_rejected() {
        let mut backend = CpuBackend::new(Model::quadrant_projector(4, 4).unwrap());
        backend.bind_input(&FrameTensor::from_chw(4, 4, vec![0.0; 48]).unwrap()).unwrap();
        backend.step(1).unwrap();
        let owner = Arc::new(());
        let (tx, _rx) = mpsc::channel();
        assert!(backend.request_readback(ReadbackCompletion::new(1, &owner, tx)).is_err());
    }

    #[test]
    fn disposed_backend_refuses_work() {
        let mut backend = CpuBackend::new(Model::quadrant_projector(4, 4).unwrap());
        backend.dispose();
        backend.dispose();
        let input = FrameTensor::from_chw(4, 4, vec![0.0; 48]).unwrap();
        assert!(matches!(backend.bind_input(&input), Err(EstimatorError::TornDown)));
    }
}
