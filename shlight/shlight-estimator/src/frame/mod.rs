//! Camera frame preprocessing: crop, resize, mirror and linearize the latest camera image into
//! a reused fixed-shape CHW tensor.
//!
//! The tensor is allocated once at construction. A frame that fails validation is skipped
//! before anything is written, so the previous tensor contents are never half-overwritten.

use light_api::{CameraSource, PixelFormat, RawImage};
use log::{trace, warn};

use crate::config::{EstimatorConfig, ResizeFilter};
use crate::error::{EstimatorError, Result};
use crate::model::TensorShape;

/// (1, 3, H, W) linear-color input tensor in CHW order, values in [0, 1].
#[derive(Clone, Debug)]
pub struct FrameTensor {
    width: usize,
    height: usize,
    data: Vec<f32>,
    ready: bool,
}

impl FrameTensor {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        Self { width, height, data: vec![0.0; 3 * width * height], ready: false }
    }

    /// Build a tensor from CHW data; length must be 3 * width * height.
    pub fn from_chw(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = 3 * width as usize * height as usize;
        if data.len() != expected {
            return Err(EstimatorError::Conversion(format!(
                "tensor data has {} values, expected {expected}",
                data.len()
            )));
        }
        Ok(Self { width: width as usize, height: height as usize, data, ready: true })
    }

    pub fn shape(&self) -> TensorShape {
        TensorShape::new(3, self.height, self.width)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// True once a full frame has been written.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[inline]
    pub fn get(&self, channel: usize, x: usize, y: usize) -> f32 {
        self.data[(channel * self.height + y) * self.width + x]
    }

    /// Mean of one channel; used by diagnostics and tests.
    pub fn channel_mean(&self, channel: usize) -> f32 {
        let plane = self.width * self.height;
        let sum: f64 =
            self.data[channel * plane..(channel + 1) * plane].iter().map(|&v| v as f64).sum();
        (sum / plane as f64) as f32
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn sample_lut(linearize: bool) -> [f32; 256] {
    let mut lut = [0.0f32; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        let c = i as f32 / 255.0;
        *v = if linearize { srgb_to_linear(c) } else { c };
    }
    lut
}

/// Source region sampled into the tensor, in source pixels.
#[derive(Clone, Copy, Debug)]
struct CropRect {
    x0: f32,
    y0: f32,
    w: f32,
    h: f32,
}

pub struct FramePreprocessor {
    camera: Box<dyn CameraSource>,
    tensor: FrameTensor,
    resize: ResizeFilter,
    mirror_y: bool,
    crop_to_aspect: bool,
    /// u8 sample -> [0, 1], linearized when configured.
    lut: [f32; 256],
    frames_converted: u64,
    frames_skipped: u64,
}

impl FramePreprocessor {
    pub fn new(camera: Box<dyn CameraSource>, config: &EstimatorConfig) -> Self {
        Self {
            camera,
            tensor: FrameTensor::new(config.target_width, config.target_height),
            resize: config.resize,
            mirror_y: config.mirror_y,
            crop_to_aspect: config.crop_to_aspect,
            lut: sample_lut(config.linearize),
            frames_converted: 0,
            frames_skipped: 0,
        }
    }

    /// Re-read the sampling options. The tensor resolution is fixed at construction.
    pub fn configure(&mut self, config: &EstimatorConfig) {
        self.resize = config.resize;
        self.mirror_y = config.mirror_y;
        self.crop_to_aspect = config.crop_to_aspect;
        self.lut = sample_lut(config.linearize);
    }

    /// Latest camera frame converted into the reused tensor, or None when no frame is
    /// available or it could not be converted.
    pub fn try_acquire_frame(&mut self) -> Option<&FrameTensor> {
        let image = self.camera.try_acquire_latest_frame()?;
        match self.convert(&image) {
            Ok(()) => Some(&self.tensor),
            Err(e) => {
                self.frames_skipped += 1;
                warn!("skipping camera frame: {e}");
                None
            }
        }
    }

    /// Convert `image` into the tensor. On error the tensor keeps its previous contents.
    pub fn convert(&mut self, image: &RawImage) -> Result<()> {
        validate_image(image)?;
        let crop = self.crop_rect(image);
        self.tensor.ready = false;
        let (tw, th) = (self.tensor.width, self.tensor.height);
        let plane = tw * th;
        for ty in 0..th {
            let src_row = if self.mirror_y { th - 1 - ty } else { ty };
            let sy = crop.y0 + (src_row as f32 + 0.5) * crop.h / th as f32 - 0.5;
            for tx in 0..tw {
                let sx = crop.x0 + (tx as f32 + 0.5) * crop.w / tw as f32 - 0.5;
                let rgb = match self.resize {
                    ResizeFilter::Nearest => self.sample_nearest(image, sx, sy),
                    ResizeFilter::Bilinear => self.sample_bilinear(image, sx, sy),
                };
                let i = ty * tw + tx;
                self.tensor.data[i] = rgb[0];
                self.tensor.data[plane + i] = rgb[1];
                self.tensor.data[2 * plane + i] = rgb[2];
            }
        }
        self.tensor.ready = true;
        self.frames_converted += 1;
        trace!(
            "converted {}x{} {:?} frame into {}x{} tensor",
            image.width, image.height, image.format, tw, th
        );
        Ok(())
    }

    pub fn tensor(&self) -> &FrameTensor {
        &self.tensor
    }

    pub fn frames_converted(&self) -> u64 {
        self.frames_converted
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    fn crop_rect(&self, image: &RawImage) -> CropRect {
        let (sw, sh) = (image.width as f32, image.height as f32);
        if !self.crop_to_aspect {
            return CropRect { x0: 0.0, y0: 0.0, w: sw, h: sh };
        }
        let target_aspect = self.tensor.width as f32 / self.tensor.height as f32;
        if sw / sh > target_aspect {
            let w = sh * target_aspect;
            CropRect { x0: (sw - w) * 0.5, y0: 0.0, w, h: sh }
        } else {
            let h = sw / target_aspect;
            CropRect { x0: 0.0, y0: (sh - h) * 0.5, w: sw, h }
        }
    }

    fn sample_nearest(&self, image: &RawImage, sx: f32, sy: f32) -> [f32; 3] {
        let x = (sx + 0.5).floor().clamp(0.0, (image.width - 1) as f32) as usize;
        let y = (sy + 0.5).floor().clamp(0.0, (image.height - 1) as f32) as usize;
        let p = fetch_rgb(image, x, y);
        [self.lut[p[0] as usize], self.lut[p[1] as usize], self.lut[p[2] as usize]]
    }

    fn sample_bilinear(&self, image: &RawImage, sx: f32, sy: f32) -> [f32; 3] {
        let max_x = (image.width - 1) as f32;
        let max_y = (image.height - 1) as f32;
        let sx = sx.clamp(0.0, max_x);
        let sy = sy.clamp(0.0, max_y);
        let x0 = sx.floor() as usize;
        let y0 = sy.floor() as usize;
        let x1 = (x0 + 1).min(image.width as usize - 1);
        let y1 = (y0 + 1).min(image.height as usize - 1);
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;
        let taps = [
            (fetch_rgb(image, x0, y0), (1.0 - fx) * (1.0 - fy)),
            (fetch_rgb(image, x1, y0), fx * (1.0 - fy)),
            (fetch_rgb(image, x0, y1), (1.0 - fx) * fy),
            (fetch_rgb(image, x1, y1), fx * fy),
        ];
        let mut out = [0.0f32; 3];
        for (p, w) in taps {
            for c in 0..3 {
                out[c] += self.lut[p[c] as usize] * w;
            }
        }
        out
    }
}

fn validate_image(image: &RawImage) -> Result<()> {
    if image.width == 0 || image.height == 0 {
        return Err(EstimatorError::Conversion("camera image has zero size".to_string()));
    }
    if image.format == PixelFormat::Nv12 && (image.width % 2 != 0 || image.height % 2 != 0) {
        return Err(EstimatorError::Conversion(format!(
            "NV12 image must have even dimensions, got {}x{}",
            image.width, image.height
        )));
    }
    let expected = image.format.byte_len(image.width, image.height);
    if image.data.len() < expected {
        return Err(EstimatorError::Conversion(format!(
            "{:?} image {}x{} needs {expected} bytes, got {}",
            image.format,
            image.width,
            image.height,
            image.data.len()
        )));
    }
    Ok(())
}

/// sRGB-encoded RGB bytes of pixel (x, y).
#[inline]
fn fetch_rgb(image: &RawImage, x: usize, y: usize) -> [u8; 3] {
    let w = image.width as usize;
    let d = &image.data;
    match image.format {
        PixelFormat::Rgba8 => {
            let i = (y * w + x) * 4;
            [d[i], d[i + 1], d[i + 2]]
        }
        PixelFormat::Bgra8 => {
            let i = (y * w + x) * 4;
            [d[i + 2], d[i + 1], d[i]]
        }
        PixelFormat::Rgb8 => {
            let i = (y * w + x) * 3;
            [d[i], d[i + 1], d[i + 2]]
        }
        PixelFormat::Gray8 => {
            let v = d[y * w + x];
            [v, v, v]
        }
        PixelFormat::Nv12 => {
            let luma = d[y * w + x] as f32;
            let uv = w * image.height as usize + (y / 2) * w + (x / 2) * 2;
            let u = d[uv] as f32 - 128.0;
            let v = d[uv + 1] as f32 - 128.0;
            // BT.601 full range
            let r = luma + 1.402 * v;
            let g = luma - 0.344_136 * u - 0.714_136 * v;
            let b = luma + 1.772 * u;
            [
                r.round().clamp(0.0, 255.0) as u8,
                g.round().clamp(0.0, 255.0) as u8,
                b.round().clamp(0.0, 255.0) as u8,
            ]
        }
    }
}
