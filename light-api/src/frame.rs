//! Camera frame types handed from the host platform to the estimator.

/// Pixel layout of a [`RawImage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel: R, G, B, A.
    Rgba8,
    /// 4 bytes per pixel: B, G, R, A.
    Bgra8,
    /// 3 bytes per pixel: R, G, B.
    Rgb8,
    /// 1 byte per pixel, replicated into all three channels.
    Gray8,
    /// Full-resolution Y plane followed by a half-resolution interleaved UV plane.
    /// Width and height must be even.
    Nv12,
}

impl PixelFormat {
    /// Bytes a tightly packed image of this format occupies.
    pub fn byte_len(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => pixels * 4,
            PixelFormat::Rgb8 => pixels * 3,
            PixelFormat::Gray8 => pixels,
            PixelFormat::Nv12 => pixels + pixels / 2,
        }
    }
}

/// One camera image as delivered by the platform (arbitrary resolution, sRGB encoded).
#[derive(Clone, Debug)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Tightly packed rows, top row first.
    pub data: Vec<u8>,
}

impl RawImage {
    /// Solid-color RGBA8 image; handy for hosts without a camera and for tests.
    pub fn solid_rgba(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(PixelFormat::Rgba8.byte_len(width, height));
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgba);
        }
        Self { width, height, format: PixelFormat::Rgba8, data }
    }
}

/// Non-blocking source of the most recent camera image.
pub trait CameraSource: Send {
    /// Latest frame, or None if no new frame is available this tick (normal, not an error).
    fn try_acquire_latest_frame(&mut self) -> Option<RawImage>;
}
