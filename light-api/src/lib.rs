//! Shared light estimation API for shlight.
//! Defines the camera frame source, the lighting sink the estimator writes into, and the
//! LightEstimator trait so the host can drive any estimator implementation with the same code path.

mod estimator;
mod frame;
mod sink;

pub use estimator::LightEstimator;
pub use frame::{CameraSource, PixelFormat, RawImage};
pub use sink::{AmbientMode, AmbientProbe, DirectionalLight, ExtractedLighting, LightingSink};
