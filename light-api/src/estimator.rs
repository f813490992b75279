//! Trait for light estimators. Host calls tick once per render frame and reads the extracted
//! lighting.

use crate::ExtractedLighting;

/// Light estimator that the host can drive regardless of how estimation is implemented.
pub trait LightEstimator: Send {
    /// Advance the estimator by one render tick. Must not block.
    fn tick(&mut self) -> Result<(), String>;

    /// False once the estimator disabled itself (misconfiguration or device failure).
    /// Lighting keeps its last applied values.
    fn is_active(&self) -> bool;

    /// Latest ambient probe and directional light.
    fn lighting(&self) -> &ExtractedLighting;
}
