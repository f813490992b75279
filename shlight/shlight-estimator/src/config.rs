//! Estimator configuration: tensor resolution, scheduling quota, filtering and light mapping.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EstimatorError, Result};
use crate::sh::OutputLayout;

/// Temporal aggregation policy for the SH history.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FilterMode {
    /// Per-cell mean after discarding `trim` lowest and `trim` highest values.
    TrimmedMean { trim: usize },
    /// Exponential blend toward the newest sample; `new_weight` in [0, 1].
    Blend { new_weight: f32 },
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::TrimmedMean { trim: 2 }
    }
}

/// Which way the directional light points relative to the SH first-order vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightDirectionConvention {
    /// First-order vector points at the light source; the light travels along its negation.
    #[default]
    TowardSource,
    /// Light travels along the first-order vector itself.
    Raw,
}

/// Camera image resampling filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Bilinear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Tensor width fed to the model.
    pub target_width: u32,
    /// Tensor height fed to the model.
    pub target_height: u32,
    /// Model layers scheduled per render tick.
    pub layers_per_tick: usize,
    /// SH history window.
    pub history_size: usize,
    pub filter: FilterMode,
    /// Scales the dominant light intensity.
    pub light_intensity_multiplier: f32,
    /// Intensity installed with the ambient probe.
    pub ambient_intensity: f32,
    /// Value of every cell in the neutral history seed.
    pub seed_value: f32,
    pub output_layout: OutputLayout,
    pub direction_convention: LightDirectionConvention,
    pub resize: ResizeFilter,
    /// Flip rows to match sensor vs. texture orientation.
    pub mirror_y: bool,
    /// Convert sRGB camera samples to linear before packing.
    pub linearize: bool,
    /// Center-crop to the target aspect before resizing instead of stretching.
    pub crop_to_aspect: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            target_width: 640,
            target_height: 512,
            layers_per_tick: 20,
            history_size: 5,
            filter: FilterMode::default(),
            light_intensity_multiplier: 1.0,
            ambient_intensity: 1.0,
            seed_value: 0.5,
            output_layout: OutputLayout::default(),
            direction_convention: LightDirectionConvention::default(),
            resize: ResizeFilter::default(),
            mirror_y: true,
            linearize: true,
            crop_to_aspect: false,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(EstimatorError::Misconfiguration(msg));
        if self.target_width == 0 || self.target_height == 0 {
            return bad(format!(
                "target resolution must be non-zero, got {}x{}",
                self.target_width, self.target_height
            ));
        }
        if self.history_size == 0 {
            return bad("history_size must be at least 1".to_string());
        }
        if let FilterMode::Blend { new_weight } = self.filter {
            if !(0.0..=1.0).contains(&new_weight) {
                return bad(format!("blend new_weight must be in [0, 1], got {new_weight}"));
            }
        }
        for (name, v) in [
            ("light_intensity_multiplier", self.light_intensity_multiplier),
            ("ambient_intensity", self.ambient_intensity),
        ] {
            if !v.is_finite() || v < 0.0 {
                return bad(format!("{name} must be finite and non-negative, got {v}"));
            }
        }
        if !self.seed_value.is_finite() {
            return bad("seed_value must be finite".to_string());
        }
        Ok(())
    }

    /// Effective per-tick quota; zero still makes progress.
    pub fn quota(&self) -> usize {
        self.layers_per_tick.max(1)
    }
}

/// Load and validate a JSON config. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<EstimatorConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|source| EstimatorError::Io { path: path.to_path_buf(), source })?;
    let config: EstimatorConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EstimatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.filter, FilterMode::TrimmedMean { trim: 2 });
        assert_eq!((config.target_width, config.target_height), (640, 512));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EstimatorConfig = serde_json::from_str(
            r#"{ "history_size": 7, "filter": { "mode": "blend", "new_weight": 0.2 } }"#,
        )
        .unwrap();
        assert_eq!(config.history_size, 7);
        assert_eq!(config.filter, FilterMode::Blend { new_weight: 0.2 });
        assert_eq!(config.layers_per_tick, 20);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = EstimatorConfig { history_size: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(EstimatorError::Misconfiguration(_))));
        config.history_size = 5;
        config.filter = FilterMode::Blend { new_weight: 1.5 };
        assert!(config.validate().is_err());
        config.filter = FilterMode::default();
        config.light_intensity_multiplier = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/shlight.json")).unwrap_err();
        assert!(matches!(err, EstimatorError::Io { .. }));
    }
}
