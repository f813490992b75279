//! Drives the host lighting from a filtered SH sample: installs the ambient probe and derives a
//! single dominant directional light from the first-order bands.

use glam::{Mat3, Quat, Vec3};
use light_api::{AmbientMode, AmbientProbe, DirectionalLight, LightingSink};
use log::trace;

use crate::config::{EstimatorConfig, LightDirectionConvention};
use crate::sh::ShBuffer;

/// Below this squared length the first-order vector carries no usable direction.
const MIN_DIRECTION_LENGTH_SQ: f32 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DominantLight {
    /// Unit vector toward the brightest part of the SH sphere.
    pub source_direction: Vec3,
    /// Direction the light travels.
    pub forward: Vec3,
    pub rotation: Quat,
    /// Non-negative linear RGB.
    pub color: Vec3,
    pub intensity: f32,
}

impl DominantLight {
    pub fn to_directional(&self) -> DirectionalLight {
        DirectionalLight {
            direction: self.forward.to_array(),
            rotation: self.rotation.to_array(),
            color: self.color.to_array(),
            intensity: self.intensity,
        }
    }
}

/// Left-handed look rotation (+Z forward, +Y up). Falls back to the shortest arc from +Z when
/// `forward` is parallel to up.
pub fn look_rotation(forward: Vec3) -> Quat {
    let z = forward.normalize_or_zero();
    if z == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    let x = Vec3::Y.cross(z);
    if x.length_squared() < 1e-12 {
        return Quat::from_rotation_arc(Vec3::Z, z);
    }
    let x = x.normalize();
    let y = z.cross(x);
    Quat::from_mat3(&Mat3::from_cols(x, y, z)).normalize()
}

/// Dominant light of `sh`, or None when its first-order bands are (near) zero.
pub fn extract_dominant_light(
    sh: &ShBuffer,
    convention: LightDirectionConvention,
    multiplier: f32,
) -> Option<DominantLight> {
    let v = sh.luminance_vector();
    if !v.is_finite() || v.length_squared() < MIN_DIRECTION_LENGTH_SQ {
        return None;
    }
    let source_direction = v.normalize();
    let forward = match convention {
        LightDirectionConvention::TowardSource => -source_direction,
        LightDirectionConvention::Raw => source_direction,
    };
    let color = sh.evaluate(source_direction).max(Vec3::ZERO);
    Some(DominantLight {
        source_direction,
        forward,
        rotation: look_rotation(forward),
        color,
        intensity: color.max_element() * multiplier,
    })
}

pub struct LightingApplier<S: LightingSink> {
    sink: S,
    light_intensity_multiplier: f32,
    ambient_intensity: f32,
    convention: LightDirectionConvention,
}

impl<S: LightingSink> LightingApplier<S> {
    pub fn new(sink: S, config: &EstimatorConfig) -> Self {
        Self {
            sink,
            light_intensity_multiplier: config.light_intensity_multiplier,
            ambient_intensity: config.ambient_intensity,
            convention: config.direction_convention,
        }
    }

    /// Pick up the light-mapping fields of `config`.
    pub fn configure(&mut self, config: &EstimatorConfig) {
        self.light_intensity_multiplier = config.light_intensity_multiplier;
        self.ambient_intensity = config.ambient_intensity;
        self.convention = config.direction_convention;
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Install `sh` as the ambient probe and, when it has a usable direction, update the
    /// directional light. Returns the light that was installed.
    pub fn apply(&mut self, sh: &ShBuffer) -> Option<DominantLight> {
        self.sink.install_ambient(&AmbientProbe {
            coefficients: sh.to_array(),
            mode: AmbientMode::Custom,
            intensity: self.ambient_intensity,
        });
        let multiplier = self.light_intensity_multiplier;
        let Some(light) = extract_dominant_light(sh, self.convention, multiplier) else {
            trace!("first-order bands near zero; directional light left unchanged");
            return None;
        };
        self.sink.install_directional(&light.to_directional());
        Some(light)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use light_api::ExtractedLighting;

    fn applier() -> LightingApplier<ExtractedLighting> {
        LightingApplier::new(ExtractedLighting::new(), &EstimatorConfig::default())
    }

    #[test]
    fn zero_first_order_leaves_light_unchanged() {
        let mut a = applier();
        assert!(a.apply(&ShBuffer::splat(0.0)).is_none());
        let mut flat = ShBuffer::ZERO;
        flat.add_ambient_light(Vec3::ONE);
        assert!(a.apply(&flat).is_none());
        assert!(a.sink().directional.is_none());
        assert_eq!(a.sink().ambient_updates, 2);
        let probe = a.sink().ambient.as_ref().unwrap();
        assert_eq!(probe.mode, AmbientMode::Custom);
        assert_eq!(probe.intensity, 1.0);
    }

    #[test]
    fn light_from_above_points_down() {
        let mut sh = ShBuffer::ZERO;
        sh.add_directional_light(Vec3::Y, Vec3::new(1.0, 0.8, 0.6), 2.0);
        let mut a = applier();
        let light = a.apply(&sh).unwrap();
        assert_relative_eq!(light.source_direction.y, 1.0, epsilon = 1e-5);
        assert_relative_eq!(light.forward.y, -1.0, epsilon = 1e-5);
        assert_relative_eq!(light.intensity, light.color.x, epsilon = 1e-6);
        assert!(light.color.x > light.color.z);
        let rotated = light.rotation * Vec3::Z;
        assert_relative_eq!(rotated.y, -1.0, epsilon = 1e-4);
        assert!(light.rotation.is_finite());

        let installed = a.sink().directional.clone().unwrap();
        assert_eq!(installed.direction, light.forward.to_array());
    }

    #[test]
    fn raw_convention_keeps_vector_sign() {
        let mut sh = ShBuffer::ZERO;
        sh.add_directional_light(Vec3::X, Vec3::ONE, 1.0);
        let light = extract_dominant_light(&sh, LightDirectionConvention::Raw, 3.0).unwrap();
        assert_relative_eq!(light.forward.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(light.intensity, light.color.x * 3.0, epsilon = 1e-5);
    }

    #[test]
    fn look_rotation_maps_forward() {
        for f in [Vec3::X, Vec3::NEG_Z, Vec3::new(0.3, -0.5, 0.8).normalize()] {
            let q = look_rotation(f);
            let z = q * Vec3::Z;
            assert_relative_eq!(z.x, f.x, epsilon = 1e-5);
            assert_relative_eq!(z.y, f.y, epsilon = 1e-5);
            assert_relative_eq!(z.z, f.z, epsilon = 1e-5);
        }
        assert_eq!(look_rotation(Vec3::ZERO), Quat::IDENTITY);
    }

    #[test]
    fn negative_lobes_are_clamped() {
        let mut sh = ShBuffer::ZERO;
        // no constant term: blue evaluates negative toward the source
        sh.coefficients[0][1] = 1.0;
        sh.coefficients[1][1] = 1.0;
        sh.coefficients[2][1] = -5.0;
        let light =
            extract_dominant_light(&sh, LightDirectionConvention::TowardSource, 1.0).unwrap();
        assert!(light.color.min_element() >= 0.0);
    }
}
