//! Lighting sink: where the estimator installs ambient SH and the dominant directional light.
//! The host implements LightingSink over its own scene state, or reads ExtractedLighting each
//! frame.

/// How the ambient probe should be interpreted by the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum AmbientMode {
    /// Ambient comes from the SH coefficients of the probe.
    #[default]
    Custom,
}

/// Scene-wide SH L2 ambient probe. `coefficients[channel][band]`, channel order R, G, B.
#[derive(Clone, Debug, PartialEq)]
pub struct AmbientProbe {
    pub coefficients: [[f32; 9]; 3],
    pub mode: AmbientMode,
    pub intensity: f32,
}

/// Single directional light.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectionalLight {
    /// Unit vector the light travels along (world space).
    pub direction: [f32; 3],
    /// Orientation as quaternion (x, y, z, w); forward axis is +Z.
    pub rotation: [f32; 4],
    /// Linear RGB, non-negative.
    pub color: [f32; 3],
    pub intensity: f32,
}

/// Receives lighting updates from an estimator.
pub trait LightingSink {
    fn install_ambient(&mut self, probe: &AmbientProbe);
    fn install_directional(&mut self, light: &DirectionalLight);
}

impl<S: LightingSink + ?Sized> LightingSink for &mut S {
    fn install_ambient(&mut self, probe: &AmbientProbe) {
        (**self).install_ambient(probe)
    }
    fn install_directional(&mut self, light: &DirectionalLight) {
        (**self).install_directional(light)
    }
}

impl<S: LightingSink + ?Sized> LightingSink for Box<S> {
    fn install_ambient(&mut self, probe: &AmbientProbe) {
        (**self).install_ambient(probe)
    }
    fn install_directional(&mut self, light: &DirectionalLight) {
        (**self).install_directional(light)
    }
}

/// Recording sink: keeps the last installed values so the host can extract them into its render
/// view.
#[derive(Clone, Debug, Default)]
pub struct ExtractedLighting {
    pub ambient: Option<AmbientProbe>,
    pub directional: Option<DirectionalLight>,
    pub ambient_updates: u64,
    pub directional_updates: u64,
}

impl ExtractedLighting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directional light as (direction, color) with color premultiplied by intensity.
    /// None until the estimator has installed a light.
    pub fn directional_light(&self) -> Option<([f32; 3], [f32; 3])> {
        self.directional.as_ref().map(|l| {
            (
                l.direction,
                [l.color[0] * l.intensity, l.color[1] * l.intensity, l.color[2] * l.intensity],
            )
        })
    }
}

impl LightingSink for ExtractedLighting {
    fn install_ambient(&mut self, probe: &AmbientProbe) {
        self.ambient = Some(probe.clone());
        self.ambient_updates += 1;
    }

    fn install_directional(&mut self, light: &DirectionalLight) {
        self.directional = Some(light.clone());
        self.directional_updates += 1;
    }
}
