//! ShLight plugin: implements LightEstimator for the host.

use std::path::Path;

use light_api::{CameraSource, ExtractedLighting, LightEstimator};
use log::{error, info};
use shlight_estimator::{
    load_config, CpuBackend, CycleStats, EstimatorConfig, GpuBackend, Model, ModelBackend,
    PipelineController, TickOutcome,
};

/// ShLight plugin: owns the pipeline controller and records lighting into an ExtractedLighting
/// the host reads each frame.
///
/// Construction never fails. A misconfiguration (missing model, mismatched resolution, invalid
/// settings) is logged once and yields an inactive plugin whose lighting never changes.
pub struct ShLightPlugin<B: ModelBackend = GpuBackend> {
    controller: Option<PipelineController<B, ExtractedLighting>>,
    /// Served while inactive from construction.
    idle_lighting: ExtractedLighting,
    /// A runtime failure is reported to the host once.
    failure_reported: bool,
}

impl<B: ModelBackend> ShLightPlugin<B> {
    /// Wrap an already-built backend.
    pub fn with_backend(
        backend: B,
        config: EstimatorConfig,
        camera: Box<dyn CameraSource>,
    ) -> Self {
        match PipelineController::new(config, camera, backend, ExtractedLighting::new()) {
            Ok(controller) => Self::active(controller),
            Err(e) => Self::inactive(&e.to_string()),
        }
    }

    fn active(controller: PipelineController<B, ExtractedLighting>) -> Self {
        Self {
            controller: Some(controller),
            idle_lighting: ExtractedLighting::new(),
            failure_reported: false,
        }
    }

    /// Inactive plugin; logs `reason` once.
    pub fn inactive(reason: &str) -> Self {
        error!("light estimation disabled: {reason}");
        Self { controller: None, idle_lighting: ExtractedLighting::new(), failure_reported: true }
    }

    /// Runtime tuning from the host UI. Resolution changes are rejected.
    pub fn apply_tuning(&mut self, tuning: &EstimatorConfig) -> Result<(), String> {
        match self.controller.as_mut() {
            Some(controller) => controller.apply_tuning(tuning).map_err(|e| e.to_string()),
            None => Err("light estimation is disabled".to_string()),
        }
    }

    pub fn stats(&self) -> Option<CycleStats> {
        self.controller.as_ref().map(|c| c.stats())
    }

    pub fn controller(&self) -> Option<&PipelineController<B, ExtractedLighting>> {
        self.controller.as_ref()
    }

    /// Release the backend; the last lighting stays readable.
    pub fn shutdown(&mut self) {
        if let Some(controller) = self.controller.as_mut() {
            controller.teardown();
        }
        self.failure_reported = true;
    }

    pub fn into_boxed(self) -> Box<dyn LightEstimator>
    where
        B: 'static,
    {
        Box::new(self)
    }
}

impl ShLightPlugin<GpuBackend> {
    /// Create with wgpu device and queue (default config).
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        model: &Model,
        camera: Box<dyn CameraSource>,
    ) -> Self {
        Self::new_with_config(device, queue, model, EstimatorConfig::default(), camera)
    }

    pub fn new_with_config(
        device: wgpu::Device,
        queue: wgpu::Queue,
        model: &Model,
        config: EstimatorConfig,
        camera: Box<dyn CameraSource>,
    ) -> Self {
        match GpuBackend::new(device, queue, model) {
            Ok(backend) => Self::with_backend(backend, config, camera),
            Err(e) => Self::inactive(&e.to_string()),
        }
    }

    /// Load model and (optional) config assets. Load failures disable the plugin.
    pub fn from_files(
        device: wgpu::Device,
        queue: wgpu::Queue,
        model_path: &Path,
        config_path: Option<&Path>,
        camera: Box<dyn CameraSource>,
    ) -> Self {
        match load_assets(model_path, config_path) {
            Ok((model, config)) => Self::new_with_config(device, queue, &model, config, camera),
            Err(reason) => Self::inactive(&reason),
        }
    }
}

impl ShLightPlugin<CpuBackend> {
    /// CPU reference backend; no device needed.
    pub fn new_cpu(model: Model, config: EstimatorConfig, camera: Box<dyn CameraSource>) -> Self {
        Self::with_backend(CpuBackend::new(model), config, camera)
    }
}

fn load_assets(
    model_path: &Path,
    config_path: Option<&Path>,
) -> Result<(Model, EstimatorConfig), String> {
    let config = match config_path {
        Some(path) => load_config(path).map_err(|e| e.to_string())?,
        None => EstimatorConfig::default(),
    };
    let model = Model::load(model_path).map_err(|e| e.to_string())?;
    info!("loaded model {} ({} layers)", model_path.display(), model.unit_count());
    Ok((model, config))
}

impl<B: ModelBackend> LightEstimator for ShLightPlugin<B> {
    fn tick(&mut self) -> Result<(), String> {
        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };
        if controller.tick() == TickOutcome::Disabled && !self.failure_reported {
            self.failure_reported = true;
            return Err("light estimation stopped after a backend failure".to_string());
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.controller.as_ref().is_some_and(|c| !c.is_disabled())
    }

    fn lighting(&self) -> &ExtractedLighting {
        match self.controller.as_ref() {
            Some(controller) => controller.sink(),
            None => &self.idle_lighting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use light_api::RawImage;

    struct Solid;

    impl CameraSource for Solid {
        fn try_acquire_latest_frame(&mut self) -> Option<RawImage> {
            Some(RawImage::solid_rgba(8, 8, [200, 180, 160, 255]))
        }
    }

    fn config() -> EstimatorConfig {
        EstimatorConfig { target_width: 8, target_height: 8, ..Default::default() }
    }

    #[test]
    fn cpu_plugin_installs_lighting() {
        let model = Model::quadrant_projector(8, 8).unwrap();
        let mut plugin = ShLightPlugin::new_cpu(model, config(), Box::new(Solid));
        assert!(plugin.is_active());
        for _ in 0..8 {
            plugin.tick().unwrap();
        }
        assert!(plugin.lighting().ambient.is_some());
        assert!(plugin.stats().unwrap().cycles_completed >= 2);
    }

    #[test]
    fn mismatched_resolution_gives_inactive_plugin() {
        let model = Model::quadrant_projector(16, 16).unwrap();
        let mut plugin = ShLightPlugin::new_cpu(model, config(), Box::new(Solid));
        assert!(!plugin.is_active());
        assert!(plugin.tick().is_ok());
        assert!(plugin.lighting().ambient.is_none());
        assert!(plugin.apply_tuning(&config()).is_err());
    }

    #[test]
    fn missing_model_file_disables() {
        let result = load_assets(Path::new("/nonexistent/model.json"), None);
        assert!(result.unwrap_err().contains("model.json"));
    }

    #[test]
    fn shutdown_keeps_last_lighting() {
        let model = Model::quadrant_projector(8, 8).unwrap();
        let mut plugin = ShLightPlugin::new_cpu(model, config(), Box::new(Solid));
        for _ in 0..3 {
            plugin.tick().unwrap();
        }
        plugin.shutdown();
        assert!(!plugin.is_active());
        assert!(plugin.tick().is_ok());
        assert_eq!(plugin.lighting().ambient_updates, 1);
    }
}
