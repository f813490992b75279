//! Headless device acquisition: no surface, compute only.

use light_api::{CameraSource, LightEstimator};
use log::{info, warn};
use shlight_estimator::{EstimatorConfig, Model};

use crate::plugin::ShLightPlugin;

/// Default adapter and device without a surface.
pub fn request_device() -> Result<(wgpu::Device, wgpu::Queue), String> {
    pollster::block_on(request_device_async())
}

async fn request_device_async() -> Result<(wgpu::Device, wgpu::Queue), String> {
    let instance = wgpu::Instance::default();
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .ok_or("No adapter")?;
    info!("shlight adapter: {}", adapter.get_info().name);
    adapter
        .request_device(&wgpu::DeviceDescriptor::default(), None)
        .await
        .map_err(|e| e.to_string())
}

/// GPU estimator when a device is available, otherwise the CPU reference backend.
pub fn create_estimator(
    model: Model,
    config: EstimatorConfig,
    camera: Box<dyn CameraSource>,
) -> Box<dyn LightEstimator> {
    match request_device() {
        Ok((device, queue)) => {
            ShLightPlugin::new_with_config(device, queue, &model, config, camera).into_boxed()
        }
        Err(e) => {
            warn!("no GPU for light estimation ({e}); using the CPU backend");
            ShLightPlugin::new_cpu(model, config, camera).into_boxed()
        }
    }
}
