//! shlight bridge: implements light_api::LightEstimator using shlight-estimator.

mod headless;
mod plugin;

pub use headless::{create_estimator, request_device};
pub use plugin::ShLightPlugin;
