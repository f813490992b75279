//! shlight estimator: camera frames -> time-sliced neural inference -> SH L2 ambient probe and
//! a dominant directional light, smoothed over a short history.

pub mod applier;
pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod sh;

pub use applier::{extract_dominant_light, look_rotation, DominantLight, LightingApplier};
pub use backend::{
    CpuBackend, CycleId, GpuBackend, ModelBackend, ReadbackCompletion, ReadbackMessage,
};
pub use config::{load_config, EstimatorConfig, FilterMode, LightDirectionConvention, ResizeFilter};
pub use error::{EstimatorError, Result};
pub use filter::TemporalShFilter;
pub use frame::{FramePreprocessor, FrameTensor};
pub use model::{Layer, Model, TensorShape};
pub use pipeline::{CycleStats, PipelineController, PipelineState, TickOutcome};
pub use scheduler::InferenceScheduler;
pub use sh::{OutputLayout, ShBuffer};
