//! Error type shared by every estimator stage.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    /// Missing or invalid setup; detected once at construction.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),
    /// A camera image or model output could not be converted.
    #[error("conversion failed: {0}")]
    Conversion(String),
    /// A cycle is already in flight.
    #[error("an inference cycle is already in flight")]
    Busy,
    #[error("backend: {0}")]
    Backend(String),
    #[error("invalid model: {0}")]
    Model(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The component was torn down; no further work is accepted.
    #[error("estimator was torn down")]
    TornDown,
}

pub type Result<T, E = EstimatorError> = std::result::Result<T, E>;
