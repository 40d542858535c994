use ndarray::{Array, Ix4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(String),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("session mutex poisoned: {0}")]
    Poisoned(String),
    #[error("failed to build tensor: {0}")]
    Tensor(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("failed to extract tensor: {0}")]
    Extract(String),
    #[error("model returned an empty output")]
    EmptyOutput,
    #[error("model returned a non-finite probability: {0}")]
    NonFinite(f32),
}

/// A binary classifier taking a `(1, 224, 224, 3)` batch and returning the
/// sigmoid probability of the `normal` class.
pub trait ModelService: Send + Sync + 'static {
    fn predict(&self, input: &Array<f32, Ix4>) -> Result<f32, ModelError>;
}
