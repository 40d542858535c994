use crate::{
    model_service::{ModelError, ModelService},
    prediction::{Prediction, PredictionResponse},
    preprocess::{preprocess, PreprocessError},
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error("Error processing image: {0}")]
    DecodingOrFormat(#[from] PreprocessError),
    #[error("Error during prediction: {0}")]
    Inference(String),
}

impl From<ModelError> for InferenceError {
    fn from(err: ModelError) -> Self {
        InferenceError::Inference(err.to_string())
    }
}

/// Runs one upload through preprocessing, the classifier and label mapping.
///
/// The model is fixed at construction; `None` means it failed to load and
/// every call reports [`InferenceError::ModelUnavailable`].
pub struct InferenceService<M: ModelService> {
    model_service: Option<Arc<M>>,
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(model_service: Option<M>) -> Self {
        Self {
            model_service: model_service.map(Arc::new),
        }
    }

    fn model(&self) -> Result<Arc<M>, InferenceError> {
        self.model_service
            .clone()
            .ok_or(InferenceError::ModelUnavailable)
    }

    /// Fails fast with [`InferenceError::ModelUnavailable`] before the upload
    /// is read.
    pub fn ensure_loaded(&self) -> Result<(), InferenceError> {
        self.model().map(|_| ())
    }

    pub async fn classify(
        &self,
        filename: Option<String>,
        image_data: Vec<u8>,
    ) -> Result<PredictionResponse, InferenceError> {
        let model_service = self.model()?;

        let probability = tokio::task::spawn_blocking(move || {
            let input = preprocess(&image_data)?;
            let probability = model_service.predict(&input)?;
            Ok::<_, InferenceError>(probability)
        })
        .await
        .map_err(|e| InferenceError::Inference(e.to_string()))??;

        let prediction = Prediction::from_probability(f64::from(probability));
        tracing::debug!(
            "Predicted {:?} with confidence {:.4} (p={:.4})",
            prediction.predicted_class,
            prediction.confidence,
            probability
        );

        Ok(PredictionResponse {
            filename,
            prediction,
        })
    }
}
