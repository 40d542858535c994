use crate::{
    inference_service::InferenceError, model_service::ModelService,
    prediction::PredictionResponse, server::SharedState,
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

pub const UPLOAD_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Error processing image: {message}")]
    Upload { status: StatusCode, message: String },
    #[error("Field required: file")]
    MissingFile,
}

impl From<MultipartRejection> for PredictError {
    fn from(err: MultipartRejection) -> Self {
        PredictError::Upload {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl From<MultipartError> for PredictError {
    fn from(err: MultipartError) -> Self {
        PredictError::Upload {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictError::Inference(InferenceError::ModelUnavailable) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // inference failures are reported to the caller, not as 5xx
            PredictError::Inference(_) => StatusCode::BAD_REQUEST,
            PredictError::Upload { status, .. } => *status,
            PredictError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
        };

        if status.is_server_error() {
            tracing::error!("Prediction failed: {}", self);
        } else {
            tracing::warn!("Prediction rejected: {}", self);
        }

        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, PredictError> {
    state.inference_service.ensure_loaded()?;

    let (filename, image_data) = read_upload(multipart?).await?;
    tracing::debug!(
        "Received upload {:?} ({} bytes)",
        filename,
        image_data.len()
    );

    let response = state
        .inference_service
        .classify(filename, image_data)
        .await?;

    Ok(Json(response))
}

async fn read_upload(
    mut multipart: Multipart,
) -> Result<(Option<String>, Vec<u8>), PredictError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let filename = field.file_name().map(str::to_owned);
        let image_data = field.bytes().await?;

        return Ok((filename, image_data.to_vec()));
    }

    Err(PredictError::MissingFile)
}
