use crate::{
    config::ModelConfig,
    model_service::{ModelError, ModelService},
};
use ndarray::{Array, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// ONNX Runtime backed classifier. Holds a small pool of sessions that are
/// handed out round-robin, each behind its own lock.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    model_path: PathBuf,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        let model_path = model_config.get_path();
        if !model_path.exists() {
            return Err(ModelError::NotFound(model_path.display().to_string()));
        }

        let committed = ort::init().with_name("covid_classifier").commit();
        tracing::debug!("ONNX Runtime environment committed: {:?}", committed);

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()
                    .map_err(|e| ModelError::Load(e.to_string()))?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(|e| ModelError::Load(e.to_string()))?
                    .commit_from_file(&model_path)
                    .map_err(|e| ModelError::Load(e.to_string()))?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        tracing::info!(
            "Created {} ONNX sessions from {}",
            num_instances,
            model_path.display()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            model_path,
        })
    }

    /// Loads the classifier once at startup. A failure is logged and leaves
    /// the service without a model instead of aborting.
    pub fn load(model_config: &ModelConfig) -> Option<Self> {
        match Self::new(model_config) {
            Ok(service) => Some(service),
            Err(e) => {
                tracing::error!("Error loading model: {}", e);
                None
            }
        }
    }

    pub fn model_path(&self) -> &PathBuf {
        &self.model_path
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<f32, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| ModelError::Tensor(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Extract(e.to_string()))?;

        let probability = *data.first().ok_or(ModelError::EmptyOutput)?;
        if !probability.is_finite() {
            return Err(ModelError::NonFinite(probability));
        }

        Ok(probability)
    }
}

impl ModelService for OrtModelService {
    fn predict(&self, input: &Array<f32, Ix4>) -> Result<f32, ModelError> {
        self.run_inference(input)
    }
}
