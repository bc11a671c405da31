use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use super::{EmbeddingError, FeatureExtractor};

/// Feature-vector network exported to ONNX.
///
/// The model takes a single float image tensor and returns one pooled
/// feature vector per batch entry.
pub struct OnnxFeatureExtractor {
    // ort's run() needs &mut Session
    session: Mutex<Session>,
    name: String,
}

impl OnnxFeatureExtractor {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, EmbeddingError> {
        if !model_path.exists() {
            return Err(EmbeddingError::InitFailed(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| EmbeddingError::InitFailed(format!("ONNX session builder: {e}")))?
            .with_intra_threads(intra_threads.max(1))
            .map_err(|e| EmbeddingError::InitFailed(format!("ONNX set threads: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| EmbeddingError::InitFailed(format!("ONNX load model: {e}")))?;

        let name = model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "onnx".to_string());

        log::info!("loaded ONNX model from {}", model_path.display());

        Ok(Self {
            session: Mutex::new(session),
            name,
        })
    }
}

impl FeatureExtractor for OnnxFeatureExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, EmbeddingError> {
        let tensor = TensorRef::from_array_view(input)
            .map_err(|e| EmbeddingError::Inference(format!("input tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbeddingError::Inference(format!("session lock poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::Inference(format!("extract output: {e}")))?;

        // [1, D] (or [1, 1, 1, D] for unpooled exports): a batch of one means
        // the whole buffer is the vector
        if shape.first().is_some_and(|&batch| batch != 1) {
            return Err(EmbeddingError::Inference(format!(
                "unexpected output batch in shape {:?}",
                shape.iter().collect::<Vec<_>>()
            )));
        }

        Ok(data.to_vec())
    }
}
