//! Image embedding generation.
//!
//! - `preprocess`: decode, resize and scale an image into a model input tensor
//! - `generator`: runs a feature extractor over preprocessed images
//! - `onnx`: ONNX Runtime feature extractor
//!
//! The model is loaded once when the generator is constructed; `embed_*` calls
//! are then cheap and safe to issue from several threads.

use std::path::Path;

mod generator;
mod onnx;
mod preprocess;

pub use generator::{EmbeddingGenerator, FeatureExtractor};
pub use onnx::OnnxFeatureExtractor;
pub use preprocess::{Preprocessor, TensorLayout};

/// Input resolution of the default feature-vector network.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("failed to read image {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("model inference failed: {0}")]
    Inference(String),

    #[error("model returned {got} values, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("model returned no embedding")]
    Empty,
}

/// Turns one image into one fixed-length vector.
pub trait ImageEmbedder: Send + Sync {
    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    fn embed_bytes(&self, data: &[u8]) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_file(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let data = std::fs::read(path).map_err(|source| EmbeddingError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.embed_bytes(&data)
    }
}
