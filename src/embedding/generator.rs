use ndarray::Array4;

use super::{EmbeddingError, ImageEmbedder, Preprocessor};

/// Forward pass of a feature-vector network on a batch of one image.
///
/// Implementations hold no per-call state, so one instance can serve
/// concurrent callers.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, EmbeddingError>;
}

/// Fixed preprocessing in front of a feature extractor.
pub struct EmbeddingGenerator {
    extractor: Box<dyn FeatureExtractor>,
    preprocessor: Preprocessor,
    dimensions: usize,
    l2_normalize: bool,
}

impl EmbeddingGenerator {
    /// Wraps `extractor` and probes its output dimension with a blank input.
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        preprocessor: Preprocessor,
        l2_normalize: bool,
    ) -> Result<Self, EmbeddingError> {
        let dimensions = Self::probe_dimensions(extractor.as_ref(), &preprocessor)?;

        log::info!(
            "embedding model '{}' ready: {}px input, {} dimensions",
            extractor.name(),
            preprocessor.size(),
            dimensions
        );

        Ok(Self {
            extractor,
            preprocessor,
            dimensions,
            l2_normalize,
        })
    }

    fn probe_dimensions(
        extractor: &dyn FeatureExtractor,
        preprocessor: &Preprocessor,
    ) -> Result<usize, EmbeddingError> {
        let probe = extractor
            .forward(&preprocessor.blank())
            .map_err(|e| EmbeddingError::InitFailed(format!("failed to probe dimensions: {e}")))?;

        match probe.len() {
            0 => Err(EmbeddingError::InitFailed(
                "model returned an empty vector".to_string(),
            )),
            dimensions => Ok(dimensions),
        }
    }
}

impl ImageEmbedder for EmbeddingGenerator {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_bytes(&self, data: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let input = self.preprocessor.preprocess(data)?;
        let mut embedding = self.extractor.forward(&input)?;

        if embedding.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        if self.l2_normalize {
            l2_normalize(&mut embedding);
        }

        Ok(embedding)
    }
}

/// Scales `v` to unit length. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
