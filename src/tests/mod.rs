use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ndarray::Array4;

use crate::ann::{AnnService, DistanceMetric, MachineSpec, PollOptions};
use crate::embedding::{
    EmbeddingError, EmbeddingGenerator, FeatureExtractor, ImageEmbedder, Preprocessor,
    TensorLayout,
};
use crate::ingest::{IngestOptions, IngestionPipeline};
use crate::lifecycle::{Deployment, IndexLifecycleManager, LifecycleSettings};
use crate::storage::{BlobStore, LocalBlobStore};

mod query;

pub use fakes::FakeAnnService;

pub const TEST_INDEX: &str = "test-images";
pub const TEST_DIMENSION: usize = 4;

/// Mean of each color channel plus a constant, so every image gets a
/// non-zero vector and same-colored images land close together.
pub struct ColorMeans;

impl FeatureExtractor for ColorMeans {
    fn name(&self) -> &str {
        "color-means"
    }

    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, EmbeddingError> {
        let pixels = (input.shape()[1] * input.shape()[2]) as f32;
        let mut means = vec![0.0f32; 3];
        for ((_, _, _, c), v) in input.indexed_iter() {
            means[c] += v / pixels;
        }
        means.push(0.1);
        Ok(means)
    }
}

pub fn embedder() -> Arc<dyn ImageEmbedder> {
    Arc::new(
        EmbeddingGenerator::new(
            Box::new(ColorMeans),
            Preprocessor::new(8, TensorLayout::Nhwc),
            true,
        )
        .unwrap(),
    )
}

pub fn png(rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb(rgb));
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

pub fn write_png(dir: &Path, name: &str, rgb: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, png(rgb)).unwrap();
    path
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

pub fn test_poll() -> PollOptions {
    PollOptions {
        interval: Duration::from_millis(1),
        timeout: Some(Duration::from_secs(5)),
    }
}

pub fn settings() -> LifecycleSettings {
    LifecycleSettings {
        description: String::new(),
        shard_size: "SHARD_SIZE_SMALL".to_string(),
        leaf_node_embedding_count: 500,
        leaf_nodes_to_search_percent: 7,
        public_endpoint: true,
        machine: MachineSpec {
            machine_type: "e2-standard-2".to_string(),
            min_replica_count: 1,
            max_replica_count: 1,
        },
        canonical_endpoint: None,
        canonical_index: None,
        canonical_deployed_index_id: None,
    }
}

/// Temp dir, local bucket, fake index service and color-means embedder.
pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub images: PathBuf,
    pub store: Arc<LocalBlobStore>,
    pub service: Arc<FakeAnnService>,
    pub embedder: Arc<dyn ImageEmbedder>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let images = tmp.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(tmp.path().join("scratch")).unwrap();

        let store = Arc::new(LocalBlobStore::new(&tmp.path().join("blobs"), "sisterly").unwrap());
        let service = Arc::new(FakeAnnService::new(Some(
            store.clone() as Arc<dyn BlobStore>
        )));

        Self {
            tmp,
            images,
            store,
            service,
            embedder: embedder(),
        }
    }

    pub fn lifecycle(&self, settings: LifecycleSettings) -> IndexLifecycleManager {
        IndexLifecycleManager::new(
            self.service.clone() as Arc<dyn AnnService>,
            test_poll(),
            settings,
        )
    }

    pub fn deploy(&self) -> Deployment {
        self.lifecycle(settings())
            .initialize(TEST_INDEX, TEST_DIMENSION, DistanceMetric::DotProduct, 10)
            .unwrap()
    }

    pub fn pipeline(&self, deployment: &Deployment, options: IngestOptions) -> IngestionPipeline {
        IngestionPipeline::new(
            self.store.clone(),
            self.embedder.clone(),
            self.service.clone(),
            deployment.index.clone(),
            IngestOptions {
                scratch_dir: Some(self.tmp.path().join("scratch")),
                poll: test_poll(),
                ..options
            },
        )
    }

    /// Image objects (not prefix markers) stored under `prefix`.
    pub fn stored(&self, prefix: &str) -> Vec<String> {
        self.store
            .list(prefix)
            .unwrap()
            .into_iter()
            .filter(|path| !path.ends_with('/'))
            .collect()
    }
}
