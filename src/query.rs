//! Similarity search and result download.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ann::{AnnError, AnnService};
use crate::embedding::{EmbeddingError, ImageEmbedder};
use crate::ingest::{ItemFailure, Stage};
use crate::lifecycle::Deployment;
use crate::records::NeighborMetadata;
use crate::storage::{BlobStore, BlobUri};

pub const DEFAULT_NEIGHBORS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to embed query image: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("query embedding has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("neighbor query failed: {0}")]
    Remote(#[from] AnnError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    /// As reported by the index; see [`crate::ann::DistanceMetric`].
    pub distance: f64,
    pub metadata: Option<NeighborMetadata>,
}

impl SearchResult {
    /// Bucket-relative path of the matched image, if known.
    pub fn image_path(&self) -> Option<&str> {
        self.metadata.as_ref()?.image_path.as_deref()
    }
}

pub struct QueryEngine {
    embedder: Arc<dyn ImageEmbedder>,
    service: Arc<dyn AnnService>,
    deployment: Deployment,
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn ImageEmbedder>,
        service: Arc<dyn AnnService>,
        deployment: Deployment,
    ) -> Self {
        Self {
            embedder,
            service,
            deployment,
        }
    }

    pub fn search(
        &self,
        query_image: &Path,
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchResult>, QueryError> {
        log::info!("searching for images similar to {}", query_image.display());
        let embedding = self.embedder.embed_file(query_image)?;
        self.search_embedding(embedding, k, filter)
    }

    pub fn search_bytes(
        &self,
        data: &[u8],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchResult>, QueryError> {
        let embedding = self.embedder.embed_bytes(data)?;
        self.search_embedding(embedding, k, filter)
    }

    /// At most `k` results, most relevant first under the index's metric.
    pub fn search_embedding(
        &self,
        embedding: Vec<f32>,
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchResult>, QueryError> {
        if k == 0 {
            return Ok(vec![]);
        }

        let expected = self.deployment.index.dimension;
        if expected != 0 && embedding.len() != expected {
            return Err(QueryError::DimensionMismatch {
                expected,
                got: embedding.len(),
            });
        }

        let neighbors = self
            .service
            .query_neighbors(
                &self.deployment.endpoint,
                &self.deployment.deployed_index_id,
                &[embedding],
                k,
                filter,
            )?
            .into_iter()
            .next()
            .unwrap_or_default();

        let metric = self.deployment.index.distance_metric;
        let mut results: Vec<SearchResult> = neighbors
            .into_iter()
            .map(|neighbor| SearchResult {
                metadata: NeighborMetadata::from_restricts(&neighbor.restricts),
                id: neighbor.id,
                distance: neighbor.distance,
            })
            .collect();

        // stable, so ties keep the service's order
        results.sort_by(|a, b| metric.compare(a.distance, b.distance));
        results.truncate(k);

        log::info!("found {} neighbors", results.len());
        Ok(results)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializedFile {
    pub position: usize,
    pub result_id: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterializeReport {
    pub written: Vec<MaterializedFile>,
    pub failures: Vec<ItemFailure>,
}

/// Downloads search hits to `result_{i}.jpg` files.
pub struct ResultMaterializer {
    store: Arc<dyn BlobStore>,
}

impl ResultMaterializer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn materialize(
        &self,
        results: &[SearchResult],
        out_dir: &Path,
    ) -> Result<MaterializeReport, std::io::Error> {
        std::fs::create_dir_all(out_dir)?;
        let mut report = MaterializeReport::default();

        for (position, result) in results.iter().enumerate() {
            let dest = out_dir.join(format!("result_{position}.jpg"));

            match self.download(result, &dest) {
                Ok(()) => {
                    log::info!("downloaded {} to {}", result.id, dest.display());
                    report.written.push(MaterializedFile {
                        position,
                        result_id: result.id.clone(),
                        path: dest,
                    });
                }
                Err(err) => report
                    .failures
                    .push(ItemFailure::new(&result.id, Stage::Download, err)),
            }
        }

        Ok(report)
    }

    fn download(&self, result: &SearchResult, dest: &Path) -> Result<(), String> {
        // records indexed without restricts only carry their id, which is
        // then expected to be the image uri
        let path = match result.image_path() {
            Some(path) => path.to_string(),
            None => {
                let uri: BlobUri = result
                    .id
                    .parse()
                    .map_err(|_| "no image path known for this result".to_string())?;
                self.store
                    .relative_path(&uri)
                    .map_err(|err| err.to_string())?
            }
        };

        self.store
            .get_to_file(&path, dest)
            .map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path_from_metadata() {
        let result = SearchResult {
            id: "01jc".to_string(),
            distance: 0.5,
            metadata: Some(NeighborMetadata {
                image_path: Some("images/admin/a.png".to_string()),
                ..Default::default()
            }),
        };
        assert_eq!(result.image_path(), Some("images/admin/a.png"));

        let bare = SearchResult {
            metadata: None,
            ..result
        };
        assert_eq!(bare.image_path(), None);
    }
}
