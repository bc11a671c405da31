//! Image ingestion: upload, embed, persist records, update the index.
//!
//! Per-item failures never abort a run. They are logged and collected in the
//! [`IngestReport`]; only the final index update is fatal, since without it
//! nothing from the run becomes queryable.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ann::{AnnError, AnnService, IndexHandle, OperationPoller, PollOptions};
use crate::eid::Eid;
use crate::embedding::ImageEmbedder;
use crate::records::{EmbeddingRecord, ImageRecord, Owner, RecordError};
use crate::storage::{self, BlobStore, BlobUri};

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to read source {path}: {source}")]
    Source {
        path: String,
        source: std::io::Error,
    },

    #[error("index update from {delta_uri} failed: {source}")]
    IndexUpdate {
        delta_uri: String,
        #[source]
        source: AnnError,
    },
}

/// Where images come from.
#[derive(Clone, Debug)]
pub enum IngestSource {
    /// Image files directly inside a local directory.
    Directory(PathBuf),
    /// Local file paths, or `gs://` URIs of images already in the bucket.
    Uris(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Download,
    Embed,
    Persist,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: String,
    pub stage: Stage,
    pub error: String,
}

impl ItemFailure {
    pub(crate) fn new(item: &str, stage: Stage, error: impl ToString) -> Self {
        let failure = Self {
            item: item.to_string(),
            stage,
            error: error.to_string(),
        };
        log::error!("{:?} failed for {}: {}", stage, failure.item, failure.error);
        failure
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: Eid,
    pub record_uri: BlobUri,
    pub image_uri: BlobUri,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexUpdateStatus {
    /// Nothing new to index.
    #[default]
    Skipped,
    /// Accepted by the service, still running.
    Submitted { operation: String },
    Completed { operation: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub uploaded: Vec<ImageRecord>,
    pub persisted: Vec<PersistedRecord>,
    /// Files skipped for not having an image extension.
    pub ignored: Vec<String>,
    pub failures: Vec<ItemFailure>,
    pub embeddings_prefix: Option<String>,
    pub index_update: IndexUpdateStatus,
}

impl IngestReport {
    pub fn succeeded(&self) -> usize {
        self.persisted.len()
    }

    pub fn skipped(&self) -> usize {
        self.failures.len()
    }

    pub fn nothing_to_do(&self) -> bool {
        self.uploaded.is_empty()
    }
}

/// One entry of a bulk manifest.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawBulkItem")]
pub struct BulkItem {
    pub path: String,
    pub owner: Owner,
}

#[derive(Deserialize)]
struct RawBulkItem {
    path: String,
    #[serde(default = "default_user_type")]
    user_type: String,
    #[serde(default)]
    user_id: Option<String>,
}

fn default_user_type() -> String {
    "admin".to_string()
}

impl TryFrom<RawBulkItem> for BulkItem {
    type Error = RecordError;

    fn try_from(raw: RawBulkItem) -> Result<Self, Self::Error> {
        Ok(BulkItem {
            owner: Owner::from_parts(&raw.user_type, raw.user_id.as_deref())?,
            path: raw.path,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch: usize,
    pub size: usize,
    pub report: Option<IngestReport>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkReport {
    pub batches: Vec<BatchOutcome>,
}

impl BulkReport {
    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.error.is_some()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.batches
            .iter()
            .filter_map(|b| b.report.as_ref())
            .map(IngestReport::succeeded)
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub batch_size: usize,
    /// Embedding workers; `None` uses rayon's global pool.
    pub workers: Option<usize>,
    pub scratch_dir: Option<PathBuf>,
    pub wait_for_update: bool,
    pub poll: PollOptions,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            workers: None,
            scratch_dir: None,
            wait_for_update: false,
            poll: PollOptions::default(),
        }
    }
}

pub fn has_image_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct IngestionPipeline {
    store: Arc<dyn BlobStore>,
    embedder: Arc<dyn ImageEmbedder>,
    service: Arc<dyn AnnService>,
    index: IndexHandle,
    options: IngestOptions,
    pool: Option<rayon::ThreadPool>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn BlobStore>,
        embedder: Arc<dyn ImageEmbedder>,
        service: Arc<dyn AnnService>,
        index: IndexHandle,
        options: IngestOptions,
    ) -> Self {
        let pool = options.workers.and_then(|workers| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|err| log::warn!("falling back to the global thread pool: {err}"))
                .ok()
        });

        Self {
            store,
            embedder,
            service,
            index,
            options,
            pool,
        }
    }

    pub fn ingest(&self, source: IngestSource, owner: &Owner) -> Result<IngestReport, IngestError> {
        let items = match source {
            IngestSource::Directory(dir) => list_directory(&dir)?,
            IngestSource::Uris(uris) => uris,
        };

        let items = items
            .into_iter()
            .map(|path| BulkItem {
                path,
                owner: owner.clone(),
            })
            .collect::<Vec<_>>();

        self.ingest_items(&items)
    }

    /// Ingests `items` in batches of `batch_size` (the configured size when
    /// `None`). A failed batch is logged and the next one still runs.
    pub fn bulk_index(&self, items: &[BulkItem], batch_size: Option<usize>) -> BulkReport {
        let batch_size = batch_size.unwrap_or(self.options.batch_size).max(1);
        let total = items.len().div_ceil(batch_size);
        let mut report = BulkReport::default();

        for (i, chunk) in items.chunks(batch_size).enumerate() {
            let batch = i + 1;
            log::info!("batch {batch}/{total}: {} items", chunk.len());

            let outcome = match self.ingest_items(chunk) {
                Ok(batch_report) => {
                    log::info!(
                        "batch {batch}/{total}: {} indexed, {} skipped",
                        batch_report.succeeded(),
                        batch_report.skipped()
                    );
                    BatchOutcome {
                        batch,
                        size: chunk.len(),
                        report: Some(batch_report),
                        error: None,
                    }
                }
                Err(err) => {
                    log::error!("batch {batch}/{total} failed: {err}");
                    BatchOutcome {
                        batch,
                        size: chunk.len(),
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            report.batches.push(outcome);
        }

        report
    }

    fn ingest_items(&self, items: &[BulkItem]) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::default();

        let uploaded = self.upload(items, &mut report);
        report.uploaded = uploaded;
        if report.uploaded.is_empty() {
            log::info!("no images uploaded, nothing to do");
            return Ok(report);
        }

        let now = Utc::now();
        let prefix = storage::embeddings_prefix(now);
        let results = self.embed_all(&report.uploaded, &prefix, now);
        for result in results {
            match result {
                Ok(persisted) => report.persisted.push(persisted),
                Err(failure) => report.failures.push(failure),
            }
        }

        log::info!(
            "{} of {} images embedded",
            report.persisted.len(),
            report.uploaded.len()
        );

        if report.persisted.is_empty() {
            log::warn!("no embeddings persisted, skipping index update");
            return Ok(report);
        }

        report.index_update = self.update_index(&prefix)?;
        report.embeddings_prefix = Some(prefix);
        Ok(report)
    }

    fn upload(&self, items: &[BulkItem], report: &mut IngestReport) -> Vec<ImageRecord> {
        let mut uploaded = Vec::new();
        let mut prepared = HashSet::new();

        for item in items {
            if !has_image_extension(&item.path) {
                log::debug!("ignoring {}", item.path);
                report.ignored.push(item.path.clone());
                continue;
            }

            if !item.path.starts_with("gs://") && prepared.insert(item.owner.clone()) {
                self.ensure_owner_prefix(&item.owner);
            }

            match self.upload_one(item) {
                Ok(record) => uploaded.push(record),
                Err(failure) => report.failures.push(failure),
            }
        }

        uploaded
    }

    fn upload_one(&self, item: &BulkItem) -> Result<ImageRecord, ItemFailure> {
        // already in the bucket
        if item.path.starts_with("gs://") {
            let uri: BlobUri = item
                .path
                .parse()
                .map_err(|err| ItemFailure::new(&item.path, Stage::Upload, err))?;
            self.store
                .relative_path(&uri)
                .map_err(|err| ItemFailure::new(&item.path, Stage::Upload, err))?;

            return Ok(ImageRecord {
                uri,
                local_path: None,
                checksum: None,
                user_type: item.owner.class().to_string(),
                user_id: item.owner.user_id().map(str::to_string),
            });
        }

        let file = Path::new(&item.path);
        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| ItemFailure::new(&item.path, Stage::Upload, "not a file path"))?;

        let checksum = file_checksum(file)
            .map_err(|err| ItemFailure::new(&item.path, Stage::Upload, err))?;

        let uri = self
            .store
            .put_file(&storage::image_path(&item.owner, &filename), file)
            .map_err(|err| ItemFailure::new(&item.path, Stage::Upload, err))?;

        log::info!("uploaded {} to {uri}", item.path);

        Ok(ImageRecord {
            uri,
            local_path: Some(item.path.clone()),
            checksum: Some(checksum),
            user_type: item.owner.class().to_string(),
            user_id: item.owner.user_id().map(str::to_string),
        })
    }

    /// Creates an empty marker object for a new owner namespace.
    fn ensure_owner_prefix(&self, owner: &Owner) {
        let prefix = storage::owner_prefix(owner);
        let created = self
            .store
            .exists(&prefix)
            .and_then(|exists| match exists {
                true => Ok(false),
                false => self.store.put(&prefix, b"", None).map(|_| true),
            });

        match created {
            Ok(true) => log::info!("created folder {prefix}"),
            Ok(false) => {}
            Err(err) => log::warn!("could not create folder {prefix}: {err}"),
        }
    }

    fn embed_all(
        &self,
        images: &[ImageRecord],
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Vec<Result<PersistedRecord, ItemFailure>> {
        let run = || {
            images
                .par_iter()
                .map(|image| self.embed_one(image, prefix, now))
                .collect::<Vec<_>>()
        };

        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    fn embed_one(
        &self,
        image: &ImageRecord,
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<PersistedRecord, ItemFailure> {
        let item = image.uri.to_string();
        let path = self
            .store
            .relative_path(&image.uri)
            .map_err(|err| ItemFailure::new(&item, Stage::Download, err))?;
        let owner = image
            .owner()
            .map_err(|err| ItemFailure::new(&item, Stage::Embed, err))?;

        // one scratch file per task, removed on drop
        let suffix = format!(".{}", image.uri.file_name().rsplit('.').next().unwrap_or("img"));
        let mut builder = tempfile::Builder::new();
        builder.prefix("imgsim-").suffix(&suffix);
        let scratch = match &self.options.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|err| ItemFailure::new(&item, Stage::Download, err))?;

        self.store
            .get_to_file(&path, scratch.path())
            .map_err(|err| ItemFailure::new(&item, Stage::Download, err))?;

        let embedding = self
            .embedder
            .embed_file(scratch.path())
            .map_err(|err| ItemFailure::new(&item, Stage::Embed, err))?;

        let record = EmbeddingRecord::new(embedding, &path, &owner, now);
        let json = record
            .to_json(Some(self.index.dimension).filter(|d| *d > 0))
            .map_err(|err| ItemFailure::new(&item, Stage::Persist, err))?;

        let record_path = storage::embedding_record_path(prefix, &record.id);
        let record_uri = self
            .store
            .put(&record_path, &json, Some("application/json"))
            .map_err(|err| ItemFailure::new(&item, Stage::Persist, err))?;

        log::debug!("persisted {record_uri} for {item}");

        Ok(PersistedRecord {
            id: record.id,
            record_uri,
            image_uri: image.uri.clone(),
        })
    }

    fn update_index(&self, prefix: &str) -> Result<IndexUpdateStatus, IngestError> {
        let delta_uri = self.store.uri(prefix).to_string();
        let fail = |source| IngestError::IndexUpdate {
            delta_uri: delta_uri.clone(),
            source,
        };

        log::info!(
            "updating index '{}' from {delta_uri}",
            self.index.display_name
        );
        let operation = self
            .service
            .update_embeddings(&self.index, &delta_uri, false)
            .map_err(fail)?;

        let operation = if operation.done {
            operation.into_result().map_err(fail)?
        } else if self.options.wait_for_update {
            OperationPoller::new(self.service.as_ref(), self.options.poll)
                .wait(operation, "index update")
                .map_err(fail)?
        } else {
            log::info!("index update submitted as {}", operation.name);
            return Ok(IndexUpdateStatus::Submitted {
                operation: operation.name,
            });
        };

        log::info!("index update {} completed", operation.name);
        Ok(IndexUpdateStatus::Completed {
            operation: operation.name,
        })
    }
}

/// Hex SHA-256 of a file's contents.
fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    std::io::copy(&mut std::fs::File::open(path)?, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Files directly inside `dir`, sorted by name.
fn list_directory(dir: &Path) -> Result<Vec<String>, IngestError> {
    let source = |source| IngestError::Source {
        path: dir.display().to_string(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(source)? {
        let path = entry.map_err(source)?.path();
        if path.is_file() {
            files.push(path.display().to_string());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_extensions() {
        assert!(has_image_extension("a.png"));
        assert!(has_image_extension("dir/b.JPG"));
        assert!(has_image_extension("c.Jpeg"));
        assert!(has_image_extension("gs://bucket/images/admin/d.gif"));
        assert!(!has_image_extension("e.webp"));
        assert!(!has_image_extension("notes.txt"));
        assert!(!has_image_extension("png"));
    }

    #[test]
    fn test_bulk_manifest_items() {
        let items: Vec<BulkItem> = serde_json::from_str(
            r#"[
                {"path": "a.png"},
                {"path": "b.png", "user_type": "user", "user_id": "7"}
            ]"#,
        )
        .unwrap();
        assert_eq!(items[0].owner, Owner::Admin);
        assert_eq!(items[1].owner, Owner::User("7".to_string()));

        let bad: Result<Vec<BulkItem>, _> =
            serde_json::from_str(r#"[{"path": "a.png", "user_type": "user"}]"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_list_directory_missing() {
        assert!(matches!(
            list_directory(Path::new("/nonexistent/dir")),
            Err(IngestError::Source { .. })
        ));
    }

    #[test]
    fn test_index_update_status_serialization() {
        let status = IndexUpdateStatus::Submitted {
            operation: "operations/1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"status": "submitted", "operation": "operations/1"})
        );
    }
}
