//! Wiring: builds every component from the config and exposes the
//! operations the CLI and the HTTP server share.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use homedir::my_home;

use crate::ann::{AnnError, AnnService, VertexClient};
use crate::config::{Config, StorageBackend};
use crate::embedding::{
    EmbeddingError, EmbeddingGenerator, ImageEmbedder, OnnxFeatureExtractor, Preprocessor,
};
use crate::ingest::{
    BulkItem, BulkReport, IngestError, IngestOptions, IngestReport, IngestSource,
    IngestionPipeline,
};
use crate::lifecycle::{
    Deployment, IndexLifecycleManager, LifecycleError, LifecycleSettings, DEPLOYMENT_FILE,
};
use crate::query::{MaterializeReport, QueryEngine, QueryError, ResultMaterializer, SearchResult};
use crate::records::Owner;
use crate::storage::{BlobStore, GcsBlobStore, LocalBlobStore};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

type EmbedderLoader =
    Box<dyn Fn() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send + Sync>;

pub struct App {
    config: Config,
    store: Arc<dyn BlobStore>,
    service: Arc<dyn AnnService>,
    load_embedder: EmbedderLoader,
    // loading the model is the expensive step, done once on first use
    embedder: Mutex<Option<Arc<dyn ImageEmbedder>>>,
    deployment: Mutex<Option<Deployment>>,
}

impl App {
    pub fn new(
        config: Config,
        store: Arc<dyn BlobStore>,
        service: Arc<dyn AnnService>,
        load_embedder: EmbedderLoader,
    ) -> Self {
        Self {
            config,
            store,
            service,
            load_embedder,
            embedder: Mutex::new(None),
            deployment: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn deployment_path(&self) -> PathBuf {
        self.config.base_path().join(DEPLOYMENT_FILE)
    }

    pub fn embedder(&self) -> Result<Arc<dyn ImageEmbedder>, AppError> {
        let mut slot = self
            .embedder
            .lock()
            .map_err(|_| EmbeddingError::InitFailed("embedder lock poisoned".to_string()))?;

        if let Some(embedder) = slot.as_ref() {
            return Ok(embedder.clone());
        }

        let embedder = (self.load_embedder)()?;
        if embedder.dimensions() != self.config.index.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.index.dimension,
                got: embedder.dimensions(),
            }
            .into());
        }

        *slot = Some(embedder.clone());
        Ok(embedder)
    }

    pub fn lifecycle(&self) -> IndexLifecycleManager {
        IndexLifecycleManager::new(
            self.service.clone(),
            self.config.operations.poll_options(),
            LifecycleSettings::from_config(&self.config),
        )
    }

    /// Resolves the deployment remotely and persists it.
    pub fn initialize(&self) -> Result<Deployment, AppError> {
        let index = &self.config.index;
        let deployment = self.lifecycle().initialize(
            &index.display_name,
            index.dimension,
            index.distance_metric,
            index.approximate_neighbors_count,
        )?;

        deployment.save(&self.deployment_path())?;
        log::info!(
            "deployment saved: endpoint {} serves {} as {}",
            deployment.endpoint.backing_endpoint_id,
            deployment.index.backing_index_id,
            deployment.deployed_index_id
        );

        if let Ok(mut cached) = self.deployment.lock() {
            *cached = Some(deployment.clone());
        }
        Ok(deployment)
    }

    /// Cached deployment, else the persisted one. Remote resources are only
    /// created by [`App::initialize`].
    pub fn deployment(&self) -> Result<Deployment, AppError> {
        if let Some(deployment) = self.deployment.lock().ok().and_then(|d| d.clone()) {
            return Ok(deployment);
        }

        match Deployment::load(&self.deployment_path())? {
            Some(deployment) if deployment.index.display_name == self.config.index.display_name => {
                if let Ok(mut cached) = self.deployment.lock() {
                    *cached = Some(deployment.clone());
                }
                Ok(deployment)
            }
            Some(stale) => {
                log::warn!(
                    "saved deployment is for index '{}', not '{}'",
                    stale.index.display_name,
                    self.config.index.display_name
                );
                Err(LifecycleError::NotInitialized.into())
            }
            None => Err(LifecycleError::NotInitialized.into()),
        }
    }

    /// Persisted deployment only; never creates remote resources.
    pub fn saved_deployment(&self) -> Result<Option<Deployment>, AppError> {
        Ok(Deployment::load(&self.deployment_path())?)
    }

    fn pipeline(&self) -> Result<IngestionPipeline, AppError> {
        let deployment = self.deployment()?;
        let ingest = &self.config.ingest;

        let options = IngestOptions {
            batch_size: ingest.batch_size,
            workers: ingest.workers(),
            scratch_dir: ingest
                .scratch_dir
                .as_deref()
                .map(|dir| self.config.resolve_path(dir)),
            wait_for_update: ingest.wait_for_update,
            poll: self.config.operations.poll_options(),
        };
        if let Some(dir) = &options.scratch_dir {
            std::fs::create_dir_all(dir)?;
        }

        Ok(IngestionPipeline::new(
            self.store.clone(),
            self.embedder()?,
            self.service.clone(),
            deployment.index,
            options,
        ))
    }

    pub fn ingest(&self, source: IngestSource, owner: &Owner) -> Result<IngestReport, AppError> {
        Ok(self.pipeline()?.ingest(source, owner)?)
    }

    pub fn bulk_index(
        &self,
        items: &[BulkItem],
        batch_size: Option<usize>,
    ) -> Result<BulkReport, AppError> {
        Ok(self.pipeline()?.bulk_index(items, batch_size))
    }

    fn query_engine(&self) -> Result<QueryEngine, AppError> {
        Ok(QueryEngine::new(
            self.embedder()?,
            self.service.clone(),
            self.deployment()?,
        ))
    }

    pub fn search(
        &self,
        query_image: &Path,
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchResult>, AppError> {
        Ok(self.query_engine()?.search(query_image, k, filter)?)
    }

    pub fn search_bytes(
        &self,
        data: &[u8],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchResult>, AppError> {
        Ok(self.query_engine()?.search_bytes(data, k, filter)?)
    }

    pub fn materialize(
        &self,
        results: &[SearchResult],
        out_dir: &Path,
    ) -> Result<MaterializeReport, AppError> {
        Ok(ResultMaterializer::new(self.store.clone()).materialize(results, out_dir)?)
    }
}

impl AppError {
    /// Whether the caller sent something unusable, as opposed to a failure
    /// on our side or the remote service's.
    pub fn is_client_error(&self) -> bool {
        match self {
            AppError::BadRequest(_) => true,
            AppError::Query(QueryError::Embedding(err)) | AppError::Embedding(err) => {
                matches!(err, EmbeddingError::Decode(_))
            }
            AppError::Query(QueryError::Remote(AnnError::InvalidFilter(_))) => true,
            _ => false,
        }
    }
}

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Get the base path for the application
    pub fn base_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("IMGSIM_BASE_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/imgsim"))
    }

    pub fn load_config() -> Result<Config> {
        let base_path = Self::base_path()?;
        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;
        Config::load_with(&base_path).context("Failed to load config")
    }

    pub fn create_app(config: Config) -> Result<App> {
        let store = Self::create_store(&config)?;
        let service = Self::create_service(&config)?;

        let embedding = config.embedding.clone();
        let model_path = config.resolve_path(&embedding.model_path);
        let load_embedder: EmbedderLoader = Box::new(move || {
            let extractor = OnnxFeatureExtractor::load(&model_path, embedding.intra_threads)?;
            let generator = EmbeddingGenerator::new(
                Box::new(extractor),
                Preprocessor::new(embedding.input_size, embedding.input_layout),
                embedding.l2_normalize,
            )?;
            Ok(Arc::new(generator) as Arc<dyn ImageEmbedder>)
        });

        Ok(App::new(config, store, service, load_embedder))
    }

    /// Access token from the configured environment variable. Read once,
    /// here, and handed to the clients.
    fn access_token(config: &Config) -> Result<String> {
        let var = &config.credentials.access_token_env;
        std::env::var(var)
            .with_context(|| format!("{var} is not set; export an OAuth2 access token"))
    }

    fn create_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
        match config.storage.backend {
            StorageBackend::Local => {
                let root = config.resolve_path(&config.storage.local_root);
                let bucket = match config.storage.bucket.trim() {
                    "" => "local",
                    bucket => bucket,
                };
                log::info!("using local blob store at {}", root.display());
                let store = LocalBlobStore::new(&root, bucket)
                    .context("Failed to create local blob store")?;
                Ok(Arc::new(store))
            }
            StorageBackend::Gcs => {
                config.validate_remote()?;
                let token = Self::access_token(config)?;
                Ok(Arc::new(GcsBlobStore::new(
                    &config.storage.bucket,
                    config.storage.endpoint.as_deref(),
                    &token,
                )))
            }
        }
    }

    fn create_service(config: &Config) -> Result<Arc<dyn AnnService>> {
        config.validate_remote()?;
        let token = Self::access_token(config)?;
        Ok(Arc::new(VertexClient::new(
            &config.project_id,
            &config.location,
            config.credentials.api_endpoint.as_deref(),
            &token,
        )))
    }
}
