use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ann::{DistanceMetric, MachineSpec, PollOptions};
use crate::embedding::{TensorLayout, DEFAULT_INPUT_SIZE};

const CONFIG_FILE: &str = "config.yaml";

/// Output size of the default EfficientNetV2 feature-vector network
const DEFAULT_DIMENSION: usize = 1280;
const DEFAULT_INDEX_NAME: &str = "image-similarity";
const DEFAULT_APPROXIMATE_NEIGHBORS: u32 = 50;
const DEFAULT_SHARD_SIZE: &str = "SHARD_SIZE_SMALL";
const DEFAULT_LEAF_NODE_EMBEDDING_COUNT: u32 = 500;
const DEFAULT_LEAF_NODES_TO_SEARCH_PERCENT: u32 = 7;
const DEFAULT_MACHINE_TYPE: &str = "e2-standard-2";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Gcs,
    Local,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub bucket: String,

    /// Overrides the storage API host, e.g. for an emulator
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Root directory of the `local` backend. Relative paths are resolved
    /// against the base directory.
    #[serde(default = "default_local_root")]
    pub local_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: String::new(),
            endpoint: None,
            local_root: default_local_root(),
        }
    }
}

fn default_local_root() -> String {
    "blobs".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_name")]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default)]
    pub distance_metric: DistanceMetric,

    #[serde(default = "default_approximate_neighbors")]
    pub approximate_neighbors_count: u32,

    #[serde(default = "default_shard_size")]
    pub shard_size: String,

    #[serde(default = "default_leaf_node_embedding_count")]
    pub leaf_node_embedding_count: u32,

    #[serde(default = "default_leaf_nodes_to_search_percent")]
    pub leaf_nodes_to_search_percent: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            display_name: default_index_name(),
            description: String::new(),
            dimension: default_dimension(),
            distance_metric: DistanceMetric::default(),
            approximate_neighbors_count: default_approximate_neighbors(),
            shard_size: default_shard_size(),
            leaf_node_embedding_count: default_leaf_node_embedding_count(),
            leaf_nodes_to_search_percent: default_leaf_nodes_to_search_percent(),
        }
    }
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}

fn default_approximate_neighbors() -> u32 {
    DEFAULT_APPROXIMATE_NEIGHBORS
}

fn default_shard_size() -> String {
    DEFAULT_SHARD_SIZE.to_string()
}

fn default_leaf_node_embedding_count() -> u32 {
    DEFAULT_LEAF_NODE_EMBEDDING_COUNT
}

fn default_leaf_nodes_to_search_percent() -> u32 {
    DEFAULT_LEAF_NODES_TO_SEARCH_PERCENT
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_true")]
    pub public: bool,

    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    #[serde(default = "default_one")]
    pub min_replica_count: u32,

    #[serde(default = "default_one")]
    pub max_replica_count: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            public: true,
            machine_type: default_machine_type(),
            min_replica_count: 1,
            max_replica_count: 1,
        }
    }
}

impl EndpointConfig {
    pub fn machine_spec(&self) -> MachineSpec {
        MachineSpec {
            machine_type: self.machine_type.clone(),
            min_replica_count: self.min_replica_count,
            max_replica_count: self.max_replica_count,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_machine_type() -> String {
    DEFAULT_MACHINE_TYPE.to_string()
}

/// Binds the process to one known production deployment instead of
/// discovering it by display name. Ids may be bare numeric ids or full
/// resource names.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConfig {
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub index: Option<String>,

    #[serde(default)]
    pub deployed_index_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// ONNX export of the feature-vector network. Relative paths are
    /// resolved against the base directory.
    #[serde(default = "default_model_path")]
    pub model_path: String,

    #[serde(default = "default_input_size")]
    pub input_size: u32,

    #[serde(default)]
    pub input_layout: TensorLayout,

    #[serde(default = "default_true")]
    pub l2_normalize: bool,

    #[serde(default = "default_one_usize")]
    pub intra_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_size: DEFAULT_INPUT_SIZE,
            input_layout: TensorLayout::default(),
            l2_normalize: true,
            intra_threads: 1,
        }
    }
}

fn default_model_path() -> String {
    "models/efficientnetv2_feature_vector.onnx".to_string()
}

fn default_input_size() -> u32 {
    DEFAULT_INPUT_SIZE
}

fn default_one_usize() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Parallelism for embedding generation: "auto" or a positive integer
    #[serde(default = "default_parallelism")]
    pub parallelism: String,

    /// Scratch area for downloads. Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<String>,

    /// Block until the index update operation finishes
    #[serde(default)]
    pub wait_for_update: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: default_parallelism(),
            scratch_dir: None,
            wait_for_update: false,
        }
    }
}

impl IngestConfig {
    /// Worker count for embedding; `None` means let rayon decide.
    pub fn workers(&self) -> Option<usize> {
        self.parallelism.parse::<usize>().ok().filter(|n| *n > 0)
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_parallelism() -> String {
    "auto".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// No timeout unless set; first deployments can take half an hour
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            timeout_secs: None,
        }
    }
}

impl OperationsConfig {
    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_secs(self.poll_interval_secs),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Environment variable holding an OAuth2 access token
    #[serde(default = "default_token_env")]
    pub access_token_env: String,

    /// Overrides the Vertex AI API host
    #[serde(default)]
    pub api_endpoint: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            access_token_env: default_token_env(),
            api_endpoint: None,
        }
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub canonical: CanonicalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub web: WebConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

fn default_location() -> String {
    "us-central1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            location: default_location(),
            storage: StorageConfig::default(),
            index: IndexConfig::default(),
            endpoint: EndpointConfig::default(),
            canonical: CanonicalConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingest: IngestConfig::default(),
            operations: OperationsConfig::default(),
            credentials: CredentialsConfig::default(),
            web: WebConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.display_name.trim().is_empty() {
            return Err(ConfigError::invalid("index.display_name", "must not be empty"));
        }
        if self.index.dimension == 0 {
            return Err(ConfigError::invalid("index.dimension", "must be greater than 0"));
        }
        if self.index.approximate_neighbors_count == 0 {
            return Err(ConfigError::invalid(
                "index.approximate_neighbors_count",
                "must be greater than 0",
            ));
        }
        if self.endpoint.min_replica_count == 0
            || self.endpoint.max_replica_count < self.endpoint.min_replica_count
        {
            return Err(ConfigError::invalid(
                "endpoint.min_replica_count",
                format!(
                    "need 1 <= min ({}) <= max ({})",
                    self.endpoint.min_replica_count, self.endpoint.max_replica_count
                ),
            ));
        }
        if self.embedding.input_size == 0 {
            return Err(ConfigError::invalid("embedding.input_size", "must be greater than 0"));
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigError::invalid("ingest.batch_size", "must be greater than 0"));
        }

        // "auto" or positive integer
        if self.ingest.parallelism != "auto" {
            match self.ingest.parallelism.parse::<u32>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::invalid(
                        "ingest.parallelism",
                        format!(
                            "must be 'auto' or a positive integer, got '{}'",
                            self.ingest.parallelism
                        ),
                    ))
                }
                Ok(_) => {}
            }
        }

        if self.operations.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "operations.poll_interval_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Checks what remote access needs; local-only commands skip this.
    pub fn validate_remote(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::invalid("project_id", "must be set"));
        }
        if self.location.trim().is_empty() {
            return Err(ConfigError::invalid("location", "must be set"));
        }
        if self.storage.backend == StorageBackend::Gcs && self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::invalid("storage.bucket", "must be set for the gcs backend"));
        }
        Ok(())
    }

    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            std::fs::create_dir_all(base_path)?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)?;
            log::info!("wrote default config to {}", path.display());
        }

        let config_str = std::fs::read_to_string(&path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        let path = self.base_path.join(CONFIG_FILE);
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, config_str)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolves a configured path against the base directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn scope(&self) -> String {
        format!("projects/{}/locations/{}", self.project_id, self.location)
    }

    fn qualify(&self, collection: &str, id: &str) -> String {
        if id.contains('/') {
            id.to_string()
        } else {
            format!("{}/{collection}/{id}", self.scope())
        }
    }

    pub fn canonical_endpoint(&self) -> Option<String> {
        self.canonical
            .endpoint
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| self.qualify("indexEndpoints", id.trim()))
    }

    pub fn canonical_index(&self) -> Option<String> {
        self.canonical
            .index
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| self.qualify("indexes", id.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_written_and_valid() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join("config.yaml").exists());
        assert_eq!(config.index.dimension, 1280);
        assert_eq!(config.index.distance_metric, DistanceMetric::DotProduct);
        assert_eq!(config.ingest.batch_size, 100);
        assert_eq!(config.endpoint.machine_type, "e2-standard-2");
        assert_eq!(config.operations.timeout_secs, None);
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "project_id: sisterly\nindex:\n  display_name: photos\n  dimension: 512\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.project_id, "sisterly");
        assert_eq!(config.index.display_name, "photos");
        assert_eq!(config.index.dimension, 512);
        assert_eq!(config.index.approximate_neighbors_count, 50);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.ingest.parallelism = "0".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "ingest.parallelism", .. })
        ));

        config.ingest.parallelism = "4".to_string();
        config.ingest.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "index: [1, 2").unwrap();
        assert!(matches!(
            Config::load_with(dir.path()),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn test_canonical_ids_are_qualified() {
        let mut config = Config::default();
        config.project_id = "p".to_string();
        config.location = "asia-northeast1".to_string();
        config.canonical.endpoint = Some("5566554692546199552".to_string());
        config.canonical.index = Some("projects/1/locations/l/indexes/7".to_string());

        assert_eq!(
            config.canonical_endpoint().as_deref(),
            Some("projects/p/locations/asia-northeast1/indexEndpoints/5566554692546199552")
        );
        assert_eq!(
            config.canonical_index().as_deref(),
            Some("projects/1/locations/l/indexes/7")
        );

        config.canonical.endpoint = Some("  ".to_string());
        assert_eq!(config.canonical_endpoint(), None);
    }

    #[test]
    fn test_parallelism_workers() {
        let mut ingest = IngestConfig::default();
        assert_eq!(ingest.workers(), None);
        ingest.parallelism = "3".to_string();
        assert_eq!(ingest.workers(), Some(3));
    }
}
