//! Managed approximate-nearest-neighbor index service.
//!
//! The index data structure, search algorithm and replica management all
//! live in the remote service; this module only describes how the crate talks
//! to it. Creating, deploying and updating are long-running remote
//! operations that return an [`Operation`] to be polled with
//! [`OperationPoller`].

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::records::Restrict;

mod operation;
mod vertex;

pub use operation::{OperationPoller, PollOptions};
pub use vertex::VertexClient;

#[derive(Debug, thiserror::Error)]
pub enum AnnError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("operation {name} failed ({code}): {message}")]
    OperationFailed {
        name: String,
        code: i32,
        message: String,
    },

    #[error("operation {name} did not finish within {waited_secs}s")]
    Timeout { name: String, waited_secs: u64 },

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index service returned {status}: {message}")]
    Remote { status: u16, message: String },
}

/// How distances reported by the service are to be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    DotProduct,
    Cosine,
    SquaredL2,
    L1,
}

impl DistanceMetric {
    /// Dot product and cosine report similarities; L1/L2 report distances.
    pub fn higher_is_closer(&self) -> bool {
        matches!(self, DistanceMetric::DotProduct | DistanceMetric::Cosine)
    }

    /// Orders `a` before `b` when `a` is the more relevant distance.
    pub fn compare(&self, a: f64, b: f64) -> std::cmp::Ordering {
        let ordering = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
        if self.higher_is_closer() {
            ordering.reverse()
        } else {
            ordering
        }
    }

    pub fn as_remote(&self) -> &'static str {
        match self {
            DistanceMetric::DotProduct => "DOT_PRODUCT_DISTANCE",
            DistanceMetric::Cosine => "COSINE_DISTANCE",
            DistanceMetric::SquaredL2 => "SQUARED_L2_DISTANCE",
            DistanceMetric::L1 => "L1_DISTANCE",
        }
    }

    pub fn from_remote(value: &str) -> Option<Self> {
        match value {
            "DOT_PRODUCT_DISTANCE" => Some(DistanceMetric::DotProduct),
            "COSINE_DISTANCE" => Some(DistanceMetric::Cosine),
            "SQUARED_L2_DISTANCE" => Some(DistanceMetric::SquaredL2),
            "L1_DISTANCE" => Some(DistanceMetric::L1),
            _ => None,
        }
    }
}

impl Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistanceMetric::DotProduct => "dot_product",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::SquaredL2 => "squared_l2",
            DistanceMetric::L1 => "l1",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "dot_product" | "dot" => Ok(DistanceMetric::DotProduct),
            "cosine" => Ok(DistanceMetric::Cosine),
            "squared_l2" | "l2" => Ok(DistanceMetric::SquaredL2),
            "l1" => Ok(DistanceMetric::L1),
            other => Err(format!("unknown distance metric '{other}'")),
        }
    }
}

/// A logical index, identified by its display name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexHandle {
    pub display_name: String,
    /// Full resource name, `projects/../locations/../indexes/{id}`.
    pub backing_index_id: String,
    pub dimension: usize,
    pub distance_metric: DistanceMetric,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeployedIndexRef {
    pub id: String,
    /// Resource name of the index served under `id`.
    pub index: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointHandle {
    pub display_name: String,
    /// Full resource name, `projects/../locations/../indexEndpoints/{id}`.
    pub backing_endpoint_id: String,
    /// Deployed index that queries go to. Set once resolved.
    pub deployed_index_id: Option<String>,
    pub public_endpoint_enabled: bool,
    /// Host serving queries for public endpoints.
    pub public_domain: Option<String>,
    #[serde(default)]
    pub deployed_indexes: Vec<DeployedIndexRef>,
}

impl EndpointHandle {
    /// Id under which `index` is deployed on this endpoint, if it is.
    pub fn deployment_of(&self, index: &IndexHandle) -> Option<&DeployedIndexRef> {
        self.deployed_indexes
            .iter()
            .find(|deployed| same_resource(&deployed.index, &index.backing_index_id))
    }
}

/// Last segment of a resource name; a bare id is returned as is.
pub fn resource_id(name: &str) -> &str {
    name.trim_end_matches('/').rsplit('/').next().unwrap_or(name)
}

/// Whether two resource names point at the same resource. The service
/// reports names under the project number while configured names usually
/// carry the project id, so only the trailing ids are compared.
pub fn same_resource(a: &str, b: &str) -> bool {
    resource_id(a) == resource_id(b)
}

/// Parameters for creating an index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpec {
    pub display_name: String,
    pub description: String,
    pub dimension: usize,
    pub distance_metric: DistanceMetric,
    pub approximate_neighbors_count: u32,
    pub shard_size: String,
    pub leaf_node_embedding_count: u32,
    pub leaf_nodes_to_search_percent: u32,
    /// Initial contents, if any.
    pub contents_delta_uri: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub machine_type: String,
    pub min_replica_count: u32,
    pub max_replica_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub code: i32,
    pub message: String,
}

/// Handle to a long-running remote operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub error: Option<OperationStatus>,
    /// Resource the operation created or modified, when reported.
    pub resource: Option<String>,
}

impl Operation {
    pub fn into_result(self) -> Result<Operation, AnnError> {
        match &self.error {
            Some(status) if self.done => Err(AnnError::OperationFailed {
                name: self.name.clone(),
                code: status.code,
                message: status.message.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// One neighbor of one query vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub distance: f64,
    #[serde(default)]
    pub restricts: Vec<Restrict>,
}

/// Index/endpoint management and querying.
///
/// All calls block until the remote service answers; long-running work is
/// returned as an [`Operation`] rather than waited for.
pub trait AnnService: Send + Sync {
    fn list_indexes(&self) -> Result<Vec<IndexHandle>, AnnError>;

    fn get_index(&self, name: &str) -> Result<IndexHandle, AnnError>;

    fn create_index(&self, spec: &IndexSpec) -> Result<Operation, AnnError>;

    fn list_endpoints(&self) -> Result<Vec<EndpointHandle>, AnnError>;

    fn get_endpoint(&self, name: &str) -> Result<EndpointHandle, AnnError>;

    fn create_endpoint(&self, display_name: &str, public: bool) -> Result<Operation, AnnError>;

    fn deploy_index(
        &self,
        endpoint: &EndpointHandle,
        index: &IndexHandle,
        deployed_index_id: &str,
        machine: &MachineSpec,
    ) -> Result<Operation, AnnError>;

    /// Folds the records under `delta_uri` into `index`. With
    /// `complete_overwrite` false, existing vectors are kept.
    fn update_embeddings(
        &self,
        index: &IndexHandle,
        delta_uri: &str,
        complete_overwrite: bool,
    ) -> Result<Operation, AnnError>;

    fn get_operation(&self, name: &str) -> Result<Operation, AnnError>;

    /// Nearest neighbors for each query vector, most relevant first.
    /// `filter` is handed to the service untouched.
    fn query_neighbors(
        &self,
        endpoint: &EndpointHandle,
        deployed_index_id: &str,
        vectors: &[Vec<f32>],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<Vec<Neighbor>>, AnnError>;
}
