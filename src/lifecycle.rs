//! Index and endpoint lifecycle.
//!
//! Resolves the one logical index (keyed by display name) and the endpoint
//! serving it, creating and deploying whatever is missing. Remote resources
//! outlive the process; a resolved [`Deployment`] is persisted so later runs
//! can query without rediscovering it.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ann::{
    same_resource, AnnError, AnnService, DistanceMetric, EndpointHandle, IndexHandle, IndexSpec,
    MachineSpec, Operation, OperationPoller, PollOptions,
};
use crate::config::Config;

pub const DEPLOYMENT_FILE: &str = "deployment.json";

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{step} failed: {source}")]
    Remote {
        step: &'static str,
        #[source]
        source: AnnError,
    },

    #[error("index '{display_name}' has {existing} dimensions, requested {requested}")]
    DimensionMismatch {
        display_name: String,
        existing: usize,
        requested: usize,
    },

    #[error("{step} finished but no {kind} named '{display_name}' was found")]
    Missing {
        step: &'static str,
        kind: &'static str,
        display_name: String,
    },

    #[error("no deployment resolved yet, run `init` first")]
    NotInitialized,

    #[error("failed to access deployment state: {0}")]
    StateIo(#[from] std::io::Error),

    #[error("deployment state is malformed: {0}")]
    StateMalformed(#[from] serde_json::Error),
}

fn remote(step: &'static str) -> impl FnOnce(AnnError) -> LifecycleError {
    move |source| LifecycleError::Remote { step, source }
}

/// Index-side settings not covered by the lookup key.
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub description: String,
    pub shard_size: String,
    pub leaf_node_embedding_count: u32,
    pub leaf_nodes_to_search_percent: u32,
    pub public_endpoint: bool,
    pub machine: MachineSpec,
    pub canonical_endpoint: Option<String>,
    pub canonical_index: Option<String>,
    pub canonical_deployed_index_id: Option<String>,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            description: config.index.description.clone(),
            shard_size: config.index.shard_size.clone(),
            leaf_node_embedding_count: config.index.leaf_node_embedding_count,
            leaf_nodes_to_search_percent: config.index.leaf_nodes_to_search_percent,
            public_endpoint: config.endpoint.public,
            machine: config.endpoint.machine_spec(),
            canonical_endpoint: config.canonical_endpoint(),
            canonical_index: config.canonical_index(),
            canonical_deployed_index_id: config
                .canonical
                .deployed_index_id
                .clone()
                .filter(|id| !id.trim().is_empty()),
        }
    }
}

/// A queryable index: the index, the endpoint serving it, and the deployed
/// index id every query needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub index: IndexHandle,
    pub endpoint: EndpointHandle,
    pub deployed_index_id: String,
    pub resolved_at: DateTime<Utc>,
}

impl Deployment {
    fn new(index: IndexHandle, mut endpoint: EndpointHandle, deployed_index_id: String) -> Self {
        endpoint.deployed_index_id = Some(deployed_index_id.clone());
        Self {
            index,
            endpoint,
            deployed_index_id,
            resolved_at: Utc::now(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), LifecycleError> {
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>, LifecycleError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

/// Deployed index ids must start with a letter and contain only letters,
/// digits and underscores.
pub fn deployed_index_id(index_display_name: &str, at: DateTime<Utc>) -> String {
    let suffix = format!("{:08x}", rand::random::<u32>());
    let raw = format!(
        "{index_display_name}_deployed_{}_{suffix}",
        at.format("%Y%m%d_%H%M%S")
    );

    let mut id: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        id.insert_str(0, "d_");
    }
    id
}

pub struct IndexLifecycleManager {
    service: Arc<dyn AnnService>,
    poll: PollOptions,
    settings: LifecycleSettings,
}

impl IndexLifecycleManager {
    pub fn new(service: Arc<dyn AnnService>, poll: PollOptions, settings: LifecycleSettings) -> Self {
        Self {
            service,
            poll,
            settings,
        }
    }

    fn wait(&self, operation: Operation, step: &'static str) -> Result<Operation, LifecycleError> {
        OperationPoller::new(self.service.as_ref(), self.poll)
            .wait(operation, step)
            .map_err(remote(step))
    }

    fn find_index(&self, display_name: &str) -> Result<Option<IndexHandle>, LifecycleError> {
        let mut matches: Vec<_> = self
            .service
            .list_indexes()
            .map_err(remote("list indexes"))?
            .into_iter()
            .filter(|index| index.display_name == display_name)
            .collect();

        if matches.len() > 1 {
            log::warn!(
                "{} indexes are named '{display_name}', using {}",
                matches.len(),
                matches[0].backing_index_id
            );
        }
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.swap_remove(0))
        })
    }

    fn find_endpoint(&self, display_name: &str) -> Result<Option<EndpointHandle>, LifecycleError> {
        Ok(self
            .service
            .list_endpoints()
            .map_err(remote("list endpoints"))?
            .into_iter()
            .find(|endpoint| endpoint.display_name == display_name))
    }

    /// Looks the index up by display name and creates it if missing. Blocks
    /// until creation finishes.
    pub fn get_or_create_index(
        &self,
        display_name: &str,
        dimension: usize,
        metric: DistanceMetric,
        approximate_neighbors_count: u32,
    ) -> Result<IndexHandle, LifecycleError> {
        if let Some(index) = self.find_index(display_name)? {
            log::info!(
                "using existing index '{display_name}' ({})",
                index.backing_index_id
            );
            return check_dimension(index, dimension);
        }

        log::info!("creating index '{display_name}' ({dimension} dimensions, {metric})");
        let spec = IndexSpec {
            display_name: display_name.to_string(),
            description: self.settings.description.clone(),
            dimension,
            distance_metric: metric,
            approximate_neighbors_count,
            shard_size: self.settings.shard_size.clone(),
            leaf_node_embedding_count: self.settings.leaf_node_embedding_count,
            leaf_nodes_to_search_percent: self.settings.leaf_nodes_to_search_percent,
            contents_delta_uri: None,
        };

        let operation = match self.service.create_index(&spec) {
            Ok(operation) => operation,
            Err(AnnError::AlreadyExists(_)) => {
                log::info!("index '{display_name}' was created concurrently, reusing it");
                let index = self.find_index(display_name)?.ok_or(LifecycleError::Missing {
                    step: "create index",
                    kind: "index",
                    display_name: display_name.to_string(),
                })?;
                return check_dimension(index, dimension);
            }
            Err(err) => return Err(remote("create index")(err)),
        };

        let done = self.wait(operation, "create index")?;
        let index = match done.resource {
            Some(name) => self.service.get_index(&name).map_err(remote("get index"))?,
            None => self.find_index(display_name)?.ok_or(LifecycleError::Missing {
                step: "create index",
                kind: "index",
                display_name: display_name.to_string(),
            })?,
        };

        log::info!("created index '{display_name}' ({})", index.backing_index_id);
        check_dimension(index, dimension)
    }

    /// Looks up `{index}-endpoint`, creating it if missing, and makes sure
    /// `index` is deployed on it. The returned handle carries the deployed
    /// index id.
    pub fn get_or_create_endpoint(
        &self,
        index: &IndexHandle,
    ) -> Result<EndpointHandle, LifecycleError> {
        let display_name = format!("{}-endpoint", index.display_name);

        let endpoint = match self.find_endpoint(&display_name)? {
            Some(endpoint) => {
                log::info!(
                    "using existing endpoint '{display_name}' ({})",
                    endpoint.backing_endpoint_id
                );
                endpoint
            }
            None => self.create_endpoint(&display_name)?,
        };

        if let Some(deployed) = endpoint.deployment_of(index) {
            let id = deployed.id.clone();
            log::info!("index is deployed on '{display_name}' as {id}");
            let mut endpoint = endpoint;
            endpoint.deployed_index_id = Some(id);
            return Ok(endpoint);
        }

        self.deploy(endpoint, index)
    }

    fn create_endpoint(&self, display_name: &str) -> Result<EndpointHandle, LifecycleError> {
        log::info!("creating endpoint '{display_name}'");

        let operation = match self
            .service
            .create_endpoint(display_name, self.settings.public_endpoint)
        {
            Ok(operation) => operation,
            Err(AnnError::AlreadyExists(_)) => {
                log::info!("endpoint '{display_name}' was created concurrently, reusing it");
                return self.find_endpoint(display_name)?.ok_or(LifecycleError::Missing {
                    step: "create endpoint",
                    kind: "endpoint",
                    display_name: display_name.to_string(),
                });
            }
            Err(err) => return Err(remote("create endpoint")(err)),
        };

        let done = self.wait(operation, "create endpoint")?;
        let endpoint = match done.resource {
            Some(name) => self
                .service
                .get_endpoint(&name)
                .map_err(remote("get endpoint"))?,
            None => self.find_endpoint(display_name)?.ok_or(LifecycleError::Missing {
                step: "create endpoint",
                kind: "endpoint",
                display_name: display_name.to_string(),
            })?,
        };

        log::info!(
            "created endpoint '{display_name}' ({})",
            endpoint.backing_endpoint_id
        );
        Ok(endpoint)
    }

    fn deploy(
        &self,
        endpoint: EndpointHandle,
        index: &IndexHandle,
    ) -> Result<EndpointHandle, LifecycleError> {
        let id = deployed_index_id(&index.display_name, Utc::now());
        log::info!(
            "deploying index '{}' to '{}' as {id} on {}",
            index.display_name,
            endpoint.display_name,
            self.settings.machine.machine_type
        );

        let operation = self
            .service
            .deploy_index(&endpoint, index, &id, &self.settings.machine)
            .map_err(remote("deploy index"))?;
        self.wait(operation, "deploy index")?;

        // refresh for the public domain, which is only assigned after the
        // first deployment
        let mut endpoint = self
            .service
            .get_endpoint(&endpoint.backing_endpoint_id)
            .map_err(remote("get endpoint"))?;
        endpoint.deployed_index_id = Some(id);
        Ok(endpoint)
    }

    /// Binds to the configured canonical endpoint, if there is one and it
    /// serves a usable index.
    fn canonical(&self, dimension: usize) -> Result<Option<Deployment>, LifecycleError> {
        let Some(endpoint_name) = &self.settings.canonical_endpoint else {
            return Ok(None);
        };

        let endpoint = match self.service.get_endpoint(endpoint_name) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                log::warn!("canonical endpoint {endpoint_name} unavailable: {err}");
                return Ok(None);
            }
        };

        let deployed = endpoint.deployed_indexes.iter().find(|deployed| {
            match (
                &self.settings.canonical_deployed_index_id,
                &self.settings.canonical_index,
            ) {
                (Some(id), _) => &deployed.id == id,
                (None, Some(index)) => same_resource(&deployed.index, index),
                (None, None) => true,
            }
        });
        let Some(deployed) = deployed.cloned() else {
            log::warn!("canonical endpoint {endpoint_name} has no matching deployed index");
            return Ok(None);
        };

        let index = match self.service.get_index(&deployed.index) {
            Ok(index) => index,
            Err(err) => {
                log::warn!("index {} behind canonical endpoint unavailable: {err}", deployed.index);
                return Ok(None);
            }
        };
        let index = check_dimension(index, dimension)?;

        log::info!(
            "using canonical endpoint {} with deployed index {}",
            endpoint.backing_endpoint_id,
            deployed.id
        );
        Ok(Some(Deployment::new(index, endpoint, deployed.id)))
    }

    /// Resolves the deployment: canonical endpoint first, then
    /// find-or-create by display name.
    pub fn initialize(
        &self,
        display_name: &str,
        dimension: usize,
        metric: DistanceMetric,
        approximate_neighbors_count: u32,
    ) -> Result<Deployment, LifecycleError> {
        if let Some(deployment) = self.canonical(dimension)? {
            return Ok(deployment);
        }

        let index =
            self.get_or_create_index(display_name, dimension, metric, approximate_neighbors_count)?;
        let endpoint = self.get_or_create_endpoint(&index)?;
        let deployed_index_id = endpoint
            .deployed_index_id
            .clone()
            .ok_or(LifecycleError::Missing {
                step: "deploy index",
                kind: "deployed index",
                display_name: display_name.to_string(),
            })?;

        Ok(Deployment::new(index, endpoint, deployed_index_id))
    }
}

fn check_dimension(index: IndexHandle, requested: usize) -> Result<IndexHandle, LifecycleError> {
    // indexes created without a config report 0
    if index.dimension != 0 && index.dimension != requested {
        return Err(LifecycleError::DimensionMismatch {
            display_name: index.display_name,
            existing: index.dimension,
            requested,
        });
    }
    Ok(index)
}
