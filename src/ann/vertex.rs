//! Vertex AI Vector Search over its REST API (v1).

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use super::{
    AnnError, AnnService, DeployedIndexRef, DistanceMetric, EndpointHandle, IndexHandle,
    IndexSpec, MachineSpec, Neighbor, Operation, OperationStatus,
};
use crate::records::Restrict;

pub struct VertexClient {
    project_id: String,
    location: String,
    api_endpoint: String,
    access_token: String,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIndex {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    metadata: RawIndexMetadata,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawIndexMetadata {
    #[serde(default)]
    config: RawIndexConfig,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawIndexConfig {
    #[serde(default)]
    dimensions: usize,
    distance_measure_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEndpoint {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    public_endpoint_enabled: bool,
    public_endpoint_domain_name: Option<String>,
    #[serde(default)]
    deployed_indexes: Vec<RawDeployedIndex>,
}

#[derive(Deserialize)]
struct RawDeployedIndex {
    id: String,
    index: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOperation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<RawStatus>,
    response: Option<Value>,
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindNeighborsResponse {
    #[serde(default)]
    nearest_neighbors: Vec<RawNearestNeighbors>,
}

#[derive(Deserialize)]
struct RawNearestNeighbors {
    #[serde(default)]
    neighbors: Vec<RawNeighbor>,
}

#[derive(Deserialize)]
struct RawNeighbor {
    datapoint: RawDatapoint,
    #[serde(default)]
    distance: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDatapoint {
    datapoint_id: String,
    #[serde(default)]
    restricts: Vec<RawRestrict>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRestrict {
    namespace: String,
    #[serde(default)]
    allow_list: Vec<String>,
}

impl RawIndex {
    fn into_handle(self) -> IndexHandle {
        let distance_metric = self
            .metadata
            .config
            .distance_measure_type
            .as_deref()
            .and_then(DistanceMetric::from_remote)
            .unwrap_or_default();

        IndexHandle {
            display_name: self.display_name,
            backing_index_id: self.name,
            dimension: self.metadata.config.dimensions,
            distance_metric,
        }
    }
}

impl RawEndpoint {
    fn into_handle(self) -> EndpointHandle {
        EndpointHandle {
            display_name: self.display_name,
            backing_endpoint_id: self.name,
            deployed_index_id: None,
            public_endpoint_enabled: self.public_endpoint_enabled,
            public_domain: self.public_endpoint_domain_name.filter(|d| !d.is_empty()),
            deployed_indexes: self
                .deployed_indexes
                .into_iter()
                .map(|d| DeployedIndexRef {
                    id: d.id,
                    index: d.index,
                })
                .collect(),
        }
    }
}

impl RawOperation {
    fn into_operation(self) -> Operation {
        let resource = self
            .response
            .as_ref()
            .and_then(|response| response.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Operation {
            name: self.name,
            done: self.done,
            error: self.error.map(|status| OperationStatus {
                code: status.code,
                message: status.message,
            }),
            resource,
        }
    }
}

impl VertexClient {
    pub fn new(
        project_id: &str,
        location: &str,
        api_endpoint: Option<&str>,
        access_token: &str,
    ) -> Self {
        let api_endpoint = api_endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com"));

        VertexClient {
            project_id: project_id.to_string(),
            location: location.to_string(),
            api_endpoint,
            access_token: access_token.to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }

    fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project_id, self.location)
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{resource}", self.api_endpoint)
    }

    fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::blocking::RequestBuilder,
        what: &str,
    ) -> Result<T, AnnError> {
        let response = request.bearer_auth(&self.access_token).send()?;
        let status = response.status();
        let text = response.text()?;

        if !status.is_success() {
            log::debug!("{what}: {status} {text}");
            return Err(match status {
                reqwest::StatusCode::NOT_FOUND => AnnError::NotFound(what.to_string()),
                reqwest::StatusCode::CONFLICT => AnnError::AlreadyExists(what.to_string()),
                _ => AnnError::Remote {
                    status: status.as_u16(),
                    message: text,
                },
            });
        }

        serde_json::from_str(&text).map_err(|err| {
            log::error!("{err}. tried to parse: {text:?}");
            AnnError::UnexpectedResponse(format!("{what}: {err}"))
        })
    }

    /// Follows `nextPageToken` until every item of a list call is collected.
    fn list_all<T: DeserializeOwned>(&self, collection: &str, field: &str) -> Result<Vec<T>, AnnError> {
        let url = self.url(&format!("{}/{collection}", self.parent()));
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let mut page: Value = self.send(request, collection)?;
            if let Some(list) = page.get_mut(field).map(Value::take) {
                let batch: Vec<T> = serde_json::from_value(list)
                    .map_err(|e| AnnError::UnexpectedResponse(format!("{collection}: {e}")))?;
                items.extend(batch);
            }

            match page.get("nextPageToken").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(items)
    }

    fn query_url(&self, endpoint: &EndpointHandle) -> String {
        match (&endpoint.public_domain, endpoint.public_endpoint_enabled) {
            (Some(domain), true) => format!(
                "https://{domain}/v1/{}:findNeighbors",
                endpoint.backing_endpoint_id
            ),
            _ => self.url(&format!("{}:findNeighbors", endpoint.backing_endpoint_id)),
        }
    }
}

/// Parses a filter expression: a JSON list of restricts in the service's
/// own format, e.g. `[{"namespace": "user_type", "allowList": ["admin"]}]`.
fn parse_filter(filter: &str) -> Result<Value, AnnError> {
    let value: Value =
        serde_json::from_str(filter).map_err(|e| AnnError::InvalidFilter(e.to_string()))?;
    if !value.is_array() {
        return Err(AnnError::InvalidFilter(
            "expected a JSON array of restricts".to_string(),
        ));
    }
    Ok(value)
}

impl AnnService for VertexClient {
    fn list_indexes(&self) -> Result<Vec<IndexHandle>, AnnError> {
        let raw: Vec<RawIndex> = self.list_all("indexes", "indexes")?;
        Ok(raw.into_iter().map(RawIndex::into_handle).collect())
    }

    fn get_index(&self, name: &str) -> Result<IndexHandle, AnnError> {
        let raw: RawIndex = self.send(self.client.get(self.url(name)), name)?;
        Ok(raw.into_handle())
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<Operation, AnnError> {
        let mut metadata = json!({
            "config": {
                "dimensions": spec.dimension,
                "approximateNeighborsCount": spec.approximate_neighbors_count,
                "distanceMeasureType": spec.distance_metric.as_remote(),
                "shardSize": spec.shard_size,
                "algorithmConfig": {
                    "treeAhConfig": {
                        "leafNodeEmbeddingCount": spec.leaf_node_embedding_count,
                        "leafNodesToSearchPercent": spec.leaf_nodes_to_search_percent,
                    }
                }
            }
        });
        if let Some(uri) = &spec.contents_delta_uri {
            metadata["contentsDeltaUri"] = json!(uri);
        }

        let body = json!({
            "displayName": spec.display_name,
            "description": spec.description,
            "metadata": metadata,
            "indexUpdateMethod": "BATCH_UPDATE",
        });

        let url = self.url(&format!("{}/indexes", self.parent()));
        let raw: RawOperation = self.send(self.client.post(url).json(&body), "create index")?;
        Ok(raw.into_operation())
    }

    fn list_endpoints(&self) -> Result<Vec<EndpointHandle>, AnnError> {
        let raw: Vec<RawEndpoint> = self.list_all("indexEndpoints", "indexEndpoints")?;
        Ok(raw.into_iter().map(RawEndpoint::into_handle).collect())
    }

    fn get_endpoint(&self, name: &str) -> Result<EndpointHandle, AnnError> {
        let raw: RawEndpoint = self.send(self.client.get(self.url(name)), name)?;
        Ok(raw.into_handle())
    }

    fn create_endpoint(&self, display_name: &str, public: bool) -> Result<Operation, AnnError> {
        let body = json!({
            "displayName": display_name,
            "publicEndpointEnabled": public,
        });

        let url = self.url(&format!("{}/indexEndpoints", self.parent()));
        let raw: RawOperation = self.send(self.client.post(url).json(&body), "create endpoint")?;
        Ok(raw.into_operation())
    }

    fn deploy_index(
        &self,
        endpoint: &EndpointHandle,
        index: &IndexHandle,
        deployed_index_id: &str,
        machine: &MachineSpec,
    ) -> Result<Operation, AnnError> {
        let body = json!({
            "deployedIndex": {
                "id": deployed_index_id,
                "index": index.backing_index_id,
                "dedicatedResources": {
                    "machineSpec": { "machineType": machine.machine_type },
                    "minReplicaCount": machine.min_replica_count,
                    "maxReplicaCount": machine.max_replica_count,
                }
            }
        });

        let url = self.url(&format!("{}:deployIndex", endpoint.backing_endpoint_id));
        let raw: RawOperation = self.send(self.client.post(url).json(&body), "deploy index")?;
        Ok(raw.into_operation())
    }

    fn update_embeddings(
        &self,
        index: &IndexHandle,
        delta_uri: &str,
        complete_overwrite: bool,
    ) -> Result<Operation, AnnError> {
        let body = json!({
            "metadata": {
                "contentsDeltaUri": delta_uri,
                "isCompleteOverwrite": complete_overwrite,
            }
        });

        let request = self
            .client
            .patch(self.url(&index.backing_index_id))
            .query(&[("updateMask", "metadata")])
            .json(&body);
        let raw: RawOperation = self.send(request, "update index")?;
        Ok(raw.into_operation())
    }

    fn get_operation(&self, name: &str) -> Result<Operation, AnnError> {
        let raw: RawOperation = self.send(self.client.get(self.url(name)), name)?;
        Ok(raw.into_operation())
    }

    fn query_neighbors(
        &self,
        endpoint: &EndpointHandle,
        deployed_index_id: &str,
        vectors: &[Vec<f32>],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<Vec<Neighbor>>, AnnError> {
        let restricts = filter.map(parse_filter).transpose()?;

        let queries: Vec<Value> = vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| {
                let mut datapoint = json!({
                    "datapointId": format!("query-{i}"),
                    "featureVector": vector,
                });
                if let Some(restricts) = &restricts {
                    datapoint["restricts"] = restricts.clone();
                }
                json!({ "datapoint": datapoint, "neighborCount": k })
            })
            .collect();

        let body = json!({
            "deployedIndexId": deployed_index_id,
            "queries": queries,
            "returnFullDatapoint": true,
        });

        let response: FindNeighborsResponse = self.send(
            self.client.post(self.query_url(endpoint)).json(&body),
            "find neighbors",
        )?;

        Ok(response
            .nearest_neighbors
            .into_iter()
            .map(|nearest| {
                nearest
                    .neighbors
                    .into_iter()
                    .map(|n| Neighbor {
                        id: n.datapoint.datapoint_id,
                        distance: n.distance,
                        restricts: n
                            .datapoint
                            .restricts
                            .into_iter()
                            .map(|r| Restrict {
                                namespace: r.namespace,
                                allow: r.allow_list,
                            })
                            .collect(),
                    })
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_index_into_handle() {
        let raw: RawIndex = serde_json::from_value(json!({
            "name": "projects/1/locations/asia-northeast1/indexes/7368610270005952512",
            "displayName": "sisterly",
            "metadata": {
                "config": {
                    "dimensions": 1280,
                    "approximateNeighborsCount": 50,
                    "distanceMeasureType": "DOT_PRODUCT_DISTANCE"
                }
            }
        }))
        .unwrap();

        let handle = raw.into_handle();
        assert_eq!(handle.display_name, "sisterly");
        assert_eq!(handle.dimension, 1280);
        assert_eq!(handle.distance_metric, DistanceMetric::DotProduct);
    }

    #[test]
    fn test_raw_endpoint_into_handle() {
        let raw: RawEndpoint = serde_json::from_value(json!({
            "name": "projects/1/locations/l/indexEndpoints/5566554692546199552",
            "displayName": "sisterly-endpoint",
            "publicEndpointEnabled": true,
            "publicEndpointDomainName": "123.l-1.vdb.vertexai.goog",
            "deployedIndexes": [{"id": "sisterly_deployed_1", "index": "projects/1/locations/l/indexes/7"}]
        }))
        .unwrap();

        let handle = raw.into_handle();
        assert_eq!(handle.deployed_index_id, None);
        assert_eq!(handle.deployed_indexes.len(), 1);
        assert_eq!(handle.public_domain.as_deref(), Some("123.l-1.vdb.vertexai.goog"));
    }

    #[test]
    fn test_operation_reports_created_resource() {
        let raw: RawOperation = serde_json::from_value(json!({
            "name": "projects/1/locations/l/indexes/7/operations/9",
            "done": true,
            "response": {"@type": "type.googleapis.com/google.cloud.aiplatform.v1.Index", "name": "projects/1/locations/l/indexes/7"}
        }))
        .unwrap();

        let op = raw.into_operation();
        assert!(op.done);
        assert!(op.error.is_none());
        assert_eq!(op.resource.as_deref(), Some("projects/1/locations/l/indexes/7"));
    }

    #[test]
    fn test_query_url_prefers_public_domain() {
        let client = VertexClient::new("p", "asia-northeast1", None, "t");
        let mut endpoint = EndpointHandle {
            display_name: "e".to_string(),
            backing_endpoint_id: "projects/1/locations/asia-northeast1/indexEndpoints/5".to_string(),
            deployed_index_id: None,
            public_endpoint_enabled: true,
            public_domain: Some("123.vdb.vertexai.goog".to_string()),
            deployed_indexes: vec![],
        };
        assert_eq!(
            client.query_url(&endpoint),
            "https://123.vdb.vertexai.goog/v1/projects/1/locations/asia-northeast1/indexEndpoints/5:findNeighbors"
        );

        endpoint.public_domain = None;
        assert_eq!(
            client.query_url(&endpoint),
            "https://asia-northeast1-aiplatform.googleapis.com/v1/projects/1/locations/asia-northeast1/indexEndpoints/5:findNeighbors"
        );
    }

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter(r#"[{"namespace": "user_type", "allowList": ["admin"]}]"#).is_ok());
        assert!(matches!(parse_filter("user_type=admin"), Err(AnnError::InvalidFilter(_))));
        assert!(matches!(parse_filter(r#"{"a": 1}"#), Err(AnnError::InvalidFilter(_))));
    }
}
