//! REST implementation of `ClusterApi`
//!
//! Talks to a virtual cluster's API server with the connection parameters
//! decoded from its embedded kubeconfig. Only the node and DNS-service
//! endpoints are mapped; everything else the nested control plane does is out
//! of this subsystem's reach on purpose.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::kubeconfig::Kubeconfig;
use super::virtual_api::{ApiError, ClusterApi, WorkerNode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DNS_SERVICE_PATH: &str = "/api/v1/namespaces/kube-system/services/kube-dns";

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<RawNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawNode {
    metadata: RawMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<RawNodeStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMetadata {
    name: String,
    #[serde(rename = "resourceVersion", default)]
    resource_version: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct RawNodeStatus {
    #[serde(default)]
    conditions: Vec<RawCondition>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawService {
    #[serde(default)]
    spec: RawServiceSpec,
}

#[derive(Debug, Deserialize, Default)]
struct RawServiceSpec {
    #[serde(rename = "clusterIP", default)]
    cluster_ip: Option<String>,
}

fn to_worker_node(raw: RawNode) -> WorkerNode {
    let ready = raw
        .status
        .as_ref()
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.condition_type == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    WorkerNode {
        name: raw.metadata.name,
        resource_version: raw.metadata.resource_version.parse().unwrap_or(0),
        labels: raw.metadata.labels,
        ready,
    }
}

/// `ClusterApi` over the API server named in a kubeconfig
pub struct RestClusterApi {
    client: Client,
    base_url: String,
}

impl RestClusterApi {
    /// Build a client from decoded kubeconfig parameters
    pub fn new(config: &Kubeconfig) -> Result<Self, ApiError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(token) = &config.token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::Request(e.to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|e| ApiError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.server.clone(),
        })
    }

    fn node_url(&self, name: &str) -> String {
        format!("{}/api/v1/nodes/{}", self.base_url, name)
    }

    async fn check(&self, response: Response, subject: &str) -> Result<Response, ApiError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(subject.to_string())),
            StatusCode::CONFLICT => Err(ApiError::Conflict(subject.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl ClusterApi for RestClusterApi {
    async fn list_nodes(&self) -> Result<Vec<WorkerNode>, ApiError> {
        let url = format!("{}/api/v1/nodes", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let response = self.check(response, "nodes").await?;

        let list: NodeList = response
            .json()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        Ok(list.items.into_iter().map(to_worker_node).collect())
    }

    async fn get_node(&self, name: &str) -> Result<WorkerNode, ApiError> {
        let response = self
            .client
            .get(self.node_url(name))
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let response = self.check(response, name).await?;

        let raw: RawNode = response
            .json()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        Ok(to_worker_node(raw))
    }

    async fn delete_node(&self, name: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.node_url(name))
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        self.check(response, name).await.map(|_| ())
    }

    async fn update_node(&self, node: WorkerNode) -> Result<WorkerNode, ApiError> {
        let body = RawNode {
            metadata: RawMetadata {
                name: node.name.clone(),
                resource_version: node.resource_version.to_string(),
                labels: node.labels.clone(),
            },
            status: None,
        };

        let response = self
            .client
            .put(self.node_url(&node.name))
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let response = self.check(response, &node.name).await?;

        let raw: RawNode = response
            .json()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        Ok(to_worker_node(raw))
    }

    async fn dns_service_address(&self) -> Result<Option<String>, ApiError> {
        let url = format!("{}{}", self.base_url, DNS_SERVICE_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        match self.check(response, "kube-dns").await {
            Ok(response) => {
                let service: RawService = response
                    .json()
                    .await
                    .map_err(|e| ApiError::Request(e.to_string()))?;
                Ok(service.spec.cluster_ip)
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_list_parsing() {
        let json = r#"{
            "items": [
                {
                    "metadata": {"name": "n1", "resourceVersion": "42", "labels": {"a": "b"}},
                    "status": {"conditions": [{"type": "Ready", "status": "True"}]}
                },
                {
                    "metadata": {"name": "n2", "resourceVersion": "43"},
                    "status": {"conditions": [{"type": "Ready", "status": "False"}]}
                }
            ]
        }"#;
        let list: NodeList = serde_json::from_str(json).unwrap();
        let nodes: Vec<WorkerNode> = list.items.into_iter().map(to_worker_node).collect();

        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].ready);
        assert_eq!(nodes[0].resource_version, 42);
        assert_eq!(nodes[0].labels.get("a").map(String::as_str), Some("b"));
        assert!(!nodes[1].ready);
    }

    #[test]
    fn test_node_without_status_is_not_ready() {
        let json = r#"{"metadata": {"name": "n1", "resourceVersion": "7"}}"#;
        let raw: RawNode = serde_json::from_str(json).unwrap();
        assert!(!to_worker_node(raw).ready);
    }
}
