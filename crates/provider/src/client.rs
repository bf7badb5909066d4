//! Client for communicating with the metal API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use metal_common::{
    Allocation, Error, Image, LifecycleState, NetworkAttachment, Operation, ResourceSnapshot,
    ResourceSpec, Result,
};

use crate::config::ProviderConfig;

/// Provisioning event the machine emits once its installed image booted
pub const PHONED_HOME_EVENT: &str = "Phoned Home";

const CRASHED_EVENT: &str = "Crashed";

/// Per-request timeout for API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create, get and delete machines at the provider
#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Allocate a machine and return the provider-assigned id
    async fn create(&self, spec: &ResourceSpec) -> Result<String>;

    /// Fetch the machine, `Error::NotFound` if the provider has no record
    async fn get(&self, id: &str) -> Result<ResourceSnapshot>;

    /// Free the machine, `Error::NotFound` if it is already gone
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Lookup of operating system images
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    async fn get_image(&self, id: &str) -> Result<Image>;
}

/// HTTP client for the metal API
#[derive(Debug, Clone)]
pub struct MetalClient {
    http: reqwest::Client,
    endpoint: Url,
    auth_token: String,
}

impl MetalClient {
    /// Build a client from a validated provider configuration
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            auth_token: config.auth_token.clone(),
        })
    }

    /// Endpoint URL extended by `segments`, each percent-encoded as one path segment
    fn url(&self, segments: &[&str], operation: Operation, key: &str) -> Result<Url> {
        if segments.iter().any(|s| matches!(*s, "" | "." | "..")) {
            return Err(Error::validation("id", format!("{:?} is not a valid resource id", key)));
        }

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::transport(operation, key, format!("endpoint {} cannot carry a path", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, operation: Operation, key: &str) -> Result<Response> {
        request
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|e| Error::transport(operation, key, e))
    }
}

/// Map an HTTP response onto the provider error kinds
async fn check_status(response: Response, operation: Operation, kind: &str, key: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound {
            operation,
            kind: kind.to_string(),
            id: key.to_string(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::transport(
        operation,
        key,
        format!("metal API returned {}: {}", status, body.trim()),
    ))
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response, operation: Operation, key: &str) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| Error::transport(operation, key, format!("malformed response: {}", e)))
}

#[async_trait]
impl RemoteResourceClient for MetalClient {
    async fn create(&self, spec: &ResourceSpec) -> Result<String> {
        let key = spec.hostname.as_str();
        let url = self.url(&["v1", "machine", "allocate"], Operation::Create, key)?;
        let body = MachineAllocateRequest::from(spec);

        debug!("Allocating machine {} in partition {}", spec.hostname, spec.partition);
        let response = self.send(self.http.post(url).json(&body), Operation::Create, key).await?;
        let response = check_status(response, Operation::Create, "machine", key).await?;
        let machine: MachineResponse = decode(response, Operation::Create, key).await?;

        Ok(machine.id)
    }

    async fn get(&self, id: &str) -> Result<ResourceSnapshot> {
        let url = self.url(&["v1", "machine", id], Operation::Read, id)?;
        let response = self.send(self.http.get(url), Operation::Read, id).await?;
        let response = check_status(response, Operation::Read, "machine", id).await?;
        let machine: MachineResponse = decode(response, Operation::Read, id).await?;

        machine.into_snapshot()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.url(&["v1", "machine", id, "free"], Operation::Delete, id)?;
        let response = self.send(self.http.delete(url), Operation::Delete, id).await?;
        check_status(response, Operation::Delete, "machine", id).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageCatalog for MetalClient {
    async fn get_image(&self, id: &str) -> Result<Image> {
        let url = self.url(&["v1", "image", id], Operation::ImageLookup, id)?;
        let response = self.send(self.http.get(url), Operation::ImageLookup, id).await?;
        let response = check_status(response, Operation::ImageLookup, "image", id).await?;
        let image: ImageResponse = decode(response, Operation::ImageLookup, id).await?;

        Ok(Image {
            id: image.id,
            name: image.name.unwrap_or_default(),
            description: image.description,
        })
    }
}

/// Lifecycle state derived from the newest provisioning event
fn lifecycle_from_event(event: Option<&str>) -> LifecycleState {
    match event {
        Some(PHONED_HOME_EVENT) => LifecycleState::Active,
        Some(CRASHED_EVENT) => LifecycleState::Failed,
        _ => LifecycleState::AwaitingReady,
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct MachineAllocateRequest {
    hostname: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    partitionid: String,
    sizeid: String,
    imageid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    projectid: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_pub_keys: Vec<String>,
}

impl From<&ResourceSpec> for MachineAllocateRequest {
    fn from(spec: &ResourceSpec) -> Self {
        Self {
            hostname: spec.hostname.clone(),
            name: spec.display_name().to_string(),
            description: spec.description.clone(),
            partitionid: spec.partition.clone(),
            sizeid: spec.size.clone(),
            imageid: spec.image.clone(),
            projectid: spec.project.clone(),
            tags: spec.tags.clone(),
            user_data: spec.user_data.clone(),
            ssh_pub_keys: spec.ssh_public_keys.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MachineResponse {
    id: String,
    #[serde(default)]
    partition: Option<IdRef>,
    #[serde(default)]
    size: Option<IdRef>,
    #[serde(default)]
    allocation: Option<AllocationResponse>,
    #[serde(default)]
    events: Option<EventLog>,
    created: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AllocationResponse {
    hostname: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    image: Option<IdRef>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    console_password: Option<String>,
    #[serde(default)]
    networks: Vec<NetworkResponse>,
    #[serde(default)]
    ssh_pub_keys: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkResponse {
    networkid: String,
    #[serde(default)]
    ips: Vec<String>,
    #[serde(default)]
    private: bool,
}

/// Provisioning event log, newest entry first
#[derive(Debug, Deserialize)]
struct EventLog {
    #[serde(default)]
    log: Vec<ProvisioningEvent>,
}

#[derive(Debug, Deserialize)]
struct ProvisioningEvent {
    event: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl MachineResponse {
    fn into_snapshot(self) -> Result<ResourceSnapshot> {
        // A machine without allocation went back to the free pool
        let alloc = self.allocation.ok_or_else(|| Error::machine_not_found(Operation::Read, &self.id))?;
        let last_event = self
            .events
            .and_then(|e| e.log.into_iter().next())
            .map(|e| e.event);

        Ok(ResourceSnapshot {
            state: lifecycle_from_event(last_event.as_deref()),
            allocation: Allocation {
                hostname: alloc.hostname,
                name: alloc.name,
                description: alloc.description,
                size: self.size.map(|s| s.id).unwrap_or_default(),
                partition: self.partition.map(|p| p.id).unwrap_or_default(),
                image: alloc.image.map(|i| i.id).unwrap_or_default(),
                project: alloc.project,
                console_password: alloc.console_password,
                networks: alloc
                    .networks
                    .into_iter()
                    .map(|n| NetworkAttachment {
                        network_id: n.networkid,
                        ips: n.ips,
                        private: n.private,
                    })
                    .collect(),
                ssh_public_keys: alloc.ssh_pub_keys,
                tags: alloc.tags,
            },
            last_event,
            created: self.created,
            id: self.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> MetalClient {
        let config = ProviderConfig {
            endpoint: server.uri(),
            auth_token: "secret-token".to_string(),
            ..Default::default()
        };
        MetalClient::new(&config).unwrap()
    }

    fn machine_json(event: &str) -> serde_json::Value {
        json!({
            "id": "r-1",
            "partition": { "id": "p1" },
            "size": { "id": "s1" },
            "created": "2024-05-01T10:00:00Z",
            "events": { "log": [ { "event": event }, { "event": "Installing" } ] },
            "allocation": {
                "hostname": "h1",
                "name": "h1",
                "image": { "id": "img-a" },
                "console_password": "pw",
                "networks": [
                    { "networkid": "tenant", "ips": ["10.0.0.5"], "private": true },
                    { "networkid": "internet", "ips": ["185.1.2.3"], "private": false }
                ],
                "ssh_pub_keys": ["ssh-ed25519 AAAA"]
            }
        })
    }

    #[tokio::test]
    async fn test_create_posts_allocation_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/machine/allocate"))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_partial_json(json!({
                "hostname": "h1",
                "name": "h1",
                "partitionid": "p1",
                "sizeid": "s1",
                "imageid": "img-a"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(machine_json("Preparing")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let id = client
            .create(&ResourceSpec::new("h1", "img-a", "p1", "s1"))
            .await
            .unwrap();
        assert_eq!(id, "r-1");
    }

    #[tokio::test]
    async fn test_get_maps_machine_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/machine/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(machine_json(PHONED_HOME_EVENT)))
            .mount(&server)
            .await;

        let snap = client_for(&server).get("r-1").await.unwrap();
        assert_eq!(snap.id, "r-1");
        assert_eq!(snap.state, LifecycleState::Active);
        assert_eq!(snap.last_event.as_deref(), Some(PHONED_HOME_EVENT));
        assert_eq!(snap.allocation.partition, "p1");
        assert_eq!(snap.allocation.image, "img-a");
        assert_eq!(snap.allocation.console_password.as_deref(), Some("pw"));
        assert_eq!(snap.access_public_ipv4(), Some("185.1.2.3"));
        assert_eq!(snap.access_private_ipv4(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_get_provisioning_machine_awaits_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/machine/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(machine_json("Installing")))
            .mount(&server)
            .await;

        let snap = client_for(&server).get("r-1").await.unwrap();
        assert_eq!(snap.state, LifecycleState::AwaitingReady);
    }

    #[tokio::test]
    async fn test_get_missing_machine_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/machine/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server).get("gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { operation: Operation::Read, .. }));
    }

    #[tokio::test]
    async fn test_get_unallocated_machine_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/machine/r-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "r-2",
                "created": "2024-05-01T10:00:00Z"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).get("r-2").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/machine/r-1/free"))
            .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
            .mount(&server)
            .await;

        let err = client_for(&server).delete("r-1").await.unwrap_err();
        match err {
            Error::Transport { operation, key, message } => {
                assert_eq!(operation, Operation::Delete);
                assert_eq!(key, "r-1");
                assert!(message.contains("database unavailable"));
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_machine_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/machine/gone/free"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client_for(&server).delete("gone").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_id_is_a_single_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/machine/r-2/free"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.delete("x/../r-2").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { operation: Operation::Delete, ref id, .. } if id == "x/../r-2"));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/v1/machine/x%2F..%2Fr-2/free");
    }

    #[tokio::test]
    async fn test_dot_ids_are_rejected_before_sending() {
        let server = MockServer::start().await;
        let client = client_for(&server);

        for id in ["", ".", ".."] {
            let err = client.get(id).await.unwrap_err();
            assert!(matches!(err, Error::Validation { field: "id", .. }));
        }
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_path_prefix_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/machine/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(machine_json(PHONED_HOME_EVENT)))
            .expect(1)
            .mount(&server)
            .await;

        let config = ProviderConfig {
            endpoint: format!("{}/metal", server.uri()),
            auth_token: "secret-token".to_string(),
            ..Default::default()
        };
        let snap = MetalClient::new(&config).unwrap().get("r-1").await.unwrap();
        assert_eq!(snap.id, "r-1");
    }

    #[tokio::test]
    async fn test_get_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/image/ubuntu-24.04"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ubuntu-24.04",
                "name": "Ubuntu 24.04",
                "description": "Ubuntu LTS"
            })))
            .mount(&server)
            .await;

        let image = client_for(&server).get_image("ubuntu-24.04").await.unwrap();
        assert_eq!(image.name, "Ubuntu 24.04");
        assert_eq!(image.description.as_deref(), Some("Ubuntu LTS"));
    }

    #[test]
    fn test_lifecycle_from_event() {
        assert_eq!(lifecycle_from_event(Some(PHONED_HOME_EVENT)), LifecycleState::Active);
        assert_eq!(lifecycle_from_event(Some("Crashed")), LifecycleState::Failed);
        assert_eq!(lifecycle_from_event(Some("Installing")), LifecycleState::AwaitingReady);
        assert_eq!(lifecycle_from_event(None), LifecycleState::AwaitingReady);
    }
}
