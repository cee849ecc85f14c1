//! Instance registry lookup.
//!
//! The proxy resolves `(process_guid, index)` to a running container through
//! an injected [`InstanceRegistry`]. Production deployments talk to the BBS
//! over HTTPS with mutual TLS; tests inject an in-memory implementation.

use crate::error::RegistryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Container port the in-container SSH daemon listens on.
pub const CONTAINER_SSH_PORT: u16 = 2222;

/// A container port forwarded to a host port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// A running application instance as reported by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActualLrp {
    pub process_guid: String,
    pub index: u32,
    /// Address of the cell hosting the container.
    pub address: String,
    pub ports: Vec<PortMapping>,
    /// Host key fingerprint advertised by the container daemon; empty means
    /// the proxy accepts any backend host key.
    #[serde(default)]
    pub ssh_host_fingerprint: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_password: String,
}

impl ActualLrp {
    /// Host port mapped to the container SSH daemon, if SSH is enabled.
    pub fn ssh_host_port(&self) -> Option<u16> {
        self.ports
            .iter()
            .find(|m| m.container_port == CONTAINER_SSH_PORT)
            .map(|m| m.host_port)
    }
}

/// Resolver from `(process_guid, index)` to a running instance.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn actual_lrp_by_process_guid_and_index(
        &self,
        process_guid: &str,
        index: u32,
    ) -> Result<ActualLrp, RegistryError>;
}

/// JSON-over-HTTP registry client.
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Build a client for `base_url`. `ca_cert`, `client_cert` and
    /// `client_key` are PEM blobs enabling mutual TLS when present.
    pub fn new(
        base_url: &str,
        ca_cert: Option<&[u8]>,
        client_identity: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(pem) = ca_cert {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| RegistryError::Client(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = client_identity {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| RegistryError::Client(e.to_string()))?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| RegistryError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl InstanceRegistry for RegistryClient {
    async fn actual_lrp_by_process_guid_and_index(
        &self,
        process_guid: &str,
        index: u32,
    ) -> Result<ActualLrp, RegistryError> {
        let url = format!(
            "{}/v1/actual_lrps/{}/index/{}",
            self.base_url, process_guid, index
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Client(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound);
        }
        if !response.status().is_success() {
            return Err(RegistryError::Client(format!(
                "registry returned {}",
                response.status()
            )));
        }

        response
            .json::<ActualLrp>()
            .await
            .map_err(|e| RegistryError::Client(e.to_string()))
    }
}
