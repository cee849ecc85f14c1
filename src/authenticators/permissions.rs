//! The permissions payload and its builder.
//!
//! An authenticator's success is converted into a routing decision here:
//! the builder resolves the live instance through the registry and produces
//! the payload the proxy broker consumes when the client opens channels.

use crate::error::{AuthError, RegistryError};
use crate::registry::InstanceRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where and how the proxy dials the backend SSH daemon. Exactly one of
/// `password` / `private_key` is non-empty and selects the inner auth
/// method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyTargetConfig {
    /// Backend SSH endpoint, `ip:port`.
    pub address: String,
    /// Expected backend host key fingerprint (MD5 colon-hex); empty means
    /// accept any host key.
    #[serde(default)]
    pub host_fingerprint: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// PEM-encoded private key for the inner authentication.
    #[serde(default)]
    pub private_key: String,
}

/// Opaque attachment produced by an authenticator and carried on the
/// connection until channel-open time.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Human-readable record of how the connection authenticated.
    pub log_message: String,
    /// Routing target; a connection without one never reaches the broker.
    pub proxy_target: Option<ProxyTargetConfig>,
}

/// Builds [`Permissions`] from a `(process_guid, index)` tuple. No retries;
/// the caller owns retry policy.
pub struct PermissionsBuilder {
    registry: Arc<dyn InstanceRegistry>,
}

impl PermissionsBuilder {
    pub fn new(registry: Arc<dyn InstanceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn build(
        &self,
        process_guid: &str,
        index: u32,
        log_message: &str,
    ) -> Result<Permissions, AuthError> {
        let lrp = self
            .registry
            .actual_lrp_by_process_guid_and_index(process_guid, index)
            .await?;

        let host_port = lrp
            .ssh_host_port()
            .ok_or(AuthError::TargetResolution(RegistryError::SshNotEnabled))?;

        Ok(Permissions {
            log_message: log_message.to_string(),
            proxy_target: Some(ProxyTargetConfig {
                address: format!("{}:{}", lrp.address, host_port),
                host_fingerprint: lrp.ssh_host_fingerprint,
                user: lrp.ssh_user,
                password: lrp.ssh_password,
                private_key: String::new(),
            }),
        })
    }
}
