//! Shared-secret authenticator for the `diego` realm.

use crate::authenticators::{
    constant_time_compare, parse_principal, PasswordAuthenticator, Permissions,
    PermissionsBuilder,
};
use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const DIEGO_REALM: &str = "diego";

/// Authenticates `diego:<process-guid>/<index>` principals against a single
/// shared secret.
pub struct DiegoAuthenticator {
    credentials: Vec<u8>,
    permissions_builder: Arc<PermissionsBuilder>,
}

impl DiegoAuthenticator {
    pub fn new(credentials: Vec<u8>, permissions_builder: Arc<PermissionsBuilder>) -> Self {
        Self {
            credentials,
            permissions_builder,
        }
    }
}

#[async_trait]
impl PasswordAuthenticator for DiegoAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> AuthResult<Permissions> {
        let (process_guid, index) = parse_principal(DIEGO_REALM, user)?;

        if !constant_time_compare(password.as_bytes(), &self.credentials) {
            return Err(AuthError::InvalidCredentials);
        }

        debug!(process_guid = %process_guid, index = index, "diego credentials accepted");

        self.permissions_builder
            .build(&process_guid, index, "Authenticated with Diego")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticators::permissions::tests::{routable_lrp, FakeRegistry};

    fn authenticator(registry: Arc<FakeRegistry>) -> DiegoAuthenticator {
        DiegoAuthenticator::new(
            b"some-secret".to_vec(),
            Arc::new(PermissionsBuilder::new(registry)),
        )
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let registry = Arc::new(FakeRegistry::returning(routable_lrp()));
        let auth = authenticator(registry.clone());

        let permissions = auth
            .authenticate("diego:abc-123/0", "some-secret")
            .await
            .unwrap();

        assert_eq!(permissions.log_message, "Authenticated with Diego");
        assert!(permissions.proxy_target.is_some());
        assert_eq!(
            registry.calls.lock().unwrap().as_slice(),
            &[("abc-123".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_authenticate_bad_password() {
        let registry = Arc::new(FakeRegistry::returning(routable_lrp()));
        let auth = authenticator(registry.clone());

        let result = auth.authenticate("diego:abc-123/0", "wrong").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        assert!(registry.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_malformed_user() {
        let auth = authenticator(Arc::new(FakeRegistry::returning(routable_lrp())));
        let result = auth.authenticate("diego:not a guid/0", "some-secret").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_authenticate_other_realm_is_not_applicable() {
        let auth = authenticator(Arc::new(FakeRegistry::returning(routable_lrp())));
        let result = auth.authenticate("cf:abc-123/0", "some-secret").await;
        assert!(matches!(result, Err(AuthError::NotApplicable)));
    }

    #[tokio::test]
    async fn test_registry_failure_surfaces_as_target_resolution() {
        let auth = authenticator(Arc::new(FakeRegistry::not_found()));
        let result = auth.authenticate("diego:abc-123/0", "some-secret").await;
        assert!(matches!(result, Err(AuthError::TargetResolution(_))));
    }
}
