//! Password authenticators for the proxy frontend.
//!
//! Authentication converts a successful password check into a routing
//! decision: every authenticator resolves the principal to a running
//! container instance and returns the [`Permissions`] payload consumed by
//! the proxy broker at channel-open time.

pub mod cf;
pub mod diego;
pub mod permissions;

pub use cf::CfAuthenticator;
pub use diego::DiegoAuthenticator;
pub use permissions::{Permissions, PermissionsBuilder, ProxyTargetConfig};

use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tracing::debug;

/// A password authenticator producing the permissions payload.
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> AuthResult<Permissions>;
}

/// Tries a list of authenticators in order; the first success wins.
pub struct CompositeAuthenticator {
    members: Vec<Box<dyn PasswordAuthenticator>>,
}

impl CompositeAuthenticator {
    pub fn new(members: Vec<Box<dyn PasswordAuthenticator>>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl PasswordAuthenticator for CompositeAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> AuthResult<Permissions> {
        let mut last_error = AuthError::NoAuthenticators;
        for member in &self.members {
            match member.authenticate(user, password).await {
                Ok(permissions) => return Ok(permissions),
                Err(e) => {
                    debug!(user = %user, error = %e, "authenticator rejected attempt");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Parse a principal of the form `<realm>:<guid>/<index>`.
///
/// A different realm yields [`AuthError::NotApplicable`] so a composite
/// keeps trying; a matching realm with a malformed remainder is an
/// [`AuthError::InvalidCredentials`].
pub fn parse_principal(realm: &str, user: &str) -> AuthResult<(String, u32)> {
    let rest = match user.split_once(':') {
        Some((r, rest)) if r == realm => rest,
        _ => return Err(AuthError::NotApplicable),
    };

    let (guid, index) = rest.split_once('/').ok_or(AuthError::InvalidCredentials)?;

    if guid.is_empty() || !guid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(AuthError::InvalidCredentials);
    }
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::InvalidCredentials);
    }

    let index = index.parse::<u32>().map_err(|_| AuthError::InvalidCredentials)?;
    Ok((guid.to_string(), index))
}

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAuthenticator {
        result: Result<String, fn() -> AuthError>,
    }

    #[async_trait]
    impl PasswordAuthenticator for StaticAuthenticator {
        async fn authenticate(&self, _user: &str, _password: &str) -> AuthResult<Permissions> {
            match &self.result {
                Ok(msg) => Ok(Permissions {
                    log_message: msg.clone(),
                    proxy_target: None,
                }),
                Err(make) => Err(make()),
            }
        }
    }

    fn accepting(msg: &str) -> Box<dyn PasswordAuthenticator> {
        Box::new(StaticAuthenticator {
            result: Ok(msg.to_string()),
        })
    }

    fn rejecting(make: fn() -> AuthError) -> Box<dyn PasswordAuthenticator> {
        Box::new(StaticAuthenticator { result: Err(make) })
    }

    // ==================== parse_principal ====================

    #[test]
    fn test_parse_principal_valid() {
        let (guid, index) = parse_principal("diego", "diego:abc-123/0").unwrap();
        assert_eq!(guid, "abc-123");
        assert_eq!(index, 0);
    }

    #[test]
    fn test_parse_principal_multi_digit_index() {
        let (_, index) = parse_principal("cf", "cf:app/42").unwrap();
        assert_eq!(index, 42);
    }

    #[test]
    fn test_parse_principal_wrong_realm_is_not_applicable() {
        assert!(matches!(
            parse_principal("diego", "cf:abc/0"),
            Err(AuthError::NotApplicable)
        ));
        assert!(matches!(
            parse_principal("diego", "no-realm-here"),
            Err(AuthError::NotApplicable)
        ));
    }

    #[test]
    fn test_parse_principal_malformed() {
        for user in [
            "diego:abc",
            "diego:/0",
            "diego:abc/",
            "diego:abc/x",
            "diego:abc/-1",
            "diego:abc/+1",
            "diego:a_b/0",
            "diego:abc/1/2",
        ] {
            assert!(
                matches!(parse_principal("diego", user), Err(AuthError::InvalidCredentials)),
                "expected invalid credentials for {user:?}"
            );
        }
    }

    // ==================== constant_time_compare ====================

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"secret", b"secret"));
        assert!(!constant_time_compare(b"secret", b"secreT"));
        assert!(!constant_time_compare(b"secret", b"secret-longer"));
        assert!(constant_time_compare(b"", b""));
    }

    // ==================== CompositeAuthenticator ====================

    #[tokio::test]
    async fn test_composite_empty_returns_configuration_error() {
        let composite = CompositeAuthenticator::new(vec![]);
        let result = composite.authenticate("diego:abc/0", "pw").await;
        assert!(matches!(result, Err(AuthError::NoAuthenticators)));
    }

    #[tokio::test]
    async fn test_composite_first_success_wins() {
        let composite = CompositeAuthenticator::new(vec![
            rejecting(|| AuthError::NotApplicable),
            accepting("first"),
            accepting("second"),
        ]);
        let permissions = composite.authenticate("u", "p").await.unwrap();
        assert_eq!(permissions.log_message, "first");
    }

    #[tokio::test]
    async fn test_composite_all_fail_returns_last_error() {
        let composite = CompositeAuthenticator::new(vec![
            rejecting(|| AuthError::NotApplicable),
            rejecting(|| AuthError::InvalidCredentials),
        ]);
        let result = composite.authenticate("u", "p").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }
}
