//! Error types for diego-ssh.

use thiserror::Error;

/// Errors produced by password authenticators.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The username does not belong to this authenticator's realm.
    /// The composite authenticator treats this as "try the next one".
    #[error("authenticator not applicable")]
    NotApplicable,

    /// The username or password did not match.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// An upstream authority rejected the credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No authenticators were configured at all.
    #[error("Invalid authentication configuration")]
    NoAuthenticators,

    /// The credentials were valid but the routing target could not be built.
    #[error("Target resolution failed: {0}")]
    TargetResolution(#[from] RegistryError),
}

/// Errors from the instance registry lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No running instance for the requested guid/index.
    #[error("Instance not found")]
    NotFound,

    /// The instance exists but exposes no SSH port.
    #[error("SSH not enabled for instance")]
    SshNotEnabled,

    /// Transport or decoding failure talking to the registry.
    #[error("Registry request failed: {0}")]
    Client(String),
}

/// Errors from the proxy channel broker.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The authenticated connection carries no proxy target.
    #[error("Missing proxy target configuration")]
    MissingTargetConfig,

    /// Dialing the backend SSH daemon failed.
    #[error("Backend dial failed: {0}")]
    BackendDial(String),

    /// The backend rejected the inner credentials.
    #[error("Backend authentication failed: {0}")]
    BackendAuth(String),

    /// The target private key could not be parsed.
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Opening the backend channel failed.
    #[error("Failed to open backend channel: {0}")]
    ChannelOpenFailed(String),
}

/// Errors from the local session channel handler.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A shell or exec request arrived for a session that already runs one.
    #[error("command already started")]
    CommandAlreadyStarted,

    /// Spawning the child process failed.
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    /// Allocating or configuring the pseudo-terminal failed.
    #[error("PTY setup failed: {0}")]
    PtySetupFailed(String),
}

/// Result type for authenticator operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        let err = AuthError::InvalidCredentials;
        assert_eq!(err.to_string(), "Invalid credentials");
    }

    #[test]
    fn test_auth_error_wraps_registry_error() {
        let err = AuthError::from(RegistryError::NotFound);
        assert_eq!(err.to_string(), "Target resolution failed: Instance not found");
    }

    #[test]
    fn test_registry_error_ssh_not_enabled() {
        let err = RegistryError::SshNotEnabled;
        assert_eq!(err.to_string(), "SSH not enabled for instance");
    }

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::BackendDial("connection refused".to_string());
        assert_eq!(err.to_string(), "Backend dial failed: connection refused");
    }

    #[test]
    fn test_proxy_error_missing_target() {
        let err = ProxyError::MissingTargetConfig;
        assert_eq!(err.to_string(), "Missing proxy target configuration");
    }

    #[test]
    fn test_session_error_already_started() {
        let err = SessionError::CommandAlreadyStarted;
        assert_eq!(err.to_string(), "command already started");
    }

    #[test]
    fn test_session_error_spawn_failed() {
        let err = SessionError::SpawnFailed("no such file".to_string());
        assert_eq!(err.to_string(), "Failed to spawn command: no such file");
    }

    #[test]
    fn test_auth_error_debug() {
        let err = AuthError::NotApplicable;
        assert!(format!("{:?}", err).contains("NotApplicable"));
    }
}
