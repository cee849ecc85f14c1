//! Cloud Controller backed authenticator for the `cf` realm.
//!
//! The password is exchanged for an OAuth token, the token authorizes an
//! SSH-access check for the application instance, and the returned process
//! guid feeds the permissions builder.

use crate::authenticators::{parse_principal, PasswordAuthenticator, Permissions, PermissionsBuilder};
use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub const CF_REALM: &str = "cf";

/// Authenticates `cf:<app-guid>/<index>` principals against the Cloud
/// Controller API.
pub struct CfAuthenticator {
    client: reqwest::Client,
    cc_api_url: String,
    permissions_builder: Arc<PermissionsBuilder>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SshAccessResponse {
    process_guid: String,
}

impl CfAuthenticator {
    pub fn new(
        client: reqwest::Client,
        cc_api_url: &str,
        permissions_builder: Arc<PermissionsBuilder>,
    ) -> Self {
        Self {
            client,
            cc_api_url: cc_api_url.trim_end_matches('/').to_string(),
            permissions_builder,
        }
    }

    async fn fetch_token(&self, password: &str) -> AuthResult<String> {
        let response = self
            .client
            .post(format!("{}/oauth/token", self.cc_api_url))
            .basic_auth("cf", Some(""))
            .form(&[("grant_type", "password"), ("password", password)])
            .send()
            .await
            .map_err(|e| AuthError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::AuthenticationFailed(format!(
                "token request returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::AuthenticationFailed(e.to_string()))?;
        Ok(token.access_token)
    }

    async fn check_ssh_access(&self, token: &str, app_guid: &str, index: u32) -> AuthResult<String> {
        let response = self
            .client
            .get(format!(
                "{}/internal/apps/{}/ssh_access/{}",
                self.cc_api_url, app_guid, index
            ))
            .header(reqwest::header::AUTHORIZATION, format!("bearer {token}"))
            .send()
            .await
            .map_err(|e| AuthError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::AuthenticationFailed(format!(
                "ssh access check returned {}",
                response.status()
            )));
        }

        let access: SshAccessResponse = response
            .json()
            .await
            .map_err(|e| AuthError::AuthenticationFailed(e.to_string()))?;
        Ok(access.process_guid)
    }
}

#[async_trait]
impl PasswordAuthenticator for CfAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> AuthResult<Permissions> {
        let (app_guid, index) = parse_principal(CF_REALM, user)?;

        let token = self.fetch_token(password).await?;
        let process_guid = self.check_ssh_access(&token, &app_guid, index).await?;

        debug!(app_guid = %app_guid, index = index, process_guid = %process_guid,
            "cloud controller approved ssh access");

        self.permissions_builder
            .build(&process_guid, index, "Authenticated with CF")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticators::permissions::tests::{routable_lrp, FakeRegistry};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response per expected request and records what
    /// it saw. Just enough HTTP for a reqwest round-trip.
    async fn serve_responses(
        listener: TcpListener,
        responses: Vec<(&'static str, String)>,
    ) -> Vec<String> {
        let mut seen = Vec::new();
        for (status_line, body) in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(str::to_string))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            seen.push(String::from_utf8_lossy(&request).to_string());
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        seen
    }

    fn cf_authenticator(base_url: &str) -> CfAuthenticator {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let registry = Arc::new(FakeRegistry::returning(routable_lrp()));
        CfAuthenticator::new(client, base_url, Arc::new(PermissionsBuilder::new(registry)))
    }

    #[tokio::test]
    async fn test_authenticate_token_then_access_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(serve_responses(
            listener,
            vec![
                (
                    "HTTP/1.1 200 OK",
                    r#"{"access_token":"T"}"#.to_string(),
                ),
                (
                    "HTTP/1.1 200 OK",
                    r#"{"process_guid":"abc-123"}"#.to_string(),
                ),
            ],
        ));

        let auth = cf_authenticator(&base_url);
        let permissions = auth.authenticate("cf:abc/2", "p").await.unwrap();
        assert_eq!(permissions.log_message, "Authenticated with CF");
        assert!(permissions.proxy_target.is_some());

        let seen = server.await.unwrap();
        // Token request: form-encoded password grant with basic auth cf:.
        assert!(seen[0].starts_with("POST /oauth/token"));
        assert!(seen[0].contains("authorization: Basic Y2Y6") || seen[0].contains("Authorization: Basic Y2Y6"));
        assert!(seen[0].ends_with("grant_type=password&password=p"));
        // Access check: bearer token from the first response.
        assert!(seen[1].starts_with("GET /internal/apps/abc/ssh_access/2"));
        assert!(seen[1].contains("bearer T"));
    }

    #[tokio::test]
    async fn test_authenticate_token_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(serve_responses(
            listener,
            vec![("HTTP/1.1 401 Unauthorized", "{}".to_string())],
        ));

        let auth = cf_authenticator(&base_url);
        let result = auth.authenticate("cf:abc/0", "bad").await;
        assert!(matches!(result, Err(AuthError::AuthenticationFailed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_access_denied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(serve_responses(
            listener,
            vec![
                ("HTTP/1.1 200 OK", r#"{"access_token":"T"}"#.to_string()),
                ("HTTP/1.1 403 Forbidden", "{}".to_string()),
            ],
        ));

        let auth = cf_authenticator(&base_url);
        let result = auth.authenticate("cf:abc/0", "p").await;
        assert!(matches!(result, Err(AuthError::AuthenticationFailed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_realm_is_not_applicable() {
        let auth = cf_authenticator("http://127.0.0.1:1");
        let result = auth.authenticate("diego:abc/0", "p").await;
        assert!(matches!(result, Err(AuthError::NotApplicable)));
    }
}
