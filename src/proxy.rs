//! The proxy channel broker.
//!
//! Couples every inbound channel to a matching channel on the backend SSH
//! daemon named by the connection's permissions payload. One backend
//! connection exists per client connection, dialed on first channel open;
//! per channel, a pump task relays payload, extended data, out-of-band
//! requests and close events in both directions.

use crate::authenticators::{PasswordAuthenticator, Permissions, ProxyTargetConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::helpers;
use md5::{Digest, Md5};
use russh::client::{self, AuthResult};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect, Pty, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client-side channel activity forwarded to the backend pump.
enum ChannelEvent {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Env(String, String),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Signal(Sig),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Eof,
    Close,
}

/// Per-connection proxy handler: authenticates the client, owns the backend
/// connection, and brokers channels between the two.
pub struct ProxyHandler {
    authenticator: Arc<dyn PasswordAuthenticator>,
    peer: Option<SocketAddr>,
    dial_timeout: Duration,
    permissions: Option<Permissions>,
    backend: Option<client::Handle<BackendHandler>>,
    channels: HashMap<ChannelId, mpsc::Sender<ChannelEvent>>,
}

impl ProxyHandler {
    pub fn new(
        authenticator: Arc<dyn PasswordAuthenticator>,
        dial_timeout: Duration,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            authenticator,
            peer,
            dial_timeout,
            permissions: None,
            backend: None,
            channels: HashMap::new(),
        }
    }

    /// Dial and authenticate the backend on first use.
    async fn ensure_backend(&mut self) -> ProxyResult<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let target = self
            .permissions
            .as_ref()
            .and_then(|p| p.proxy_target.clone())
            .ok_or(ProxyError::MissingTargetConfig)?;
        info!(peer = ?self.peer, address = %target.address, "dialing backend");
        let handle = dial_backend(&target, self.dial_timeout).await?;
        self.backend = Some(handle);
        Ok(())
    }

    async fn forward(&mut self, channel: ChannelId, event: ChannelEvent) {
        match self.channels.get(&channel) {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!(channel = ?channel, "pump gone, dropping event");
                }
            }
            None => debug!(channel = ?channel, "no pump for channel, dropping event"),
        }
    }
}

impl russh::server::Handler for ProxyHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.authenticator.authenticate(user, password).await {
            Ok(permissions) => {
                info!(peer = ?self.peer, user = %user, message = %permissions.log_message,
                    "authentication succeeded");
                self.permissions = Some(permissions);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(peer = ?self.peer, user = %user, method = "password", error = %e,
                    "authentication failed");
                Ok(Auth::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Err(e) = self.ensure_backend().await {
            warn!(peer = ?self.peer, error = %e, "rejecting session channel");
            return Ok(false);
        }
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };

        let backend_channel = match backend.channel_open_session().await {
            Ok(backend_channel) => backend_channel,
            Err(e) => {
                let e = ProxyError::ChannelOpenFailed(e.to_string());
                warn!(peer = ?self.peer, error = %e, "rejecting session channel");
                return Ok(false);
            }
        };

        let id = channel.id();
        let (tx, rx) = mpsc::channel(64);
        self.channels.insert(id, tx);
        tokio::spawn(proxy_channel(rx, backend_channel, session.handle(), id));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Err(e) = self.ensure_backend().await {
            warn!(peer = ?self.peer, error = %e, "rejecting direct-tcpip channel");
            return Ok(false);
        }
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };

        let backend_channel = match backend
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(backend_channel) => backend_channel,
            Err(e) => {
                warn!(
                    target = %format!("{host_to_connect}:{port_to_connect}"),
                    error = %e,
                    "backend direct-tcpip open failed"
                );
                return Ok(false);
            }
        };

        // Forwarded streams carry no out-of-band requests; a pair of
        // couplers is the whole relay.
        let (client_read, client_write) = tokio::io::split(channel.into_stream());
        let (backend_read, backend_write) = tokio::io::split(backend_channel.into_stream());
        tokio::spawn(helpers::copy_and_close(client_read, backend_write));
        tokio::spawn(helpers::copy_and_close(backend_read, client_write));
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Data(data.to_vec())).await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::ExtendedData(code, data.to_vec()))
            .await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelEvent::Env(variable_name.to_string(), variable_value.to_string()),
        )
        .await;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelEvent::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Shell).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Exec(data.to_vec())).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Subsystem(name.to_string()))
            .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Signal(signal)).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Close).await;
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for ProxyHandler {
    fn drop(&mut self) {
        // The backend connection dies with the client connection.
        if let Some(backend) = self.backend.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = backend
                        .disconnect(Disconnect::ByApplication, "client connection closed", "en")
                        .await;
                });
            }
        }
    }
}

/// Dial the backend SSH endpoint and authenticate with the target's
/// credentials.
async fn dial_backend(
    target: &ProxyTargetConfig,
    dial_timeout: Duration,
) -> ProxyResult<client::Handle<BackendHandler>> {
    let config = Arc::new(client::Config::default());
    let handler = BackendHandler {
        expected_fingerprint: target.host_fingerprint.clone(),
    };

    let mut handle = tokio::time::timeout(
        dial_timeout,
        client::connect(config, target.address.as_str(), handler),
    )
    .await
    .map_err(|_| ProxyError::BackendDial(format!("dialing {} timed out", target.address)))?
    .map_err(|e| ProxyError::BackendDial(e.to_string()))?;

    let auth_result = if !target.private_key.is_empty() {
        let key = decode_secret_key(&target.private_key, None)
            .map_err(|e| ProxyError::InvalidKey(e.to_string()))?;
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        handle
            .authenticate_publickey(&target.user, key)
            .await
            .map_err(|e| ProxyError::BackendAuth(e.to_string()))?
    } else {
        handle
            .authenticate_password(&target.user, &target.password)
            .await
            .map_err(|e| ProxyError::BackendAuth(e.to_string()))?
    };

    match auth_result {
        AuthResult::Success => Ok(handle),
        AuthResult::Failure { .. } => Err(ProxyError::BackendAuth(
            "backend rejected credentials".to_string(),
        )),
    }
}

/// Relay one client channel to its backend counterpart until either side
/// closes. Requests are forwarded with replies relayed back; the exit
/// message travels backend -> client like any other out-of-band request.
async fn proxy_channel(
    mut events: mpsc::Receiver<ChannelEvent>,
    mut backend: Channel<client::Msg>,
    client_handle: russh::server::Handle,
    channel: ChannelId,
) {
    debug!(channel = ?channel, "proxy pump started");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Data(data)) => {
                    if backend.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(ChannelEvent::ExtendedData(code, data)) => {
                    if backend.extended_data(code, &data[..]).await.is_err() {
                        break;
                    }
                }
                Some(ChannelEvent::Env(name, value)) => {
                    let _ = backend.set_env(true, name, value).await;
                }
                Some(ChannelEvent::Pty { term, col_width, row_height, pix_width, pix_height, modes }) => {
                    let _ = backend
                        .request_pty(true, &term, col_width, row_height, pix_width, pix_height, &modes)
                        .await;
                }
                Some(ChannelEvent::Shell) => {
                    let _ = backend.request_shell(true).await;
                }
                Some(ChannelEvent::Exec(command)) => {
                    let _ = backend.exec(true, command).await;
                }
                Some(ChannelEvent::Subsystem(name)) => {
                    let _ = backend.request_subsystem(true, &name).await;
                }
                Some(ChannelEvent::Signal(signal)) => {
                    let _ = backend.signal(signal).await;
                }
                Some(ChannelEvent::WindowChange { col_width, row_height, pix_width, pix_height }) => {
                    let _ = backend.window_change(col_width, row_height, pix_width, pix_height).await;
                }
                Some(ChannelEvent::Eof) => {
                    let _ = backend.eof().await;
                }
                Some(ChannelEvent::Close) | None => {
                    break;
                }
            },
            message = backend.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    if client_handle
                        .data(channel, CryptoVec::from_slice(&data))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if client_handle
                        .extended_data(channel, ext, CryptoVec::from_slice(&data))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(ChannelMsg::Success) => {
                    let _ = client_handle.channel_success(channel).await;
                }
                Some(ChannelMsg::Failure) => {
                    let _ = client_handle.channel_failure(channel).await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    let _ = client_handle.exit_status_request(channel, exit_status).await;
                }
                Some(ChannelMsg::ExitSignal { signal_name, core_dumped, error_message, lang_tag }) => {
                    let _ = client_handle
                        .exit_signal_request(channel, signal_name, core_dumped, error_message, lang_tag)
                        .await;
                }
                Some(ChannelMsg::Eof) => {
                    let _ = client_handle.eof(channel).await;
                }
                Some(ChannelMsg::Close) | None => {
                    break;
                }
                Some(other) => {
                    debug!(channel = ?channel, message = ?other, "ignoring backend channel message");
                }
            },
        }
    }
    let _ = backend.close().await;
    let _ = client_handle.close(channel).await;
    debug!(channel = ?channel, "proxy pump finished");
}

/// MD5 fingerprint of a public key: colon-separated lowercase hex pairs
/// over the OpenSSH wire encoding, as printed by `ssh-keygen -l -E md5`.
pub fn md5_fingerprint(key: &russh::keys::PublicKey) -> String {
    let blob = key.to_bytes().unwrap_or_default();
    Md5::digest(&blob)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Verifies the backend host key against the expected MD5 fingerprint from
/// the permissions payload. An empty fingerprint accepts any key.
struct BackendHandler {
    expected_fingerprint: String,
}

impl client::Handler for BackendHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.expected_fingerprint.is_empty() {
            debug!("no host fingerprint configured, accepting backend key");
            return Ok(true);
        }
        let actual = md5_fingerprint(server_public_key);
        if actual == self.expected_fingerprint {
            Ok(true)
        } else {
            warn!(
                expected = %self.expected_fingerprint,
                actual = %actual,
                "backend host key mismatch"
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::client::Handler;
    use russh::keys::PublicKey;

    const TEST_PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIElJeymovCWmBilR6+b152TXclG2v1Oze0KhfsgZux/N test-key";
    const TEST_FINGERPRINT: &str = "f4:97:1c:6a:1a:6a:9c:cf:4c:e3:5e:3f:a4:52:1f:9c";

    fn test_key() -> PublicKey {
        PublicKey::from_openssh(TEST_PUBLIC_KEY).unwrap()
    }

    #[test]
    fn test_md5_fingerprint_known_answer() {
        // Expected value produced by `ssh-keygen -l -E md5` for this key.
        assert_eq!(md5_fingerprint(&test_key()), TEST_FINGERPRINT);
    }

    #[tokio::test]
    async fn test_empty_fingerprint_accepts_any_key() {
        let mut handler = BackendHandler {
            expected_fingerprint: String::new(),
        };
        assert!(handler.check_server_key(&test_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_matching_fingerprint_accepted() {
        let mut handler = BackendHandler {
            expected_fingerprint: TEST_FINGERPRINT.to_string(),
        };
        assert!(handler.check_server_key(&test_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatched_fingerprint_rejected() {
        let mut handler = BackendHandler {
            expected_fingerprint: "aa:bb:cc:dd".to_string(),
        };
        assert!(!handler.check_server_key(&test_key()).await.unwrap());
    }
}
