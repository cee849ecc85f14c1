//! SCP exec dispatch.
//!
//! File-transfer semantics live behind the [`ScpHandler`] seam; the session
//! channel handler only routes `scp` command lines here.

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tracing::warn;

/// Matches command lines that must be routed to the SCP handler: optional
/// leading whitespace, the word `scp`, then end-of-line or more whitespace.
pub fn is_scp_command(command: &str) -> bool {
    match command.trim_start().strip_prefix("scp") {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

/// Handles an `exec` request whose command line is an SCP invocation.
#[async_trait]
pub trait ScpHandler: Send + Sync {
    /// Serve the transfer on `channel`, returning the exit status to report.
    async fn handle_scp_request(&self, handle: Handle, channel: ChannelId, command: &str) -> u32;
}

/// Default handler for endpoints without a transfer backend: reports the
/// failure on stderr and exits non-zero.
pub struct UnsupportedScpHandler;

#[async_trait]
impl ScpHandler for UnsupportedScpHandler {
    async fn handle_scp_request(&self, handle: Handle, channel: ChannelId, command: &str) -> u32 {
        warn!(command = %command, "scp requested but no transfer backend is configured");
        let _ = handle
            .extended_data(
                channel,
                1,
                CryptoVec::from_slice(b"scp is not supported on this endpoint\n"),
            )
            .await;
        1
    }
}
