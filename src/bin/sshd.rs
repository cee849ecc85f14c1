//! In-container SSH session daemon.
//!
//! Serves `session` channels by running a shell or command, with optional
//! PTY, and `direct-tcpip` channels by dialing the forwarding target.

use anyhow::Result;
use clap::Parser;
use diego_ssh::handlers::{SessionChannelConfig, UnsupportedScpHandler};
use diego_ssh::server::{self, DaemonServer};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sshd", about = "SSH session daemon for application containers")]
struct Args {
    /// Listen address for the daemon.
    #[arg(long, default_value = "0.0.0.0:2222")]
    address: String,

    /// PEM encoded host key.
    #[arg(long)]
    host_key: String,

    /// Username accepted by the daemon.
    #[arg(long)]
    allowed_user: String,

    /// Password accepted by the daemon.
    #[arg(long)]
    allowed_password: String,

    /// Timeout in seconds for dialing direct-tcpip targets.
    #[arg(long, default_value_t = 10)]
    dial_timeout: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => {
            info!("sshd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("sshd error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("sshd starting");

    let config = Arc::new(SessionChannelConfig {
        allowed_user: args.allowed_user.clone(),
        allowed_password: args.allowed_password.clone(),
        default_env: HashMap::new(),
        dial_timeout: Duration::from_secs(args.dial_timeout),
    });

    let ssh_config = server::ssh_server_config(&args.host_key)?;
    let daemon = DaemonServer::new(config, Arc::new(UnsupportedScpHandler));

    server::run(daemon, ssh_config, &args.address).await
}
