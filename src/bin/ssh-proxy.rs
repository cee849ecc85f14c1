//! SSH proxy frontend.
//!
//! Terminates client connections, authenticates them against the enabled
//! credential backends and proxies every channel to the SSH daemon inside
//! the resolved application container.

use anyhow::{bail, Context, Result};
use clap::Parser;
use diego_ssh::authenticators::{
    CfAuthenticator, CompositeAuthenticator, DiegoAuthenticator, PasswordAuthenticator,
    PermissionsBuilder,
};
use diego_ssh::registry::RegistryClient;
use diego_ssh::server::{self, ProxyServer};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ssh-proxy", about = "SSH proxy for containerized applications")]
struct Args {
    /// Listen address for the SSH proxy.
    #[arg(long, default_value = "0.0.0.0:2222")]
    address: String,

    /// PEM encoded RSA host key.
    #[arg(long)]
    host_key: String,

    /// Base URL of the instance registry (BBS).
    #[arg(long)]
    bbs_address: String,

    /// Path to the CA certificate for mutually authenticated registry TLS.
    #[arg(long)]
    bbs_ca_cert: Option<String>,

    /// Path to the client certificate (PEM) for mutually authenticated
    /// registry TLS.
    #[arg(long)]
    bbs_client_cert: Option<String>,

    /// Path to the client key (PEM) for mutually authenticated registry TLS.
    #[arg(long)]
    bbs_client_key: Option<String>,

    /// URL of the Cloud Controller API.
    #[arg(long)]
    cc_api_url: Option<String>,

    /// Skip TLS certificate verification on Cloud Controller requests.
    #[arg(long)]
    skip_cert_verify: bool,

    /// Timeout in seconds applied to all HTTP requests.
    #[arg(long, default_value_t = 10)]
    communication_timeout: u64,

    /// Allow authentication with cf credentials.
    #[arg(long)]
    enable_cf_auth: bool,

    /// Allow authentication with diego credentials.
    #[arg(long)]
    enable_diego_auth: bool,

    /// Shared secret for the diego authentication method.
    #[arg(long, default_value = "")]
    diego_credentials: String,

    /// Timeout in seconds for dialing backend SSH daemons.
    #[arg(long, default_value_t = 30)]
    backend_dial_timeout: u64,
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
            info!("ssh-proxy exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("ssh-proxy error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("ssh-proxy starting");

    let communication_timeout = Duration::from_secs(args.communication_timeout);

    let ca_cert = match &args.bbs_ca_cert {
        Some(path) => {
            Some(std::fs::read(path).with_context(|| format!("failed to read {path}"))?)
        }
        None => None,
    };
    // reqwest consumes the client certificate and key as one PEM bundle.
    let client_identity = match (&args.bbs_client_cert, &args.bbs_client_key) {
        (Some(cert_path), Some(key_path)) => {
            let mut bundle =
                std::fs::read(cert_path).with_context(|| format!("failed to read {cert_path}"))?;
            bundle.extend(
                std::fs::read(key_path).with_context(|| format!("failed to read {key_path}"))?,
            );
            Some(bundle)
        }
        (None, None) => None,
        _ => bail!("--bbs-client-cert and --bbs-client-key must be provided together"),
    };

    let registry = RegistryClient::new(
        &args.bbs_address,
        ca_cert.as_deref(),
        client_identity.as_deref(),
        communication_timeout,
    )
    .context("failed to build registry client")?;
    let permissions_builder = Arc::new(PermissionsBuilder::new(Arc::new(registry)));

    let mut authenticators: Vec<Box<dyn PasswordAuthenticator>> = Vec::new();

    if args.enable_diego_auth {
        authenticators.push(Box::new(DiegoAuthenticator::new(
            args.diego_credentials.clone().into_bytes(),
            Arc::clone(&permissions_builder),
        )));
    }

    if args.enable_cf_auth {
        let cc_api_url = args
            .cc_api_url
            .as_deref()
            .context("--cc-api-url is required with --enable-cf-auth")?;
        let client = reqwest::Client::builder()
            .timeout(communication_timeout)
            .danger_accept_invalid_certs(args.skip_cert_verify)
            .build()
            .context("failed to build http client")?;
        authenticators.push(Box::new(CfAuthenticator::new(
            client,
            cc_api_url,
            Arc::clone(&permissions_builder),
        )));
    }

    if authenticators.is_empty() {
        bail!("no authentication methods enabled");
    }

    let authenticator = Arc::new(CompositeAuthenticator::new(authenticators));
    let ssh_config = server::ssh_server_config(&args.host_key)?;
    let proxy = ProxyServer::new(
        authenticator,
        Duration::from_secs(args.backend_dial_timeout),
    );

    server::run(proxy, ssh_config, &args.address).await
}
