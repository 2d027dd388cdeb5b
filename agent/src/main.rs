mod auth;
mod config;
mod pty;
mod server;
mod sessions;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use auth::PamAuthenticator;
use config::{AgentConfig, Cli};
use server::AgentServer;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::load(Cli::parse())?;

    let key = russh::keys::load_secret_key(&config.private_key_path, None)
        .map_err(|e| anyhow::anyhow!("loading host key {}: {}", config.private_key_path.display(), e))?;

    tracing::info!(
        device_name = %config.device_name,
        port = config.port,
        "starting agent SSH server"
    );

    let authenticator = Arc::new(PamAuthenticator::default());
    let server = AgentServer::new(authenticator, config.device_name.clone());
    server.run(key, config.port, INACTIVITY_TIMEOUT).await
}
