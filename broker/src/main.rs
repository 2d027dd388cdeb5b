mod bridge;
mod client;
mod config;
mod error;
mod ip;
mod server;
mod stats;
mod target;
mod tunnel;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{BrokerConfig, Cli};
use gateway_registry::{HttpRegistryClient, RegistryConfig};
use server::BrokerServer;
use tunnel::TunnelPorts;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BrokerConfig::load(Cli::parse())?;

    let key = russh::keys::load_secret_key(&config.private_key_path, None)
        .map_err(|e| anyhow::anyhow!("loading host key {}: {}", config.private_key_path.display(), e))?;

    tracing::info!(
        port = config.port,
        registry_base_url = %config.registry_base_url,
        ingress_hostname = %config.ingress_hostname,
        "starting broker SSH server"
    );

    let registry = Arc::new(HttpRegistryClient::new(RegistryConfig {
        base_url: config.registry_base_url.clone(),
        ingress_hostname: config.ingress_hostname.clone(),
    }));
    let tunnel_ports = TunnelPorts::new(config.tunnel_ports.clone());

    let server = BrokerServer::new(registry, tunnel_ports, config.ingress_hostname.clone());
    server.run(key, config.port).await
}
