//! Broker configuration: host key, listen port, and the injected
//! control-plane endpoints spec.md §9 ("Control-plane coupling") requires be
//! abstracted rather than hardcoded.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    private_key: Option<PathBuf>,
    port: Option<u16>,
    registry_base_url: Option<String>,
    ingress_hostname: Option<String>,
    #[serde(default)]
    tunnel_ports: HashMap<String, u16>,
}

/// Public-facing SSH session-proxy gateway.
#[derive(Debug, Parser)]
#[command(name = "gateway-broker")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags below take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the SSH host private key file.
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Port the operator-facing SSH server listens on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Base URL of the session registry control plane.
    #[arg(long)]
    pub registry_base_url: Option<String>,

    /// Hostname the control plane's ingress resolves to, used by the IP
    /// trust rule in spec.md §4.2.2.
    #[arg(long)]
    pub ingress_hostname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub private_key_path: PathBuf,
    pub port: u16,
    pub registry_base_url: String,
    pub ingress_hostname: String,
    pub tunnel_ports: HashMap<String, u16>,
}

const DEFAULT_PORT: u16 = 22;

impl BrokerConfig {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
                toml::from_str::<FileConfig>(&text)
                    .map_err(|e| anyhow::anyhow!("parsing config {}: {}", path.display(), e))?
            }
            None => FileConfig::default(),
        };

        let private_key_path = cli
            .private_key
            .or(file.private_key)
            .ok_or_else(|| anyhow::anyhow!("no --private-key given and no private_key in config"))?;

        let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);

        let registry_base_url = cli
            .registry_base_url
            .or(file.registry_base_url)
            .ok_or_else(|| anyhow::anyhow!("no --registry-base-url given and no registry_base_url in config"))?;

        let ingress_hostname = cli
            .ingress_hostname
            .or(file.ingress_hostname)
            .unwrap_or_else(|| "ws".to_string());

        Ok(Self {
            private_key_path,
            port,
            registry_base_url,
            ingress_hostname,
            tunnel_ports: file.tunnel_ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            private_key: None,
            port: None,
            registry_base_url: None,
            ingress_hostname: None,
        }
    }

    #[test]
    fn loads_tunnel_ports_and_defaults_ingress_hostname() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"private_key = "/etc/broker.key""#).unwrap();
        writeln!(file, r#"registry_base_url = "http://api:8080""#).unwrap();
        writeln!(file, "[tunnel_ports]").unwrap();
        writeln!(file, r#"uid-A = 2200"#).unwrap();

        let config = BrokerConfig::load(cli(Some(file.path().to_path_buf()))).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ingress_hostname, "ws");
        assert_eq!(config.tunnel_ports.get("uid-A"), Some(&2200));
    }

    #[test]
    fn cli_registry_base_url_overrides_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"private_key = "/etc/broker.key""#).unwrap();
        writeln!(file, r#"registry_base_url = "http://from-file:8080""#).unwrap();

        let mut args = cli(Some(file.path().to_path_buf()));
        args.registry_base_url = Some("http://from-cli:8080".to_string());

        let config = BrokerConfig::load(args).unwrap();
        assert_eq!(config.registry_base_url, "http://from-cli:8080");
    }

    #[test]
    fn missing_registry_base_url_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"private_key = "/etc/broker.key""#).unwrap();

        assert!(BrokerConfig::load(cli(Some(file.path().to_path_buf()))).is_err());
    }
}
