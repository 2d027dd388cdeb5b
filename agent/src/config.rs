//! Agent configuration.
//!
//! Recognized options, per the external configuration surface: a host key
//! file, a listen port, a device name propagated into spawned shells, and
//! the `SHELL` environment variable as the shell-fallback override (read at
//! session time, not part of the static file — see `pty::resolve_shell`).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    private_key: Option<PathBuf>,
    port: Option<u16>,
    device_name: Option<String>,
}

/// Embedded device-side SSH server.
#[derive(Debug, Parser)]
#[command(name = "gateway-agent")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags below take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the SSH host private key file.
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Loopback port to listen on (reachable only over the reverse tunnel).
    #[arg(long)]
    pub port: Option<u16>,

    /// Device name propagated into spawned shell environments.
    #[arg(long)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub private_key_path: PathBuf,
    pub port: u16,
    pub device_name: String,
}

const DEFAULT_PORT: u16 = 2222;

impl AgentConfig {
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
        let device_name = cli.device_name.or(file.device_name).unwrap_or_default();

        Ok(Self {
            private_key_path,
            port,
            device_name,
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
            device_name: None,
        }
    }

    #[test]
    fn cli_flags_take_precedence_over_the_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"private_key = "/etc/from-file.key""#).unwrap();
        writeln!(file, "port = 2200").unwrap();

        let mut args = cli(Some(file.path().to_path_buf()));
        args.port = Some(9999);

        let config = AgentConfig::load(args).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.private_key_path, PathBuf::from("/etc/from-file.key"));
    }

    #[test]
    fn missing_port_falls_back_to_the_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"private_key = "/etc/host.key""#).unwrap();

        let config = AgentConfig::load(cli(Some(file.path().to_path_buf()))).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn no_private_key_anywhere_is_an_error() {
        assert!(AgentConfig::load(cli(None)).is_err());
    }
}
