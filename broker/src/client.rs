//! Outbound SSH client dial toward an agent's reverse-tunnel port.
//!
//! Grounded on `examples/AnalyseDeCircuit-oxideterm/src-tauri/src/ssh/client.rs`:
//! the `client::Config` + `client::connect` + `authenticate_password` shape,
//! and an unconditionally-accepting `check_server_key` (spec.md §4.2.3: the
//! operator has already been authenticated by the broker and the loopback
//! target is within the trust boundary, so there is no agent host-key
//! verification by design — spec.md §1 Non-goals).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use tracing::debug;

use crate::error::BrokerError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentClientHandler;

impl client::Handler for AgentClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Dials `127.0.0.1:{port}` and authenticates with `user`/`password`,
/// passing through exactly the credentials the operator supplied the
/// broker — the agent's own password auth is the only real check.
pub async fn dial(port: u16, user: &str, password: &str) -> Result<client::Handle<AgentClientHandler>, BrokerError> {
    let addr: SocketAddr = format!("127.0.0.1:{port}")
        .parse()
        .map_err(|e| BrokerError::DialFailed(format!("{e}")))?;

    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..Default::default()
    });

    debug!(%addr, "dialing agent over reverse-tunnel loopback port");

    let mut handle = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        client::connect(config, addr, AgentClientHandler),
    )
    .await
    .map_err(|_| BrokerError::DialFailed("handshake exceeded 10s deadline".to_string()))?
    .map_err(|e| BrokerError::DialFailed(e.to_string()))?;

    let auth = handle
        .authenticate_password(user, password)
        .await
        .map_err(|e| BrokerError::ClientSessionFailed(e.to_string()))?;

    if !auth.success() {
        return Err(BrokerError::ClientSessionFailed(
            "agent rejected password".to_string(),
        ));
    }

    Ok(handle)
}
