//! The broker's operator-facing SSH server: accepts operator connections,
//! parses the target out of the login name, resolves it, registers the
//! session, dials the agent over its reverse-tunnel port, and stitches the
//! two SSH sessions together (spec.md §4.2).
//!
//! Handler shape grounded on the same pack examples as the agent's
//! `server.rs`; the registration/dial/bridge sequencing is grounded on
//! `examples/original_source/ssh/session.go`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::client::{self, Msg as ClientMsg};
use russh::keys::PrivateKey;
use russh::server::{Auth, Handler, Msg, Server as RusshServer, Session as RusshSession};
use russh::{Channel, ChannelId, Disconnect, Pty};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gateway_registry::{RegistryClient, Session as RegistrySession};

use crate::bridge::{self, BridgeCmd};
use crate::client::AgentClientHandler;
use crate::error::BrokerError;
use crate::ip;
use crate::stats::BrokerStats;
use crate::target;
use crate::tunnel::TunnelPorts;

/// Per-channel bridging state. One channel per connection is the expected
/// shape (spec.md §1 Non-goals: no multiplexing), but the map keys on
/// `ChannelId` rather than assuming a single channel, matching the agent
/// handler's style.
#[derive(Default)]
struct ChannelState {
    device_uid: String,
    port: u16,
    established: bool,
    pty: Option<(String, u16, u16)>,
    client_channel: Option<Channel<ClientMsg>>,
    client_handle: Option<client::Handle<AgentClientHandler>>,
    cmd_tx: Option<mpsc::UnboundedSender<BridgeCmd>>,
}

pub struct BrokerServer {
    registry: Arc<dyn RegistryClient>,
    tunnel_ports: TunnelPorts,
    ingress_hostname: String,
    stats: Arc<BrokerStats>,
}

impl BrokerServer {
    pub fn new(registry: Arc<dyn RegistryClient>, tunnel_ports: TunnelPorts, ingress_hostname: String) -> Self {
        Self {
            registry,
            tunnel_ports,
            ingress_hostname,
            stats: Arc::new(BrokerStats::default()),
        }
    }

    pub async fn run(self, key: PrivateKey, port: u16) -> anyhow::Result<()> {
        let config = russh::server::Config {
            methods: russh::MethodSet::PASSWORD | russh::MethodSet::PUBLICKEY,
            server_id: russh::SshId::Standard("SSH-2.0-gateway-broker".to_string()),
            keys: vec![key],
            ..Default::default()
        };
        let config = Arc::new(config);
        let addr = format!("0.0.0.0:{port}");
        info!(%addr, "broker SSH server listening for operator connections");

        let mut server = self;
        server.run_on_address(config, addr).await?;
        Ok(())
    }
}

impl RusshServer for BrokerServer {
    type Handler = BrokerHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let uid = Uuid::new_v4();
        debug!(%uid, ?peer_addr, "new operator connection");
        BrokerHandler {
            registry: self.registry.clone(),
            tunnel_ports: self.tunnel_ports.clone(),
            ingress_hostname: self.ingress_hostname.clone(),
            stats: self.stats.clone(),
            uid,
            peer_addr,
            login: None,
            password: None,
            env_overrides: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!(%error, "broker session error");
    }
}

pub struct BrokerHandler {
    registry: Arc<dyn RegistryClient>,
    tunnel_ports: TunnelPorts,
    ingress_hostname: String,
    stats: Arc<BrokerStats>,
    uid: Uuid,
    peer_addr: Option<SocketAddr>,
    login: Option<String>,
    password: Option<String>,
    env_overrides: HashMap<String, String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl BrokerHandler {
    /// Parses the target, resolves it, registers the session and dials the
    /// agent, idempotently: a second call for an already-established channel
    /// is a no-op. Implements spec.md §4.2.1–§4.2.3 in sequence.
    async fn ensure_established(&mut self, channel: ChannelId) -> Result<(), BrokerError> {
        if self.channels.get(&channel).is_some_and(|s| s.established) {
            return Ok(());
        }

        let login = self
            .login
            .clone()
            .ok_or_else(|| BrokerError::InvalidSessionTarget(String::new()))?;
        let (user, raw_target) = target::parse_login(&login)?;

        let device_uid = match target::split_domain_name(&raw_target) {
            Some((domain, name)) => {
                let record = self
                    .registry
                    .lookup(domain, name)
                    .await
                    .map_err(|e| BrokerError::Lookup(e.to_string()))?;
                record.uid
            }
            None => raw_target,
        };

        let port = self
            .tunnel_ports
            .resolve(&device_uid)
            .ok_or_else(|| BrokerError::DialFailed(format!("no tunnel port for device {device_uid}")))?;

        let peer_ip = self
            .peer_addr
            .map(|a| a.ip())
            .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
        let ip_override = self.env_overrides.get("IP_ADDRESS").map(String::as_str);
        let ip_address = ip::resolve_client_ip(peer_ip, &self.ingress_hostname, ip_override).await;

        let mut session = RegistrySession::new(self.uid.to_string(), user.clone(), device_uid.clone());
        session.ip_address = ip_address;
        session.port = port as u32;

        self.registry
            .register(&session)
            .await
            .map_err(|e| BrokerError::RegisterFailed(e.to_string()))?;
        self.stats.mark_registered(self.uid, &user, &device_uid);

        let password = self.password.clone().unwrap_or_default();
        let dial_result = async {
            let handle = crate::client::dial(port, &user, &password).await?;
            let chan = handle
                .channel_open_session()
                .await
                .map_err(|e| BrokerError::ClientSessionFailed(e.to_string()))?;
            Ok::<_, BrokerError>((handle, chan))
        }
        .await;

        let (client_handle, client_channel) = match dial_result {
            Ok(pair) => pair,
            Err(e) => {
                // register already succeeded: the invariant that every
                // successful register gets exactly one finish still holds.
                if let Err(finish_err) = self.registry.finish(&self.uid.to_string()).await {
                    warn!(uid = %self.uid, error = %finish_err, "finish call failed after dial error");
                }
                self.stats.mark_finished(self.uid);
                return Err(e);
            }
        };

        let state = self.channels.entry(channel).or_default();
        state.device_uid = device_uid;
        state.port = port;
        state.client_channel = Some(client_channel);
        state.client_handle = Some(client_handle);
        state.established = true;
        Ok(())
    }

    fn spawn_finish(&self) {
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let uid = self.uid;
        tokio::spawn(async move {
            if let Err(e) = registry.finish(&uid.to_string()).await {
                warn!(%uid, error = %e, "finish call failed");
            }
            stats.mark_finished(uid);
        });
    }

    /// Logs, rejects the channel and disconnects. If the channel had already
    /// been registered with the control plane (e.g. the PTY request itself
    /// failed after a successful dial), issues `finish` directly rather than
    /// depending on `channel_close` firing during teardown.
    fn fail_channel(&mut self, channel: ChannelId, session: &mut RusshSession, err: BrokerError) {
        warn!(uid = %self.uid, error = %err, "session setup failed");
        if let Some(state) = self.channels.remove(&channel) {
            if state.established {
                self.spawn_finish();
            }
        }
        let _ = session.channel_failure(channel);
        let _ = session.disconnect(Disconnect::ByApplication, "session setup failed", "en");
    }
}

impl Handler for BrokerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Real key-based operator auth is an external control-plane concern
        // (spec.md §6: "public-key auth (details out of scope)"); unlike the
        // agent's loopback-bound stub, this server is internet-facing, so
        // the safe default here is reject rather than accept-all.
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // The broker does not itself validate the password against the
        // target device's local account — that check happens when the
        // dialed agent authenticates it (spec.md §4.2.3). A wrong password
        // surfaces later as a dial/client-session failure that closes the
        // session (scenario #3), not as an SSH-level auth rejection here.
        self.login = Some(user.to_string());
        self.password = Some(password.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut RusshSession,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        self.env_overrides
            .insert(variable_name.to_string(), variable_value.to_string());
        session.channel_success(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if let Err(e) = self.ensure_established(channel).await {
            self.fail_channel(channel, session, e);
            return Ok(());
        }

        let cols = col_width.clamp(1, u16::MAX as u32) as u16;
        let rows = row_height.clamp(1, u16::MAX as u32) as u16;
        let term = if term.is_empty() { "xterm" } else { term };

        let state = self.channels.get_mut(&channel).expect("established above");
        let client_channel = state.client_channel.as_ref().expect("established above");
        match client_channel.request_pty(true, term, cols as u32, rows as u32, 0, 0, &[]).await {
            Ok(()) => {
                state.pty = Some((term.to_string(), cols, rows));
                session.channel_success(channel)?;
            }
            Err(e) => {
                self.fail_channel(channel, session, BrokerError::ClientSessionFailed(e.to_string()));
            }
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut RusshSession) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        if state.pty.is_none() {
            warn!(uid = %self.uid, "shell request without a prior pty request");
            session.channel_failure(channel)?;
            return Ok(());
        }

        let client_channel = state.client_channel.take().expect("pty request populated this");
        let client_handle = state.client_handle.take().expect("pty request populated this");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        state.cmd_tx = Some(cmd_tx);
        let (done_tx, done_rx) = mpsc::channel(2);

        let server_handle = session.handle();
        bridge::spawn_pty_bridge(client_channel, server_handle.clone(), channel, cmd_rx, done_tx, self.uid);

        let finisher = self.clone_finisher();
        bridge::spawn_completion_waiter(done_rx, client_handle, server_handle, channel, self.uid, finisher);

        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut RusshSession) -> Result<(), Self::Error> {
        if let Err(e) = self.ensure_established(channel).await {
            self.fail_channel(channel, session, e);
            return Ok(());
        }

        let state = self.channels.get_mut(&channel).expect("established above");
        let client_channel = state.client_channel.take().expect("established above");
        let client_handle = state.client_handle.take().expect("established above");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        state.cmd_tx = Some(cmd_tx);
        let (done_tx, done_rx) = mpsc::channel(2);

        let server_handle = session.handle();
        bridge::spawn_raw_bridge(client_channel, data, server_handle.clone(), channel, cmd_rx, done_tx, self.uid);

        let finisher = self.clone_finisher();
        bridge::spawn_completion_waiter(done_rx, client_handle, server_handle, channel, self.uid, finisher);

        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut RusshSession) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(tx) = &state.cmd_tx {
                let _ = tx.send(BridgeCmd::Data(data.to_vec()));
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(tx) = &state.cmd_tx {
                let cols = col_width.clamp(1, u16::MAX as u32) as u16;
                let rows = row_height.clamp(1, u16::MAX as u32) as u16;
                let _ = tx.send(BridgeCmd::Resize(cols, rows));
            }
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut RusshSession) -> Result<(), Self::Error> {
        // Dropping `cmd_tx` makes the bridge task's receiver observe `None`
        // on its next poll, which is the "operator side closed" signal the
        // pump loop breaks on.
        if let Some(state) = self.channels.remove(&channel) {
            if state.established && state.cmd_tx.is_none() {
                // Registered but no shell/exec ever started bridging: the
                // pump/completion tasks were never spawned, so finish must
                // be issued here instead.
                self.spawn_finish();
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut RusshSession) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn subsystem_request(&mut self, _channel: ChannelId, name: &str, session: &mut RusshSession) -> Result<(), Self::Error> {
        warn!(%name, "rejecting subsystem request");
        session.disconnect(Disconnect::ByApplication, "not permitted", "en")?;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        _channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn tcpip_forward(&mut self, _address: &str, _port: &mut u32, _session: &mut RusshSession) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut RusshSession,
    ) -> Result<bool, Self::Error> {
        drop(channel);
        Ok(false)
    }

    async fn agent_request(&mut self, _channel: ChannelId, _session: &mut RusshSession) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

impl BrokerHandler {
    fn clone_finisher(&self) -> impl FnOnce() + Send + 'static {
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let uid = self.uid;
        move || {
            tokio::spawn(async move {
                if let Err(e) = registry.finish(&uid.to_string()).await {
                    warn!(%uid, error = %e, "finish call failed");
                }
                stats.mark_finished(uid);
            });
        }
    }
}
