//! The agent's SSH server: accepts the single loopback connection the
//! reverse tunnel carries, authenticates against local OS credentials, and
//! attaches PTY or raw-command sessions.
//!
//! Grounded on the `Handler`/`Server` trait shape in
//! `examples/other_examples/1731a3ea_pawurb-tuihost-rs__src-handler.rs.rs`
//! and `examples/other_examples/06e65e00_ZingerLittleBee-EXLO__apps-tunnl-src-main.rs.rs`
//! (whitelist-style request handling, `new_client`/`run_on_address`
//! bootstrap), generalized from a single fixed command into the agent's
//! PTY-or-exec session model (spec.md §4.1).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PrivateKey;
use russh::server::{Auth, Handle, Handler, Msg, Server as RusshServer, Session as RusshSession};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, Pty};
use tokio::io::{AsyncReadExt, unix::AsyncFd};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::LocalAuthenticator;
use crate::pty::{RawCommand, ShellCommand};
use crate::sessions::{Session, SessionRegistry};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

pub struct AgentServer {
    authenticator: Arc<dyn LocalAuthenticator>,
    device_name: String,
}

impl AgentServer {
    pub fn new(authenticator: Arc<dyn LocalAuthenticator>, device_name: String) -> Self {
        Self {
            authenticator,
            device_name,
        }
    }

    pub async fn run(
        self,
        key: PrivateKey,
        port: u16,
        inactivity_timeout: std::time::Duration,
    ) -> anyhow::Result<()> {
        let config = russh::server::Config {
            methods: russh::MethodSet::PASSWORD | russh::MethodSet::PUBLICKEY,
            server_id: russh::SshId::Standard("SSH-2.0-gateway-agent".to_string()),
            keys: vec![key],
            inactivity_timeout: Some(inactivity_timeout),
            ..Default::default()
        };
        let config = Arc::new(config);
        // Bound to loopback only: the only path in is the reverse tunnel
        // the agent itself dials out over (spec.md §4.1).
        let addr = format!("127.0.0.1:{port}");
        info!(%addr, "agent SSH server listening on loopback");

        let mut server = self;
        server.run_on_address(config, addr).await?;
        Ok(())
    }
}

impl RusshServer for AgentServer {
    type Handler = AgentHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(?peer_addr, "new connection on agent loopback listener");
        AgentHandler {
            authenticator: self.authenticator.clone(),
            device_name: self.device_name.clone(),
            user: None,
            sessions: SessionRegistry::new(),
            channel_session_ids: HashMap::new(),
            pty_cols: DEFAULT_COLS,
            pty_rows: DEFAULT_ROWS,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!(%error, "agent session error");
    }
}

pub struct AgentHandler {
    authenticator: Arc<dyn LocalAuthenticator>,
    device_name: String,
    user: Option<String>,
    sessions: SessionRegistry,
    channel_session_ids: HashMap<ChannelId, Uuid>,
    pty_cols: u16,
    pty_rows: u16,
}

/// The close-callback invariant (spec.md §4.1/§9/§5): when the underlying
/// TCP connection closes — cleanly or via RST — every `ShellCommand`/
/// `RawCommand` this handler registered must be reaped. `channel_close`
/// covers a clean SSH-level teardown; this `Drop` is the fail-safe for an
/// abrupt connection loss, since russh drops the per-connection `Handler`
/// when its connection task ends either way.
impl Drop for AgentHandler {
    fn drop(&mut self) {
        for id in self.channel_session_ids.values() {
            self.sessions.remove(id);
        }
    }
}

impl AgentHandler {
    fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }

    /// Pumps output from a readable source into the channel until EOF or
    /// error, then tears the session down. `read` is called with the
    /// AsyncFd's guard borrowed mutably each iteration.
    fn spawn_pty_pump(handle: Handle, channel: ChannelId, reader: AsyncFd<std::fs::File>, id: Uuid, sessions: SessionRegistry) {
        tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                let mut guard = match reader.readable_mut().await {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                match guard.try_io(|fd| std::io::Read::read(fd.get_mut(), &mut buf)) {
                    Ok(Ok(0)) => {
                        let _ = handle.eof(channel).await;
                        let _ = handle.close(channel).await;
                        break;
                    }
                    Ok(Ok(n)) => {
                        if handle
                            .data(channel, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "pty read error");
                        let _ = handle.close(channel).await;
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
            sessions.remove(&id);
        });
    }

    fn spawn_exec_pump(
        handle: Handle,
        channel: ChannelId,
        mut stdout: tokio::process::ChildStdout,
        id: Uuid,
        sessions: SessionRegistry,
    ) {
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        let _ = handle.eof(channel).await;
                        let _ = handle.close(channel).await;
                        break;
                    }
                    Ok(n) => {
                        if handle
                            .data(channel, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "exec stdout read error");
                        let _ = handle.close(channel).await;
                        break;
                    }
                }
            }
            sessions.remove(&id);
        });
    }
}

impl Handler for AgentHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Permissive stub (spec.md §4.1): the broker is the real key
        // authenticator, and this listener only ever hears from the broker
        // over the loopback reverse tunnel. Preserve accept-all here but
        // remember the user, mirroring auth_password, so a key-only session
        // still resolves a local account for pty/exec.
        debug!(%user, "accepting public-key auth (permissive stub)");
        self.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.authenticator.authenticate(user, password).await {
            self.user = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            warn!(%user, "rejected password authentication");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut RusshSession,
    ) -> Result<bool, Self::Error> {
        Ok(true)
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
        self.pty_cols = col_width.clamp(1, u16::MAX as u32) as u16;
        self.pty_rows = row_height.clamp(1, u16::MAX as u32) as u16;

        match ShellCommand::spawn_login_shell(
            self.user(),
            term,
            &self.device_name,
            self.pty_cols,
            self.pty_rows,
        ) {
            Ok(shell) => {
                let reader_file = shell
                    .master
                    .try_clone()
                    .map_err(|_| russh::Error::Disconnect)?;
                let reader = AsyncFd::new(reader_file).map_err(|_| russh::Error::Disconnect)?;

                let id = Uuid::new_v4();
                self.sessions.insert(id, Session::Pty(shell));
                self.channel_session_ids.insert(channel, id);

                Self::spawn_pty_pump(
                    session.handle(),
                    channel,
                    reader,
                    id,
                    self.sessions.clone(),
                );
                session.channel_success(channel)?;
            }
            Err(e) => {
                // spec.md §4.1: pty allocation failure logs and continues
                // with the session open but no child — register a no-op
                // session so shell_request/data degrade to EOF instead of
                // rejecting the channel outright.
                warn!(error = %e, "failed to allocate pty, continuing without a child");
                let id = Uuid::new_v4();
                self.sessions.insert(id, Session::Empty);
                self.channel_session_ids.insert(channel, id);
                session.channel_success(channel)?;
                let _ = session.handle().eof(channel).await;
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if self.channel_session_ids.contains_key(&channel) {
            session.channel_success(channel)?;
        } else {
            warn!("shell request without a prior pty request");
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command];

        match RawCommand::spawn(self.user(), &self.device_name, &argv) {
            Ok(mut cmd) => {
                let id = Uuid::new_v4();
                let stdout = cmd.child.stdout.take();
                let stdin = cmd.child.stdin.take();

                if let Some(stdout) = stdout {
                    Self::spawn_exec_pump(session.handle(), channel, stdout, id, self.sessions.clone());
                }

                self.sessions.insert(
                    id,
                    Session::Raw {
                        child: cmd.child,
                        stdin,
                    },
                );
                self.channel_session_ids.insert(channel, id);
                session.channel_success(channel)?;
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn exec command");
                session.channel_failure(channel)?;
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if let Some(id) = self.channel_session_ids.get(&channel) {
            if let Err(e) = self.sessions.write(id, data).await {
                debug!(error = %e, "session write failed");
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
        if let Some(id) = self.channel_session_ids.get(&channel) {
            let cols = col_width.clamp(1, u16::MAX as u32) as u16;
            let rows = row_height.clamp(1, u16::MAX as u32) as u16;
            if let Err(e) = self.sessions.resize(id, cols, rows) {
                warn!(error = %e, "pty resize failed");
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if let Some(id) = self.channel_session_ids.remove(&channel) {
            self.sessions.remove(&id);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        _channel: ChannelId,
        name: &str,
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
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

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut RusshSession,
    ) -> Result<bool, Self::Error> {
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

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut RusshSession,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }
}
