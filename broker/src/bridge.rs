//! Bridges one operator-facing SSH channel to the outbound client channel
//! dialed against the agent's reverse-tunnel port (spec.md §4.2.3).
//!
//! The single pump task owning the outbound `Channel` follows the shape of
//! `examples/AnalyseDeCircuit-oxideterm/src-tauri/src/ssh/session.rs`'s
//! extended-channel handler: one task, one `tokio::select!` between inbound
//! commands and `channel.wait()`, rather than splitting a non-`Clone`
//! `Channel` across two tasks.

use russh::client::{self, Msg as ClientMsg};
use russh::server::Handle as ServerHandle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::AgentClientHandler;

/// What the operator side forwards toward the agent.
pub enum BridgeCmd {
    Data(Vec<u8>),
    Resize(u16, u16),
}

/// Which of the two sides ended first — purely informational; both signals
/// drive identical cleanup (spec.md §9's "race into a 1-slot channel"
/// ambiguity, resolved here with a buffered capacity-2 channel so a
/// near-simultaneous second signal is absorbed rather than blocking).
#[derive(Debug, Clone, Copy)]
pub enum Ended {
    Operator,
    Agent,
}

/// Spawns the pump task for a PTY-backed session: requests a shell on the
/// already PTY-negotiated client channel, then bridges bytes and
/// window-change events until either side ends.
pub fn spawn_pty_bridge(
    client_channel: Channel<ClientMsg>,
    server_handle: ServerHandle,
    server_channel: ChannelId,
    cmd_rx: mpsc::UnboundedReceiver<BridgeCmd>,
    done_tx: mpsc::Sender<Ended>,
    uid: Uuid,
) {
    tokio::spawn(async move {
        if let Err(e) = client_channel.request_shell(true).await {
            warn!(%uid, error = %e, "agent rejected shell request");
            let _ = done_tx.send(Ended::Agent).await;
            return;
        }
        run_pump(client_channel, server_handle, server_channel, cmd_rx, done_tx, uid, true).await;
    });
}

/// Spawns the pump task for a raw (non-PTY) exec session: starts the
/// operator's command on the client channel, then bridges bytes only (no
/// window-change plumbing — spec.md §4.2.3's raw-mode path).
pub fn spawn_raw_bridge(
    client_channel: Channel<ClientMsg>,
    command: &[u8],
    server_handle: ServerHandle,
    server_channel: ChannelId,
    cmd_rx: mpsc::UnboundedReceiver<BridgeCmd>,
    done_tx: mpsc::Sender<Ended>,
    uid: Uuid,
) {
    let command = command.to_vec();
    tokio::spawn(async move {
        // spec.md §9: a raw-mode Start failure is logged, not propagated —
        // the session still runs (and still emits exactly one `finish`).
        if let Err(e) = client_channel.exec(true, command).await {
            warn!(%uid, error = %e, "agent rejected raw command, continuing without propagating");
        }
        run_pump(client_channel, server_handle, server_channel, cmd_rx, done_tx, uid, false).await;
    });
}

async fn run_pump(
    mut client_channel: Channel<ClientMsg>,
    server_handle: ServerHandle,
    server_channel: ChannelId,
    mut cmd_rx: mpsc::UnboundedReceiver<BridgeCmd>,
    done_tx: mpsc::Sender<Ended>,
    uid: Uuid,
    supports_resize: bool,
) {
    let ended = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(BridgeCmd::Data(data)) => {
                        if let Err(e) = client_channel.data(&data[..]).await {
                            debug!(%uid, error = %e, "write to agent channel failed");
                            break Ended::Agent;
                        }
                    }
                    Some(BridgeCmd::Resize(cols, rows)) if supports_resize => {
                        if let Err(e) = client_channel.window_change(cols as u32, rows as u32, 0, 0).await {
                            warn!(%uid, error = %e, "window-change to agent failed");
                        }
                    }
                    Some(BridgeCmd::Resize(..)) => {}
                    None => break Ended::Operator,
                }
            }
            msg = client_channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if server_handle
                            .data(server_channel, CryptoVec::from_slice(&data))
                            .await
                            .is_err()
                        {
                            break Ended::Operator;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(%uid, exit_status, "agent command exited");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break Ended::Agent,
                    _ => {}
                }
            }
        }
    };

    let _ = server_handle.eof(server_channel).await;
    let _ = server_handle.close(server_channel).await;
    let _ = done_tx.send(ended).await;
}

/// Drives the cascading close once either side ends: force-closes both SSH
/// connections, then issues the one `finish` call for this session
/// (spec.md §4.2.4/§5). Spawned once per channel alongside the pump task.
pub fn spawn_completion_waiter(
    mut done_rx: mpsc::Receiver<Ended>,
    client_handle: client::Handle<AgentClientHandler>,
    server_handle: ServerHandle,
    server_channel: ChannelId,
    uid: Uuid,
    on_finish: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        match done_rx.recv().await {
            Some(which) => debug!(%uid, ?which, "session side ended, tearing down"),
            None => return,
        }

        let _ = client_handle
            .disconnect(Disconnect::ByApplication, "session ended", "en")
            .await;
        let _ = server_handle.close(server_channel).await;

        on_finish();

        // Drain a possible second near-simultaneous signal so its sender
        // never blocks; spec.md §9 calls this out explicitly.
        tokio::spawn(async move {
            let _ = done_rx.recv().await;
        });
    });
}
