//! Shared registry of in-flight shell/command sessions.
//!
//! Mirrors the teacher's `AppState` pattern of a `DashMap` keyed by an
//! opaque UID, shared across the server's connection handlers without a
//! surrounding mutex (spec.md §5, "concurrent map" design).

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child as TokioChild, ChildStdin};
use uuid::Uuid;

use crate::pty::ShellCommand;

pub enum Session {
    Pty(ShellCommand),
    Raw {
        child: TokioChild,
        stdin: Option<ChildStdin>,
    },
    /// A PTY was requested but allocation failed. spec.md §4.1: "log and
    /// continue with the session open but no child — the session will see
    /// EOF on stdout." Resize/write are no-ops; there is nothing to reap.
    Empty,
}

impl Session {
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        match self {
            Session::Pty(s) => s.resize(cols, rows),
            Session::Raw { .. } | Session::Empty => Ok(()),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Session::Pty(s) => {
                s.write(data)?;
                Ok(())
            }
            Session::Raw {
                stdin: Some(stdin), ..
            } => stdin.write_all(data).await,
            Session::Raw { stdin: None, .. } => Ok(()),
            Session::Empty => Ok(()),
        }
    }

    /// Tears the session down: kills the child (if any) and reaps it so it
    /// doesn't linger as a zombie (spec.md §4.1, "Wait for the child to
    /// exit"). Tokio's `Child` reaps itself once dropped; the `std::process`
    /// child behind `ShellCommand` does not, hence `ShellCommand::reap`.
    pub fn reap(self) {
        match self {
            Session::Pty(s) => s.reap(),
            Session::Raw { mut child, .. } => {
                let _ = child.start_kill();
            }
            Session::Empty => {}
        }
    }
}

/// Registry of sessions currently attached to a channel, keyed by a
/// per-channel session UID minted at `channel_open_session` time.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    inner: Arc<DashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Uuid, session: Session) {
        self.inner.insert(id, session);
    }

    pub fn resize(&self, id: &Uuid, cols: u16, rows: u16) -> io::Result<()> {
        match self.inner.get(id) {
            Some(session) => session.resize(cols, rows),
            None => Ok(()),
        }
    }

    pub async fn write(&self, id: &Uuid, data: &[u8]) -> io::Result<()> {
        let mut session = match self.inner.get_mut(id) {
            Some(session) => session,
            None => return Ok(()),
        };
        session.write(data).await
    }

    pub fn remove(&self, id: &Uuid) {
        if let Some((_, session)) = self.inner.remove(id) {
            session.reap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_on_an_absent_session_are_a_noop() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        assert!(registry.write(&id, b"hi").await.is_ok());
        assert!(registry.resize(&id, 80, 24).is_ok());
        registry.remove(&id);
    }

    #[tokio::test]
    async fn remove_kills_the_child_and_drops_the_entry() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let child = tokio::process::Command::new("sleep")
            .arg("5")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");

        registry.insert(id, Session::Raw { child, stdin: None });
        registry.remove(&id);

        // The entry is gone; a second remove is a no-op rather than a panic.
        registry.remove(&id);
        assert!(registry.write(&id, b"x").await.is_ok());
    }
}
