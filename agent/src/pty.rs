//! PTY allocation and shell/command spawning bound to a local user.
//!
//! Grounded on `examples/otty-shell-otty/otty-pty/src/unix.rs` (openpty +
//! `pre_exec` session/controlling-tty setup) and on
//! `examples/other_examples/9b674187_pithecene-io-clippy__src-pty-mod.rs.rs`
//! (owning the PTY master as a single `File`, written to directly via raw
//! fd and read back through `tokio::io::unix::AsyncFd`).

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::unistd::User;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("unknown local user {0:?}")]
    UnknownUser(String),
    #[error("pty allocation failed: {0}")]
    Alloc(#[from] nix::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Resolves the shell to run: the agent process's own `SHELL` env var wins
/// if set, otherwise the account's configured default shell (spec.md §6).
pub fn resolve_shell(user: &User) -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => user.shell.to_string_lossy().into_owned(),
    }
}

pub fn local_user(name: &str) -> Result<User, PtyError> {
    User::from_name(name)?.ok_or_else(|| PtyError::UnknownUser(name.to_string()))
}

fn base_env(user: &User, term: &str, device_name: &str) -> Vec<(String, String)> {
    vec![
        ("HOME".into(), user.dir.to_string_lossy().into_owned()),
        ("SHELL".into(), user.shell.to_string_lossy().into_owned()),
        ("USER".into(), user.name.clone()),
        ("LOGNAME".into(), user.name.clone()),
        ("TERM".into(), term.to_string()),
        ("GATEWAY_DEVICE_NAME".into(), device_name.to_string()),
    ]
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A shell (or bare command) spawned as a login shell under a local user,
/// attached to a freshly allocated PTY. `master` is the sole owner of the
/// master fd; readers/writers both act on its raw fd.
pub struct ShellCommand {
    pub child: Child,
    pub master: File,
}

impl ShellCommand {
    /// Builds and spawns `shell --login` under `user`'s credentials.
    pub fn spawn_login_shell(
        user: &str,
        term: &str,
        device_name: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Self, PtyError> {
        let user = local_user(user)?;
        let term = if term.is_empty() { "xterm" } else { term };
        let shell = resolve_shell(&user);
        let env = base_env(&user, term, device_name);
        let size = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let pty = openpty(Some(&size), None)?;
        let master = File::from(pty.master);
        let slave = File::from(pty.slave);

        let mut cmd = Command::new(&shell);
        cmd.arg("--login");
        cmd.env_clear();
        for (k, v) in &env {
            cmd.env(k, v);
        }
        cmd.uid(user.uid.as_raw());
        cmd.gid(user.gid.as_raw());
        cmd.current_dir(&user.dir);

        let slave_stdin = slave.try_clone()?;
        let slave_stderr = slave.try_clone()?;
        cmd.stdin(slave_stdin).stdout(slave).stderr(slave_stderr);

        let master_fd = master.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(master_fd);
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        set_nonblocking(master.as_raw_fd())?;
        Ok(Self { child, master })
    }

    /// Applies a window-change event to the PTY master: ioctl
    /// `TIOCSWINSZ`, pixel dimensions fixed at zero (spec.md §4.1).
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let size = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let res = unsafe {
            libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size as *const _)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        write_raw(self.master.as_raw_fd(), data)
    }

    /// Kills the child (if still running) and waits for it on a blocking
    /// thread so it doesn't linger as a zombie (spec.md §4.1: "Wait for the
    /// child to exit"). `std::process::Child::wait` blocks the calling
    /// thread, hence `spawn_blocking` rather than an async wait.
    pub fn reap(mut self) {
        let _ = self.child.kill();
        tokio::task::spawn_blocking(move || {
            let _ = self.child.wait();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `SHELL` is process-global; serialize the two tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn resolve_shell_honors_process_shell_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SHELL", "/bin/custom-shell");
        let user = local_user("root").expect("root account must exist");
        assert_eq!(resolve_shell(&user), "/bin/custom-shell");
        std::env::remove_var("SHELL");
    }

    #[test]
    fn resolve_shell_falls_back_to_account_shell_when_env_empty() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SHELL", "");
        let user = local_user("root").expect("root account must exist");
        assert_eq!(resolve_shell(&user), user.shell.to_string_lossy());
        std::env::remove_var("SHELL");
    }

    #[test]
    fn unknown_user_is_an_error() {
        assert!(matches!(
            local_user("no-such-user-xyz123"),
            Err(PtyError::UnknownUser(_))
        ));
    }
}

fn write_raw(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

/// A bare, non-interactive command bound to a local user's credentials,
/// wired via stdio pipes rather than a PTY (spec.md §4.1, non-PTY branch).
pub struct RawCommand {
    pub child: tokio::process::Child,
}

impl RawCommand {
    pub fn spawn(user: &str, device_name: &str, argv: &[String]) -> Result<Self, PtyError> {
        let user = local_user(user)?;
        let env = base_env(&user, "", device_name);

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        for (k, v) in &env {
            cmd.env(k, v);
        }
        cmd.uid(user.uid.as_raw());
        cmd.gid(user.gid.as_raw());
        cmd.current_dir(&user.dir);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        Ok(Self { child })
    }

    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}
