//! Local-credential password authentication.
//!
//! `Authenticate(user, password) -> bool` is a pluggable hook (spec.md
//! §4.1): only a `true` return admits the session. The default
//! implementation here goes through PAM, which is the closest Rust
//! equivalent of the `sshserver.Auth` call in the original agent.

use pam::Authenticator;
use tracing::warn;

/// The pluggable password-authentication surface.
#[async_trait::async_trait]
pub trait LocalAuthenticator: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> bool;
}

/// PAM-backed authenticator using the `sshd` service stack, matching the
/// credential surface the original agent's `Auth()` call wraps.
pub struct PamAuthenticator {
    service: String,
}

impl PamAuthenticator {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for PamAuthenticator {
    fn default() -> Self {
        Self::new("sshd")
    }
}

#[async_trait::async_trait]
impl LocalAuthenticator for PamAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> bool {
        let service = self.service.clone();
        let user = user.to_string();
        let password = password.to_string();

        tokio::task::spawn_blocking(move || {
            let mut authenticator = match Authenticator::with_password(&service) {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "failed to initialize PAM authenticator");
                    return false;
                }
            };

            authenticator
                .get_handler()
                .set_credentials(&user, &password);

            match authenticator.authenticate() {
                Ok(()) => authenticator.open_session().is_ok(),
                Err(e) => {
                    warn!(error = %e, %user, "PAM authentication rejected");
                    false
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
pub struct AlwaysAccept;

#[cfg(test)]
#[async_trait::async_trait]
impl LocalAuthenticator for AlwaysAccept {
    async fn authenticate(&self, _user: &str, _password: &str) -> bool {
        true
    }
}

#[cfg(test)]
pub struct AlwaysReject;

#[cfg(test)]
#[async_trait::async_trait]
impl LocalAuthenticator for AlwaysReject {
    async fn authenticate(&self, _user: &str, _password: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_accept_admits_any_credentials() {
        assert!(AlwaysAccept.authenticate("alice", "wrong-password").await);
    }

    #[tokio::test]
    async fn always_reject_admits_nothing() {
        assert!(!AlwaysReject.authenticate("alice", "correct-password").await);
    }
}
