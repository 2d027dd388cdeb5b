//! HTTP client for the control-plane session registry.
//!
//! The control plane itself — device registration, user auth, the document
//! store, the MQTT ACL webhook layer — is out of scope for this workspace;
//! this crate only speaks the three endpoints the broker needs to publish
//! and finalize session records, and to resolve `domain.name` targets to a
//! device UID.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One live operator→device SSH bridge, as published to the control plane.
///
/// Field names mirror the wire contract exactly (`username`, `device`,
/// `uid`, `ip_address`); `port` is broker-internal and never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    #[serde(rename = "username")]
    pub user: String,
    #[serde(rename = "device")]
    pub target: String,
    pub uid: String,
    pub ip_address: String,
    #[serde(skip)]
    pub port: u32,
}

impl Session {
    pub fn new(uid: impl Into<String>, user: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            target: target.into(),
            uid: uid.into(),
            ip_address: String::new(),
            port: 0,
        }
    }
}

/// Result of resolving a `domain.name` pair via `GET /internal/lookup`.
/// Other attributes the control plane may return for a device are opaque
/// to this crate.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceLookupRecord {
    pub uid: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("lookup request failed: {0}")]
    LookupFailed(String),
    #[error("device not found for domain/name pair")]
    LookupNotFound,
    #[error("register request failed: {0}")]
    RegisterFailed(String),
    #[error("finish request failed: {0}")]
    FinishFailed(String),
}

/// Where the control plane lives. The original hardcoded `api` and `ws` as
/// in-cluster DNS names; here both are injected so the core stays
/// environment-agnostic (see spec.md §9, "Control-plane coupling").
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL for the control-plane API, e.g. `http://api:8080`.
    pub base_url: String,
    /// Hostname the control plane's ingress resolves to; used for the
    /// forwarded-vs-direct IP trust rule in `Session::register`'s caller.
    pub ingress_hostname: String,
}

/// The three registry operations the broker depends on.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    async fn lookup(&self, domain: &str, name: &str) -> Result<DeviceLookupRecord, RegistryError>;
    async fn register(&self, session: &Session) -> Result<(), RegistryError>;
    async fn finish(&self, uid: &str) -> Result<(), RegistryError>;
}

/// Default `reqwest`-backed implementation.
pub struct HttpRegistryClient {
    http: reqwest::Client,
    config: RegistryConfig,
}

impl HttpRegistryClient {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn lookup(&self, domain: &str, name: &str) -> Result<DeviceLookupRecord, RegistryError> {
        let url = format!("{}/internal/lookup", self.config.base_url);
        let resp = self
            .http
            .get(url)
            .query(&[("domain", domain), ("name", name)])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(%domain, %name, error = %e, "lookup request failed");
                RegistryError::LookupFailed(e.to_string())
            })?;

        if !resp.status().is_success() {
            tracing::warn!(%domain, %name, status = %resp.status(), "device not found");
            return Err(RegistryError::LookupNotFound);
        }

        resp.json::<DeviceLookupRecord>().await.map_err(|e| {
            tracing::warn!(%domain, %name, error = %e, "lookup response was not valid JSON");
            RegistryError::LookupFailed(e.to_string())
        })
    }

    async fn register(&self, session: &Session) -> Result<(), RegistryError> {
        let url = format!("{}/public/sessions", self.config.base_url);
        let resp = self
            .http
            .post(url)
            .json(session)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(uid = %session.uid, error = %e, "register request failed");
                RegistryError::RegisterFailed(e.to_string())
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            tracing::warn!(uid = %session.uid, %status, "registry rejected session registration");
            return Err(RegistryError::RegisterFailed(format!(
                "registry returned {status}"
            )));
        }

        Ok(())
    }

    async fn finish(&self, uid: &str) -> Result<(), RegistryError> {
        let url = format!("{}/internal/sessions/{}/finish", self.config.base_url, uid);
        let resp = self.http.post(url).send().await.map_err(|e| {
            tracing::warn!(%uid, error = %e, "finish request failed");
            RegistryError::FinishFailed(e.to_string())
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            tracing::warn!(%uid, %status, "registry rejected finish call");
            return Err(RegistryError::FinishFailed(format!(
                "registry returned {status}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> RegistryConfig {
        RegistryConfig {
            base_url,
            ingress_hostname: "ws".to_string(),
        }
    }

    #[tokio::test]
    async fn lookup_resolves_domain_name_to_uid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/lookup"))
            .and(query_param("domain", "acme"))
            .and(query_param("name", "webserver"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uid": "uid-A"
            })))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(config(server.uri()));
        let record = client.lookup("acme", "webserver").await.unwrap();
        assert_eq!(record.uid, "uid-A");
    }

    #[tokio::test]
    async fn lookup_unknown_device_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/lookup"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(config(server.uri()));
        let err = client.lookup("acme", "nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::LookupNotFound));
    }

    #[tokio::test]
    async fn register_posts_session_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/public/sessions"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(config(server.uri()));
        let session = Session::new("sess-1", "alice", "uid-A");
        client.register(&session).await.unwrap();
    }

    #[tokio::test]
    async fn register_error_response_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/public/sessions"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(config(server.uri()));
        let session = Session::new("sess-1", "alice", "uid-A");
        let err = client.register(&session).await.unwrap_err();
        assert!(matches!(err, RegistryError::RegisterFailed(_)));
    }

    #[tokio::test]
    async fn finish_posts_to_uid_scoped_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/sessions/sess-1/finish"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(config(server.uri()));
        client.finish("sess-1").await.unwrap();
    }
}
