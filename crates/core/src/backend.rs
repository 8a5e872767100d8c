//! Backend API Client
//!
//! The worker talks to the platform backend twice per session: once to load
//! the agent configuration on join, once to mark the session ended. Both
//! calls authenticate with the shared worker secret.

use crate::agent_config::AgentConfig;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::{debug, info};

pub const WORKER_SECRET_HEADER: &str = "X-Worker-Secret";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Invalid backend URL '{0}'")]
    InvalidUrl(String),
    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Backend returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("Malformed backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The two backend operations a session needs.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Loads the configuration for `agent_id`. Any non-success status or an
    /// undecodable body is an error.
    async fn fetch_agent_config(&self, agent_id: &str) -> Result<AgentConfig, BackendError>;

    /// Tells the backend that `session_id` is over.
    async fn end_session(&self, session_id: &str) -> Result<(), BackendError>;
}

/// `BackendClient` over HTTP.
pub struct HttpBackendClient {
    client: reqwest::Client,
    base_url: Url,
    worker_secret: String,
}

impl HttpBackendClient {
    /// Creates a client for the backend at `base_url`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root of the backend, e.g. `http://localhost:4003`.
    /// * `worker_secret` - Sent as `X-Worker-Secret` on every request.
    /// * `timeout` - Overall per-request timeout.
    pub fn new(
        base_url: &str,
        worker_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url =
            Url::parse(base_url).map_err(|_| BackendError::InvalidUrl(base_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            worker_secret: worker_secret.into(),
        })
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn config_url(&self, agent_id: &str) -> Url {
        self.endpoint(&["internal", "agents", agent_id, "config"])
    }

    pub fn end_session_url(&self, session_id: &str) -> Url {
        self.endpoint(&["api", "sessions", session_id, "end"])
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn fetch_agent_config(&self, agent_id: &str) -> Result<AgentConfig, BackendError> {
        let url = self.config_url(agent_id);
        debug!(%url, "Fetching agent config");

        let response = self
            .client
            .get(url.clone())
            .header(WORKER_SECRET_HEADER, &self.worker_secret)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status,
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn end_session(&self, session_id: &str) -> Result<(), BackendError> {
        let url = self.end_session_url(session_id);

        let response = self
            .client
            .post(url.clone())
            .header(WORKER_SECRET_HEADER, &self.worker_secret)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status,
                url: url.to_string(),
            });
        }

        info!(session_id, "Session marked as ended in backend.");
        Ok(())
    }
}
