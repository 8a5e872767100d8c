//! Runs an assigned dispatch job: connect to its room, then hand over to the shim.

use crate::dispatch::JobRunner;
use crate::room::RoomConnector;
use crate::shim::SessionShim;
use anyhow::{Context, Result};
use async_trait::async_trait;
use livekit_protocol::JobAssignment;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct ShimJobRunner {
    shim: SessionShim,
    connector: Arc<dyn RoomConnector>,
    /// Used when the assignment carries no room URL.
    livekit_url: String,
}

impl ShimJobRunner {
    pub fn new(
        shim: SessionShim,
        connector: Arc<dyn RoomConnector>,
        livekit_url: impl Into<String>,
    ) -> Self {
        Self {
            shim,
            connector,
            livekit_url: livekit_url.into(),
        }
    }
}

#[async_trait]
impl JobRunner for ShimJobRunner {
    async fn run_job(&self, assignment: JobAssignment, stop: watch::Receiver<bool>) -> Result<()> {
        let job = assignment
            .job
            .context("Job assignment did not include a job")?;
        let url = assignment
            .url
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.livekit_url.clone());

        let link = self
            .connector
            .connect(&url, &assignment.token)
            .await
            .context("Failed to join the assigned room")?;

        let reason = self.shim.run(link, &job.metadata, stop).await?;
        info!(%reason, "Session closed");
        Ok(())
    }
}
