//! Session lifecycle shim.
//!
//! Glue between a joined room, the agent session and the backend. One shim
//! run serves one call and walks `Joining -> Active -> Ended`:
//!
//! 1. Resolve `agentId`/`sessionId` from the room (or job) metadata.
//! 2. Fetch the agent configuration once. Any failure ends the call here.
//! 3. Start the agent session on the room audio and greet the caller.
//! 4. Relay every transcript fragment to the room data channel, in order.
//! 5. When the room, the job or the session goes away, tell the backend the
//!    session ended.

use crate::pipeline::{AgentSessionFactory, AgentSessionHandle, PipelineError};
use crate::raised;
use crate::room::{RoomHandle, RoomLink};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Span, error, info, warn};
use voice_worker_core::{
    backend::{BackendClient, BackendError},
    metadata::{MetadataError, RoomMetadata},
    session::{SessionContext, SessionState, TransitionError},
    transcript::TranscriptFragment,
};

#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("Failed to fetch agent config: {0}")]
    ConfigFetch(#[source] BackendError),
    #[error("Failed to start agent session: {0}")]
    SessionStart(#[source] PipelineError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Why an active session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    RoomDisconnected,
    JobTerminated,
    SessionEnded,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::RoomDisconnected => write!(f, "room disconnected"),
            EndReason::JobTerminated => write!(f, "job terminated"),
            EndReason::SessionEnded => write!(f, "agent session ended"),
        }
    }
}

pub struct SessionShim {
    backend: Arc<dyn BackendClient>,
    sessions: Arc<dyn AgentSessionFactory>,
}

impl SessionShim {
    pub fn new(backend: Arc<dyn BackendClient>, sessions: Arc<dyn AgentSessionFactory>) -> Self {
        Self { backend, sessions }
    }

    /// Serves one call on `link` until it ends.
    ///
    /// `job_metadata` is used when the room carries no metadata of its own.
    /// The resolved ids are recorded on the caller's span as `agent_id` and
    /// `session_id` when it declares those fields.
    /// Flipping `stop` to `true` ends the session as a job termination.
    pub async fn run(
        &self,
        link: RoomLink,
        job_metadata: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<EndReason, ShimError> {
        let RoomLink {
            room,
            metadata,
            audio,
            mut disconnected,
        } = link;
        let mut state = SessionState::Joining;
        info!(room = %room.name(), %state, "Joining session");

        let joined = async {
            let metadata = RoomMetadata::resolve(&metadata, job_metadata)?;
            let span = Span::current();
            span.record("agent_id", metadata.agent_id.as_str());
            span.record("session_id", metadata.session_id.as_str());
            let context = self.on_join(metadata).await?;
            let handle = self
                .sessions
                .start(&context.config, audio)
                .await
                .map_err(ShimError::SessionStart)?;
            Ok::<_, ShimError>((context, handle))
        }
        .await;

        let (context, mut handle) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                state = state.transition(SessionState::Ended)?;
                error!(error = %e, %state, "Join failed");
                room.close().await;
                return Err(e);
            }
        };

        state = state.transition(SessionState::Active)?;
        info!(
            agent_id = %context.agent_id,
            session_id = %context.session_id,
            %state,
            "Agent session started"
        );

        if let Err(e) = handle
            .generate_reply(context.config.welcome_message.clone())
            .await
        {
            warn!(error = %e, "Could not send the welcome message");
        }

        let reason = self
            .relay(room.as_ref(), &mut handle, &mut disconnected, &mut stop)
            .await;

        state = state.transition(SessionState::Ended)?;
        info!(%reason, %state, session_id = %context.session_id, "Session ending");
        handle.shutdown();
        self.on_disconnect(&context).await;
        room.close().await;
        Ok(reason)
    }

    /// Fetches the agent configuration for a freshly joined room.
    pub async fn on_join(&self, metadata: RoomMetadata) -> Result<SessionContext, ShimError> {
        let config = self
            .backend
            .fetch_agent_config(&metadata.agent_id)
            .await
            .map_err(ShimError::ConfigFetch)?;
        info!(agent_id = %metadata.agent_id, name = %config.name, "Loaded agent config");
        Ok(SessionContext::new(metadata, config))
    }

    /// Publishes one fragment to the room. Failures are logged, not returned.
    pub async fn on_transcript(&self, room: &dyn RoomHandle, fragment: &TranscriptFragment) {
        let payload = match fragment.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode transcript");
                return;
            }
        };
        if let Err(e) = room.publish_data(payload, true).await {
            warn!(error = %e, role = %fragment.role, "Failed to publish transcript");
        }
    }

    /// Reports the end of the session. Best effort: errors are only logged.
    pub async fn on_disconnect(&self, context: &SessionContext) {
        if let Err(e) = self.backend.end_session(&context.session_id).await {
            warn!(error = %e, session_id = %context.session_id, "Failed to notify backend of session end");
        }
    }

    async fn relay(
        &self,
        room: &dyn RoomHandle,
        handle: &mut AgentSessionHandle,
        disconnected: &mut watch::Receiver<bool>,
        stop: &mut watch::Receiver<bool>,
    ) -> EndReason {
        loop {
            tokio::select! {
                biased;
                fragment = handle.transcripts.recv() => match fragment {
                    Some(fragment) => self.on_transcript(room, &fragment).await,
                    None => return EndReason::SessionEnded,
                },
                _ = raised(disconnected) => return EndReason::RoomDisconnected,
                _ = raised(stop) => {
                    // The room is still up: deliver what the session already said.
                    while let Ok(fragment) = handle.transcripts.try_recv() {
                        self.on_transcript(room, &fragment).await;
                    }
                    return EndReason::JobTerminated;
                }
            }
        }
    }
}
