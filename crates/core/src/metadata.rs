//! Room metadata carried by a dispatched room.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Invalid room metadata '{raw}': {source}")]
    Invalid {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("No agentId found in room metadata")]
    MissingAgentId,
    #[error("No sessionId found in room metadata")]
    MissingSessionId,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    agent_id: Option<String>,
    session_id: Option<String>,
}

/// The identifiers a room is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMetadata {
    pub agent_id: String,
    pub session_id: String,
}

impl RoomMetadata {
    /// Parses the metadata JSON object. Both ids must be present and non-empty.
    pub fn parse(raw: &str) -> Result<Self, MetadataError> {
        let parsed: RawMetadata =
            serde_json::from_str(raw).map_err(|source| MetadataError::Invalid {
                raw: raw.to_string(),
                source,
            })?;

        let agent_id = parsed
            .agent_id
            .filter(|id| !id.is_empty())
            .ok_or(MetadataError::MissingAgentId)?;
        let session_id = parsed
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or(MetadataError::MissingSessionId)?;

        Ok(Self {
            agent_id,
            session_id,
        })
    }

    /// Picks the room's own metadata, then the dispatch job's, then `{}`.
    pub fn resolve(room_metadata: &str, job_metadata: &str) -> Result<Self, MetadataError> {
        let raw = [room_metadata, job_metadata]
            .into_iter()
            .find(|m| !m.trim().is_empty())
            .unwrap_or("{}");
        Self::parse(raw)
    }
}
