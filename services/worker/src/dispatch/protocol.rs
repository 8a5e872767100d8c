//! Agent worker protocol messages.
//!
//! The dispatch server speaks protobuf over binary WebSocket frames. These
//! helpers build the worker's side of the conversation.

use super::DispatchError;
use livekit_protocol::{
    AvailabilityResponse, JobStatus, JobType, RegisterWorkerRequest, ServerMessage,
    UpdateJobStatus, UpdateWorkerStatus, WorkerMessage, WorkerPing, WorkerStatus, worker_message,
};
use prost::Message as _;

/// Turns the LiveKit server URL into the worker endpoint URL.
pub fn agent_ws_url(livekit_url: &str) -> Result<String, DispatchError> {
    let trimmed = livekit_url.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| DispatchError::InvalidUrl(livekit_url.to_string()))?;
    let scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(DispatchError::InvalidUrl(livekit_url.to_string())),
    };
    if rest.is_empty() {
        return Err(DispatchError::InvalidUrl(livekit_url.to_string()));
    }
    Ok(format!("{}://{}/agent", scheme, rest))
}

pub fn participant_identity(job_id: &str) -> String {
    format!("agent-{}", job_id)
}

fn wrap(message: worker_message::Message) -> WorkerMessage {
    WorkerMessage {
        message: Some(message),
    }
}

pub fn register(agent_name: &str, version: &str) -> WorkerMessage {
    wrap(worker_message::Message::Register(RegisterWorkerRequest {
        r#type: JobType::JtRoom as i32,
        agent_name: agent_name.to_string(),
        version: version.to_string(),
        ..Default::default()
    }))
}

pub fn availability(job_id: &str, available: bool, agent_name: &str) -> WorkerMessage {
    let (participant_identity, participant_name) = if available {
        (participant_identity(job_id), agent_name.to_string())
    } else {
        (String::new(), String::new())
    };
    wrap(worker_message::Message::Availability(AvailabilityResponse {
        job_id: job_id.to_string(),
        available,
        participant_identity,
        participant_name,
        ..Default::default()
    }))
}

pub fn job_status(job_id: &str, status: JobStatus, error: Option<String>) -> WorkerMessage {
    wrap(worker_message::Message::UpdateJob(UpdateJobStatus {
        job_id: job_id.to_string(),
        status: status as i32,
        error: error.unwrap_or_default(),
    }))
}

pub fn worker_status(busy: bool) -> WorkerMessage {
    let (status, load, job_count) = if busy {
        (WorkerStatus::WsFull, 1.0, 1)
    } else {
        (WorkerStatus::WsAvailable, 0.0, 0)
    };
    wrap(worker_message::Message::UpdateWorker(UpdateWorkerStatus {
        status: Some(status as i32),
        load,
        job_count,
        ..Default::default()
    }))
}

pub fn ping(timestamp_ms: i64) -> WorkerMessage {
    wrap(worker_message::Message::Ping(WorkerPing {
        timestamp: timestamp_ms,
    }))
}

pub fn encode(message: &WorkerMessage) -> Vec<u8> {
    message.encode_to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<ServerMessage, DispatchError> {
    Ok(ServerMessage::decode(bytes)?)
}
