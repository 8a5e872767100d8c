//! Access token a worker presents when registering with the dispatch server.

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentGrant {
    pub agent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerClaims {
    pub iss: String,
    pub nbf: u64,
    pub exp: u64,
    pub video: AgentGrant,
}

/// Signs an HS256 token granting the `agent` permission, valid for `ttl`.
pub fn worker_token(
    api_key: &str,
    api_secret: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = WorkerClaims {
        iss: api_key.to_string(),
        nbf: now,
        exp: now + ttl.as_secs(),
        video: AgentGrant { agent: true },
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(api_secret.as_bytes()),
    )
}
