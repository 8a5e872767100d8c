//! Domain types and backend plumbing shared by the voice agent worker.
//!
//! - `agent_config`: the per-agent configuration the backend serves.
//! - `metadata`: the ids a dispatched room carries.
//! - `session`: session context and the `Joining -> Active -> Ended` machine.
//! - `transcript`: transcript fragments and their data-channel payload.
//! - `backend`: the HTTP client for config fetch and end-of-session.
//! - `llm_client`: streaming chat completions against OpenAI-compatible APIs.

pub mod agent_config;
pub mod backend;
pub mod llm_client;
pub mod metadata;
pub mod session;
pub mod transcript;
