//! Mocks shared by unit tests across modules.

use async_trait::async_trait;
use voice_worker_core::{
    agent_config::AgentConfig,
    backend::{BackendClient, BackendError},
};

mockall::mock! {
    pub Backend {}
    #[async_trait]
    impl BackendClient for Backend {
        async fn fetch_agent_config(&self, agent_id: &str) -> Result<AgentConfig, BackendError>;
        async fn end_session(&self, session_id: &str) -> Result<(), BackendError>;
    }
}
