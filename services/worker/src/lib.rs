//! Voice Agent Worker Library Crate
//!
//! Everything the `worker` binary runs: environment configuration, the agent
//! dispatch client, the LiveKit room binding, the session lifecycle shim and
//! the cascaded voice pipeline behind the agent session. The binary is a thin
//! wrapper that wires these together.

pub mod audio_utils;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod pipeline;
pub mod room;
pub mod shim;

#[cfg(test)]
pub(crate) mod test_support;

use tokio::sync::watch;

/// Resolves once the flag is `true`. Never resolves if the sender is gone first.
pub(crate) async fn raised(flag: &mut watch::Receiver<bool>) {
    let fired = flag.wait_for(|raised| *raised).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}
