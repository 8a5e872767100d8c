//! The worker's view of a joined room.

#[cfg(feature = "rtc")]
pub mod rtc;

use crate::pipeline::AudioIo;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Failed to connect to room: {0}")]
    Connect(String),
    #[error("Failed to publish audio track: {0}")]
    PublishTrack(String),
    #[error("Failed to publish data: {0}")]
    PublishData(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomHandle: Send + Sync {
    fn name(&self) -> String;

    /// Sends `payload` to every participant over the data channel.
    async fn publish_data(&self, payload: Vec<u8>, reliable: bool) -> Result<(), RoomError>;

    /// Leaves the room. Safe to call after the room already disconnected.
    async fn close(&self);
}

/// Opens room connections from a URL and a join token.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<RoomLink, RoomError>;
}

/// Everything the lifecycle shim needs from a connected room.
pub struct RoomLink {
    pub room: Arc<dyn RoomHandle>,
    /// Room metadata as it was at connect time.
    pub metadata: String,
    pub audio: AudioIo,
    /// Flips to `true` once the room is gone.
    pub disconnected: watch::Receiver<bool>,
}

/// Decides which subscribed audio track is the caller.
///
/// The first track wins. Tracks subscribed meanwhile wait in order and the
/// oldest one takes over when the caller's track ends.
#[cfg_attr(not(feature = "rtc"), allow(dead_code))]
#[derive(Debug)]
pub(crate) struct CallerTracks<K, T> {
    active: Option<K>,
    pending: VecDeque<(K, T)>,
}

#[cfg_attr(not(feature = "rtc"), allow(dead_code))]
impl<K: PartialEq + Clone, T> CallerTracks<K, T> {
    pub fn new() -> Self {
        Self {
            active: None,
            pending: VecDeque::new(),
        }
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.active.as_ref() == Some(key)
    }

    /// Returns the track back if it should be listened to now.
    pub fn subscribed(&mut self, key: K, track: T) -> Option<T> {
        if self.active.is_some() {
            self.pending.push_back((key, track));
            return None;
        }
        self.active = Some(key);
        Some(track)
    }

    /// Forgets `key`. If it was the caller, returns the track that takes over.
    pub fn ended(&mut self, key: &K) -> Option<T> {
        if !self.is_active(key) {
            self.pending.retain(|(pending, _)| pending != key);
            return None;
        }
        self.active = None;
        let (next, track) = self.pending.pop_front()?;
        self.active = Some(next);
        Some(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_track_is_the_caller() {
        let mut tracks = CallerTracks::new();
        assert_eq!(tracks.subscribed("TR_a", 1), Some(1));
        assert_eq!(tracks.subscribed("TR_b", 2), None);
        assert!(tracks.is_active(&"TR_a"));
    }

    #[test]
    fn test_next_subscribed_track_takes_over() {
        let mut tracks = CallerTracks::new();
        tracks.subscribed("TR_a", 1);
        tracks.subscribed("TR_b", 2);
        tracks.subscribed("TR_c", 3);

        assert_eq!(tracks.ended(&"TR_a"), Some(2));
        assert!(tracks.is_active(&"TR_b"));
        assert_eq!(tracks.ended(&"TR_b"), Some(3));
        assert_eq!(tracks.ended(&"TR_c"), None);

        // Nothing live: the next track is listened to right away.
        assert_eq!(tracks.subscribed("TR_d", 4), Some(4));
    }

    #[test]
    fn test_pending_track_that_ends_is_skipped() {
        let mut tracks = CallerTracks::new();
        tracks.subscribed("TR_a", 1);
        tracks.subscribed("TR_b", 2);
        tracks.subscribed("TR_c", 3);

        assert_eq!(tracks.ended(&"TR_b"), None);
        assert!(tracks.is_active(&"TR_a"));
        assert_eq!(tracks.ended(&"TR_a"), Some(3));
        // A repeated end for a track that already handed over is ignored.
        assert_eq!(tracks.ended(&"TR_a"), None);
        assert!(tracks.is_active(&"TR_c"));
    }
}
