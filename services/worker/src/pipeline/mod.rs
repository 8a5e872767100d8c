//! The conversational agent session attached to a room.
//!
//! A cascaded voice pipeline: room audio is cut into user turns by an
//! energy-based turn detector, transcribed, answered by the LLM and spoken
//! back through TTS. Every finished user and agent utterance is reported as
//! a transcript fragment, in the order it happened.
//!
//! - `turn`: voice activity and end-of-turn detection.
//! - `sarvam`: speech-to-text and text-to-speech over the Sarvam REST API.
//! - `agent`: the session loop tying detector, STT, LLM and TTS together.

pub mod agent;
pub mod sarvam;
pub mod turn;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use voice_worker_core::{
    agent_config::AgentConfig,
    llm_client::{LLMClient, OpenAICompatibleClient},
};

pub use agent::{AgentSessionHandle, VoiceAgentSession};
pub use turn::{TurnConfig, TurnDetector, TurnEvent};

/// A chunk of mono PCM16 audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// The audio plumbing between a room and an agent session.
pub struct AudioIo {
    /// Frames heard in the room, at `STT_INPUT_SAMPLE_RATE`.
    pub input: mpsc::Receiver<AudioFrame>,
    /// Where the agent speaks, at `TTS_OUTPUT_SAMPLE_RATE`.
    pub output: AudioOutput,
}

/// Session side of the agent's playback path.
pub struct AudioOutput {
    pub frames: mpsc::Sender<AudioFrame>,
    /// Bumped to drop everything queued for playback.
    pub clear: watch::Sender<u64>,
}

/// What the room should do next with the agent's audio.
#[derive(Debug, PartialEq)]
pub enum Playback {
    Frame(AudioFrame),
    /// Queued audio was dropped; flush anything buffered further down.
    Cleared,
}

/// Room side of the agent's playback path.
pub struct Playout {
    frames: mpsc::Receiver<AudioFrame>,
    clear: watch::Receiver<u64>,
    clear_open: bool,
}

impl Playout {
    /// Next frame to play, or `Cleared` once the session interrupted
    /// playback. `None` when the session is gone.
    pub async fn next(&mut self) -> Option<Playback> {
        loop {
            tokio::select! {
                biased;
                changed = self.clear.changed(), if self.clear_open => {
                    if changed.is_err() {
                        self.clear_open = false;
                        continue;
                    }
                    while self.frames.try_recv().is_ok() {}
                    return Some(Playback::Cleared);
                }
                frame = self.frames.recv() => return frame.map(Playback::Frame),
            }
        }
    }
}

/// A playback path holding up to `capacity` frames.
pub fn audio_output(capacity: usize) -> (AudioOutput, Playout) {
    let (frames_tx, frames_rx) = mpsc::channel(capacity);
    let (clear_tx, clear_rx) = watch::channel(0);
    (
        AudioOutput {
            frames: frames_tx,
            clear: clear_tx,
        },
        Playout {
            frames: frames_rx,
            clear: clear_rx,
            clear_open: true,
        },
    )
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{service} request failed: {source}")]
    Request {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned {status}: {body}")]
    Provider {
        service: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("LLM error: {0}")]
    Llm(String),
    #[error("Audio processing failed: {0}")]
    Audio(String),
    #[error("Agent session is closed")]
    Closed,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribes one complete user utterance.
    async fn transcribe(&self, pcm16: Vec<i16>, sample_rate: u32) -> Result<String, PipelineError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesizes `text`, returning audio at `TTS_OUTPUT_SAMPLE_RATE`.
    async fn synthesize(&self, text: &str) -> Result<AudioFrame, PipelineError>;
}

/// Starts agent sessions for a given agent configuration.
#[async_trait]
pub trait AgentSessionFactory: Send + Sync {
    async fn start(
        &self,
        config: &AgentConfig,
        audio: AudioIo,
    ) -> Result<AgentSessionHandle, PipelineError>;
}

/// Builds sessions out of Sarvam STT/TTS and an OpenAI-compatible LLM.
pub struct VoicePipelineFactory {
    http: reqwest::Client,
    llm_api_base: String,
    sarvam_api_base: String,
    turn_config: TurnConfig,
}

impl VoicePipelineFactory {
    pub fn new(
        http: reqwest::Client,
        llm_api_base: impl Into<String>,
        sarvam_api_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            llm_api_base: llm_api_base.into(),
            sarvam_api_base: sarvam_api_base.into(),
            turn_config: TurnConfig::default(),
        }
    }
}

#[async_trait]
impl AgentSessionFactory for VoicePipelineFactory {
    async fn start(
        &self,
        config: &AgentConfig,
        audio: AudioIo,
    ) -> Result<AgentSessionHandle, PipelineError> {
        let stt = sarvam::SarvamStt::new(
            self.http.clone(),
            &self.sarvam_api_base,
            &config.sarvam_api_key,
            &config.stt_language_code,
        );
        let tts = sarvam::SarvamTts::new(
            self.http.clone(),
            &self.sarvam_api_base,
            &config.sarvam_api_key,
            &config.tts_language_code,
            config.resolved_speaker(),
        );
        let llm: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::with_key(
            &self.llm_api_base,
            &config.llm_api_key,
            config.llm_model.clone(),
        ));

        let session = VoiceAgentSession::new(
            Arc::new(stt),
            Arc::new(tts),
            llm,
            config.system_prompt.clone(),
            self.turn_config.clone(),
        );
        Ok(session.start(audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: i16) -> AudioFrame {
        AudioFrame {
            samples: vec![value; 480],
            sample_rate: 24000,
        }
    }

    #[tokio::test]
    async fn test_clear_drops_queued_frames() {
        let (output, mut playout) = audio_output(8);
        output.frames.send(frame(1)).await.unwrap();
        assert_eq!(playout.next().await, Some(Playback::Frame(frame(1))));

        for value in 2..6 {
            output.frames.send(frame(value)).await.unwrap();
        }
        output.clear.send_modify(|generation| *generation += 1);
        assert_eq!(playout.next().await, Some(Playback::Cleared));

        output.frames.send(frame(9)).await.unwrap();
        assert_eq!(playout.next().await, Some(Playback::Frame(frame(9))));
    }

    #[tokio::test]
    async fn test_playout_ends_with_the_session() {
        let (output, mut playout) = audio_output(8);
        output.frames.send(frame(1)).await.unwrap();
        drop(output);

        assert_eq!(playout.next().await, Some(Playback::Frame(frame(1))));
        assert_eq!(playout.next().await, None);
    }
}
