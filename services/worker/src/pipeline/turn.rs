//! Energy-based voice activity and end-of-turn detection.

use crate::audio_utils::{STT_INPUT_SAMPLE_RATE, rms_energy};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Normalized RMS energy above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Audio kept from before speech onset so the first syllable is not clipped.
    pub prefix_padding: Duration,
    /// Trailing silence that closes a turn.
    pub silence_duration: Duration,
    /// Turns with less voiced audio than this are discarded as noise.
    pub min_speech: Duration,
    /// Turns are force-closed at this length.
    pub max_utterance: Duration,
    pub sample_rate: u32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            prefix_padding: Duration::from_millis(200),
            silence_duration: Duration::from_millis(700),
            min_speech: Duration::from_millis(250),
            max_utterance: Duration::from_secs(30),
            sample_rate: STT_INPUT_SAMPLE_RATE,
        }
    }
}

impl TurnConfig {
    fn samples(&self, duration: Duration) -> usize {
        (duration.as_millis() as u64 * self.sample_rate as u64 / 1000) as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The user started talking.
    SpeechStarted,
    /// A complete user turn, including prefix padding.
    Utterance(Vec<i16>),
}

/// Splits a continuous stream of frames into user turns.
pub struct TurnDetector {
    config: TurnConfig,
    prefix_samples: usize,
    silence_samples: usize,
    min_speech_samples: usize,
    max_samples: usize,
    prefix: VecDeque<i16>,
    speech: Vec<i16>,
    in_speech: bool,
    voiced: usize,
    trailing_silence: usize,
}

impl TurnDetector {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            prefix_samples: config.samples(config.prefix_padding),
            silence_samples: config.samples(config.silence_duration),
            min_speech_samples: config.samples(config.min_speech),
            max_samples: config.samples(config.max_utterance),
            config,
            prefix: VecDeque::new(),
            speech: Vec::new(),
            in_speech: false,
            voiced: 0,
            trailing_silence: 0,
        }
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Feeds one frame and reports a turn boundary if this frame produced one.
    pub fn push(&mut self, frame: &[i16]) -> Option<TurnEvent> {
        let is_voiced = rms_energy(frame) > self.config.energy_threshold;

        if !self.in_speech {
            if is_voiced {
                self.in_speech = true;
                self.speech.clear();
                self.speech.extend(self.prefix.drain(..));
                self.speech.extend_from_slice(frame);
                self.voiced = frame.len();
                self.trailing_silence = 0;
                return Some(TurnEvent::SpeechStarted);
            }
            self.prefix.extend(frame.iter().copied());
            while self.prefix.len() > self.prefix_samples {
                self.prefix.pop_front();
            }
            return None;
        }

        self.speech.extend_from_slice(frame);
        if is_voiced {
            self.voiced += frame.len();
            self.trailing_silence = 0;
        } else {
            self.trailing_silence += frame.len();
        }

        if self.trailing_silence >= self.silence_samples || self.speech.len() >= self.max_samples {
            return self.finish();
        }
        None
    }

    fn finish(&mut self) -> Option<TurnEvent> {
        self.in_speech = false;
        self.trailing_silence = 0;
        let utterance = std::mem::take(&mut self.speech);
        let voiced = std::mem::replace(&mut self.voiced, 0);

        if voiced < self.min_speech_samples {
            tracing::debug!(voiced_samples = voiced, "Discarding short noise burst");
            return None;
        }
        Some(TurnEvent::Utterance(utterance))
    }
}
