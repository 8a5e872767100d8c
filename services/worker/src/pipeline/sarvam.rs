//! Sarvam speech APIs: `saarika` for STT, `bulbul` for TTS.

use super::{AudioFrame, PipelineError, SpeechToText, TextToSpeech};
use crate::audio_utils::{self, TTS_OUTPUT_SAMPLE_RATE};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const STT_MODEL: &str = "saarika:v2.5";
pub const TTS_MODEL: &str = "bulbul:v2";
const API_KEY_HEADER: &str = "api-subscription-key";
/// Longest text `bulbul:v2` accepts in one request.
pub const MAX_TTS_CHARS: usize = 1500;

#[derive(Deserialize)]
struct SttResponse {
    transcript: String,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    target_language_code: &'a str,
    speaker: &'a str,
    model: &'a str,
    speech_sample_rate: u32,
}

#[derive(Deserialize)]
struct TtsResponse {
    audios: Vec<String>,
}

async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::Provider {
        service,
        status,
        body,
    })
}

pub struct SarvamStt {
    http: reqwest::Client,
    url: String,
    api_key: String,
    language_code: String,
}

impl SarvamStt {
    pub fn new(http: reqwest::Client, api_base: &str, api_key: &str, language_code: &str) -> Self {
        Self {
            http,
            url: format!("{}/speech-to-text", api_base.trim_end_matches('/')),
            api_key: api_key.to_string(),
            language_code: language_code.to_string(),
        }
    }
}

#[async_trait]
impl SpeechToText for SarvamStt {
    async fn transcribe(&self, pcm16: Vec<i16>, sample_rate: u32) -> Result<String, PipelineError> {
        const SERVICE: &str = "sarvam-stt";
        let request_err = |source| PipelineError::Request {
            service: SERVICE,
            source,
        };

        let wav = audio_utils::encode_wav(&pcm16, sample_rate);
        let file = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(request_err)?;
        let form = Form::new()
            .part("file", file)
            .text("model", STT_MODEL)
            .text("language_code", self.language_code.clone());

        let response = self
            .http
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(request_err)?;
        let response = check_status(SERVICE, response).await?;
        let body: SttResponse = response.json().await.map_err(request_err)?;

        debug!(chars = body.transcript.len(), "Utterance transcribed");
        Ok(body.transcript.trim().to_string())
    }
}

pub struct SarvamTts {
    http: reqwest::Client,
    url: String,
    api_key: String,
    language_code: String,
    speaker: String,
}

impl SarvamTts {
    pub fn new(
        http: reqwest::Client,
        api_base: &str,
        api_key: &str,
        language_code: &str,
        speaker: &str,
    ) -> Self {
        Self {
            http,
            url: format!("{}/text-to-speech", api_base.trim_end_matches('/')),
            api_key: api_key.to_string(),
            language_code: language_code.to_string(),
            speaker: speaker.to_string(),
        }
    }

    async fn synthesize_chunk(&self, text: &str) -> Result<Vec<i16>, PipelineError> {
        const SERVICE: &str = "sarvam-tts";
        let request_err = |source| PipelineError::Request {
            service: SERVICE,
            source,
        };

        let response = self
            .http
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&TtsRequest {
                text,
                target_language_code: &self.language_code,
                speaker: &self.speaker,
                model: TTS_MODEL,
                speech_sample_rate: TTS_OUTPUT_SAMPLE_RATE,
            })
            .send()
            .await
            .map_err(request_err)?;
        let response = check_status(SERVICE, response).await?;
        let body: TtsResponse = response.json().await.map_err(request_err)?;

        let mut samples = Vec::new();
        for encoded in &body.audios {
            let decoded = audio_utils::decode_base64_wav(encoded)
                .map_err(|e| PipelineError::Audio(e.to_string()))?;
            let resampled =
                audio_utils::resample(&decoded.samples, decoded.sample_rate, TTS_OUTPUT_SAMPLE_RATE)
                    .map_err(|e| PipelineError::Audio(e.to_string()))?;
            samples.extend(resampled);
        }
        Ok(samples)
    }
}

#[async_trait]
impl TextToSpeech for SarvamTts {
    async fn synthesize(&self, text: &str) -> Result<AudioFrame, PipelineError> {
        let mut samples = Vec::new();
        for chunk in split_for_tts(text, MAX_TTS_CHARS) {
            samples.extend(self.synthesize_chunk(&chunk).await?);
        }
        Ok(AudioFrame {
            samples,
            sample_rate: TTS_OUTPUT_SAMPLE_RATE,
        })
    }
}

/// Splits text into pieces of at most `max_chars` characters, preferring
/// sentence ends, then whitespace, as break points.
pub fn split_for_tts(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while rest.chars().count() > max_chars {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];

        let split_at = window
            .rfind(['.', '!', '?', '।', '\n'])
            .map(|i| i + window[i..].chars().next().map_or(1, char::len_utf8))
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        let (head, tail) = rest.split_at(split_at);
        let head = head.trim();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start();
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
