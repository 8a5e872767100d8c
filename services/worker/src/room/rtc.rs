//! LiveKit room binding over the `livekit` client SDK.

use super::{CallerTracks, RoomConnector, RoomError, RoomHandle, RoomLink};
use crate::audio_utils::{STT_INPUT_SAMPLE_RATE, TTS_OUTPUT_SAMPLE_RATE};
use crate::config::LiveKitSettings;
use crate::pipeline::{AudioFrame, AudioIo, Playback, Playout, audio_output};
use async_trait::async_trait;
use futures_util::StreamExt;
use livekit_api::access_token::{AccessToken, AccessTokenError, VideoGrants};
use livekit::{
    options::TrackPublishOptions,
    prelude::*,
    webrtc::{
        audio_frame::AudioFrame as RtcAudioFrame,
        audio_source::{AudioSourceOptions, RtcAudioSource, native::NativeAudioSource},
        audio_stream::native::NativeAudioStream,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info, warn};

pub const AGENT_TRACK_NAME: &str = "agent-voice";
/// Audio buffered inside the WebRTC source before `capture_frame` waits.
const PLAYOUT_QUEUE_MS: u32 = 200;
const UPLINK_BUFFER: usize = 256;
const DOWNLINK_BUFFER: usize = 32;
const JOIN_TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct LiveKitRoom {
    room: Room,
}

#[async_trait]
impl RoomHandle for LiveKitRoom {
    fn name(&self) -> String {
        self.room.name()
    }

    async fn publish_data(&self, payload: Vec<u8>, reliable: bool) -> Result<(), RoomError> {
        self.room
            .local_participant()
            .publish_data(DataPacket {
                payload,
                reliable,
                ..Default::default()
            })
            .await
            .map_err(|e| RoomError::PublishData(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.room.close().await {
            debug!(error = %e, "Room close returned an error");
        }
    }
}

/// Connects through the LiveKit client SDK.
pub struct LiveKitConnector;

#[async_trait]
impl RoomConnector for LiveKitConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<RoomLink, RoomError> {
        connect(url, token).await
    }
}

/// Joins the room at `url` with `token` and wires its audio to an [`AudioIo`].
pub async fn connect(url: &str, token: &str) -> Result<RoomLink, RoomError> {
    let (room, events) = Room::connect(url, token, RoomOptions::default())
        .await
        .map_err(|e| RoomError::Connect(e.to_string()))?;
    let metadata = room.metadata();
    info!(room = %room.name(), "Connected to room");

    let source = NativeAudioSource::new(
        AudioSourceOptions::default(),
        TTS_OUTPUT_SAMPLE_RATE,
        1,
        PLAYOUT_QUEUE_MS,
    );
    let track = LocalAudioTrack::create_audio_track(
        AGENT_TRACK_NAME,
        RtcAudioSource::Native(source.clone()),
    );
    room.local_participant()
        .publish_track(
            LocalTrack::Audio(track),
            TrackPublishOptions {
                source: TrackSource::Microphone,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| RoomError::PublishTrack(e.to_string()))?;

    let (input_tx, input_rx) = mpsc::channel(UPLINK_BUFFER);
    let (output, playout) = audio_output(DOWNLINK_BUFFER);
    let (disconnected_tx, disconnected_rx) = watch::channel(false);

    tokio::spawn(play_out(source, playout).in_current_span());
    tokio::spawn(pump_events(events, input_tx, disconnected_tx).in_current_span());

    Ok(RoomLink {
        room: Arc::new(LiveKitRoom { room }),
        metadata,
        audio: AudioIo {
            input: input_rx,
            output,
        },
        disconnected: disconnected_rx,
    })
}

async fn play_out(source: NativeAudioSource, mut playout: Playout) {
    while let Some(playback) = playout.next().await {
        match playback {
            Playback::Frame(frame) => {
                let samples_per_channel = frame.samples.len() as u32;
                let rtc_frame = RtcAudioFrame {
                    data: frame.samples.into(),
                    sample_rate: frame.sample_rate,
                    num_channels: 1,
                    samples_per_channel,
                };
                if let Err(e) = source.capture_frame(&rtc_frame).await {
                    warn!(error = %e, "Failed to push agent audio");
                }
            }
            Playback::Cleared => {
                debug!("Agent interrupted, dropping buffered audio");
                source.clear_buffer();
            }
        }
    }
    debug!("Agent audio downlink closed");
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    input: mpsc::Sender<AudioFrame>,
    disconnected: watch::Sender<bool>,
) {
    let mut callers = CallerTracks::new();
    let mut listener: Option<JoinHandle<()>> = None;
    // Listeners report here when their track's stream runs dry.
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<TrackSid>();

    let listen = |track: RemoteAudioTrack| {
        tokio::spawn(forward_audio(track, input.clone(), ended_tx.clone()).in_current_span())
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    RoomEvent::TrackSubscribed {
                        track: RemoteTrack::Audio(track),
                        participant,
                        ..
                    } => match callers.subscribed(track.sid(), track) {
                        Some(track) => {
                            info!(participant = %participant.identity(), "Listening to participant audio");
                            listener = Some(listen(track));
                        }
                        None => {
                            debug!(participant = %participant.identity(), "Already listening, queueing audio track");
                        }
                    },
                    RoomEvent::TrackUnsubscribed { track, .. } => {
                        let sid = track.sid();
                        if callers.is_active(&sid) {
                            if let Some(task) = listener.take() {
                                task.abort();
                            }
                        }
                        if let Some(next) = callers.ended(&sid) {
                            info!("Caller track ended, switching to the next audio track");
                            listener = Some(listen(next));
                        }
                    }
                    RoomEvent::ParticipantDisconnected(participant) => {
                        info!(participant = %participant.identity(), "Participant left");
                    }
                    RoomEvent::Disconnected { reason } => {
                        info!(?reason, "Room disconnected");
                        break;
                    }
                    _ => {}
                }
            }
            Some(sid) = ended_rx.recv() => {
                if let Some(next) = callers.ended(&sid) {
                    info!("Caller audio ended, switching to the next audio track");
                    listener = Some(listen(next));
                }
            }
        }
    }

    if let Some(task) = listener.take() {
        task.abort();
    }
    let _ = disconnected.send(true);
}

async fn forward_audio(
    track: RemoteAudioTrack,
    input: mpsc::Sender<AudioFrame>,
    ended: mpsc::UnboundedSender<TrackSid>,
) {
    let sid = track.sid();
    let mut stream = NativeAudioStream::new(
        track.rtc_track(),
        STT_INPUT_SAMPLE_RATE as i32,
        1,
    );
    while let Some(frame) = stream.next().await {
        let frame = AudioFrame {
            samples: frame.data.to_vec(),
            sample_rate: frame.sample_rate,
        };
        if input.send(frame).await.is_err() {
            return;
        }
    }
    debug!("Participant audio stream ended");
    let _ = ended.send(sid);
}

/// Mints a room join token locally, for joining without dispatch.
pub fn join_token(
    livekit: &LiveKitSettings,
    room: &str,
    identity: &str,
    name: &str,
) -> Result<String, AccessTokenError> {
    AccessToken::with_api_key(&livekit.api_key, &livekit.api_secret)
        .with_identity(identity)
        .with_name(name)
        .with_grants(VideoGrants {
            room_join: true,
            room: room.to_string(),
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
            ..Default::default()
        })
        .with_ttl(JOIN_TOKEN_TTL)
        .to_jwt()
}
