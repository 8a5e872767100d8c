//! The running agent session: turn detection, STT, LLM reply, TTS playback.

use super::turn::{TurnDetector, TurnEvent};
use super::{
    AudioFrame, AudioIo, AudioOutput, PipelineError, SpeechToText, TextToSpeech, TurnConfig,
};
use crate::audio_utils::{self, TTS_OUTPUT_SAMPLE_RATE};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, warn};
use voice_worker_core::{
    llm_client::{ChatTurn, LLMClient, collect_reply},
    transcript::TranscriptFragment,
};

/// 20 ms of audio at the output rate.
const PLAYOUT_FRAME_SAMPLES: usize = (TTS_OUTPUT_SAMPLE_RATE / 50) as usize;
const TRANSCRIPT_BUFFER: usize = 32;

#[derive(Debug, PartialEq)]
pub(crate) enum SessionCommand {
    GenerateReply { instructions: String },
}

/// Control surface of a started session.
///
/// Transcript fragments arrive on `transcripts` in the order they happened.
/// The channel closes when the session ends.
pub struct AgentSessionHandle {
    pub transcripts: mpsc::Receiver<TranscriptFragment>,
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

impl AgentSessionHandle {
    /// Asks the agent to speak now, steered by `instructions`.
    pub async fn generate_reply(&self, instructions: impl Into<String>) -> Result<(), PipelineError> {
        self.commands
            .send(SessionCommand::GenerateReply {
                instructions: instructions.into(),
            })
            .await
            .map_err(|_| PipelineError::Closed)
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[cfg(test)]
impl AgentSessionHandle {
    /// A handle fed from `transcripts` whose commands land on the returned receiver.
    pub(crate) fn scripted(
        transcripts: mpsc::Receiver<TranscriptFragment>,
    ) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handle = Self {
            transcripts,
            commands: commands_tx,
            task: tokio::spawn(async {}),
        };
        (handle, commands_rx)
    }
}

#[derive(Clone)]
struct ReplyContext {
    tts: Arc<dyn TextToSpeech>,
    llm: Arc<dyn LLMClient>,
    system_prompt: String,
    history: Arc<Mutex<Vec<ChatTurn>>>,
    transcripts: mpsc::Sender<TranscriptFragment>,
    output: mpsc::Sender<AudioFrame>,
}

pub struct VoiceAgentSession {
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    llm: Arc<dyn LLMClient>,
    system_prompt: String,
    turn_config: TurnConfig,
}

impl VoiceAgentSession {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        llm: Arc<dyn LLMClient>,
        system_prompt: String,
        turn_config: TurnConfig,
    ) -> Self {
        Self {
            stt,
            tts,
            llm,
            system_prompt,
            turn_config,
        }
    }

    /// Spawns the session loop over `audio` and returns its handle.
    pub fn start(self, audio: AudioIo) -> AgentSessionHandle {
        let (transcripts_tx, transcripts_rx) = mpsc::channel(TRANSCRIPT_BUFFER);
        let (commands_tx, commands_rx) = mpsc::channel(8);

        let span = tracing::info_span!("agent_session");
        let task = tokio::spawn(
            async move {
                self.run(audio, commands_rx, transcripts_tx).await;
                info!("Agent session loop finished.");
            }
            .instrument(span),
        );

        AgentSessionHandle {
            transcripts: transcripts_rx,
            commands: commands_tx,
            task,
        }
    }

    async fn run(
        self,
        audio: AudioIo,
        mut commands: mpsc::Receiver<SessionCommand>,
        transcripts: mpsc::Sender<TranscriptFragment>,
    ) {
        let AudioIo { mut input, output } = audio;
        let AudioOutput { frames, clear } = output;
        let sample_rate = self.turn_config.sample_rate;
        let mut detector = TurnDetector::new(self.turn_config.clone());

        let ctx = ReplyContext {
            tts: self.tts.clone(),
            llm: self.llm.clone(),
            system_prompt: self.system_prompt.clone(),
            history: Arc::new(Mutex::new(Vec::new())),
            transcripts: transcripts.clone(),
            output: frames,
        };

        // Utterances are transcribed one at a time so user turns keep their order.
        let (utterance_tx, mut utterance_rx) = mpsc::channel::<Vec<i16>>(8);
        let (text_tx, mut text_rx) = mpsc::channel::<String>(8);
        let stt = self.stt.clone();
        let transcriber = tokio::spawn(
            async move {
                while let Some(utterance) = utterance_rx.recv().await {
                    match stt.transcribe(utterance, sample_rate).await {
                        Ok(text) => {
                            if text_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "Transcription failed"),
                    }
                }
            }
            .in_current_span(),
        );

        let mut reply_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::GenerateReply { instructions }) => {
                        interrupt(&mut reply_task, &clear).await;
                        reply_task = Some(spawn_reply(ctx.clone(), Some(instructions)));
                    }
                    None => {
                        debug!("Session handle dropped");
                        break;
                    }
                },
                frame = input.recv() => {
                    let Some(frame) = frame else {
                        info!("Room audio ended");
                        break;
                    };
                    let samples = if frame.sample_rate == sample_rate {
                        frame.samples
                    } else {
                        match audio_utils::resample(&frame.samples, frame.sample_rate, sample_rate) {
                            Ok(samples) => samples,
                            Err(e) => {
                                warn!(error = %e, "Dropping frame that failed to resample");
                                continue;
                            }
                        }
                    };
                    match detector.push(&samples) {
                        Some(TurnEvent::SpeechStarted) => {
                            if reply_task.as_ref().is_some_and(|task| !task.is_finished()) {
                                info!("User started speaking, interrupting agent");
                            }
                            interrupt(&mut reply_task, &clear).await;
                        }
                        Some(TurnEvent::Utterance(utterance)) => {
                            debug!(samples = utterance.len(), "User turn complete");
                            if utterance_tx.send(utterance).await.is_err() {
                                break;
                            }
                        }
                        None => {}
                    }
                },
                Some(text) = text_rx.recv() => {
                    if text.is_empty() {
                        debug!("Empty transcript, ignoring turn");
                        continue;
                    }
                    info!(chars = text.len(), "User said something");
                    if transcripts.send(TranscriptFragment::user(text.clone())).await.is_err() {
                        break;
                    }
                    ctx.history.lock().await.push(ChatTurn::User(text));
                    interrupt(&mut reply_task, &clear).await;
                    reply_task = Some(spawn_reply(ctx.clone(), None));
                }
            }
        }

        transcriber.abort();
        interrupt(&mut reply_task, &clear).await;
    }
}

/// Stops the current reply and drops the audio it already queued.
async fn interrupt(reply_task: &mut Option<JoinHandle<()>>, clear: &watch::Sender<u64>) {
    if let Some(task) = reply_task.take() {
        task.abort();
        // No frame may land after the clear.
        let _ = task.await;
        clear.send_modify(|generation| *generation += 1);
    }
}

fn spawn_reply(ctx: ReplyContext, instructions: Option<String>) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            if let Err(e) = reply(ctx, instructions).await {
                error!(error = %e, "Agent reply failed");
            }
        }
        .in_current_span(),
    )
}

async fn reply(ctx: ReplyContext, instructions: Option<String>) -> Result<(), PipelineError> {
    let mut conversation = vec![ChatTurn::System(ctx.system_prompt.clone())];
    conversation.extend(ctx.history.lock().await.iter().cloned());
    if let Some(instructions) = instructions {
        conversation.push(ChatTurn::System(instructions));
    }

    let stream = ctx
        .llm
        .stream_reply(conversation)
        .await
        .map_err(|e| PipelineError::Llm(e.to_string()))?;
    let text = collect_reply(stream)
        .await
        .map_err(|e| PipelineError::Llm(e.to_string()))?;
    let text = text.trim().to_string();
    if text.is_empty() {
        warn!("LLM returned an empty reply");
        return Ok(());
    }

    ctx.history.lock().await.push(ChatTurn::Assistant(text.clone()));
    ctx.transcripts
        .send(TranscriptFragment::agent(text.clone()))
        .await
        .map_err(|_| PipelineError::Closed)?;

    let audio = ctx.tts.synthesize(&text).await?;
    for chunk in audio.samples.chunks(PLAYOUT_FRAME_SAMPLES) {
        ctx.output
            .send(AudioFrame {
                samples: chunk.to_vec(),
                sample_rate: audio.sample_rate,
            })
            .await
            .map_err(|_| PipelineError::Closed)?;
    }
    debug!(samples = audio.samples.len(), "Agent reply played out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_utils::STT_INPUT_SAMPLE_RATE;
    use crate::pipeline::{MockSpeechToText, MockTextToSpeech, Playback, Playout, audio_output};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use voice_worker_core::{
        llm_client::{LLMStream, LLMStreamEvent},
        transcript::TranscriptRole,
    };

    mockall::mock! {
        Llm {}
        #[async_trait]
        impl LLMClient for Llm {
            async fn stream_reply(&self, conversation: Vec<ChatTurn>) -> Result<LLMStream>;
        }
    }

    fn text_stream(text: &str) -> LLMStream {
        let events = vec![Ok(LLMStreamEvent::TextChunk(text.to_string()))];
        Box::pin(futures::stream::iter(events))
    }

    fn silent_tts(samples: usize) -> MockTextToSpeech {
        let mut tts = MockTextToSpeech::new();
        tts.expect_synthesize().returning(move |_| {
            Ok(AudioFrame {
                samples: vec![0; samples],
                sample_rate: TTS_OUTPUT_SAMPLE_RATE,
            })
        });
        tts
    }

    struct Harness {
        handle: AgentSessionHandle,
        input: mpsc::Sender<AudioFrame>,
        playout: Playout,
    }

    fn start(stt: MockSpeechToText, tts: MockTextToSpeech, llm: MockLlm) -> Harness {
        let (input_tx, input_rx) = mpsc::channel(1024);
        let (output, playout) = audio_output(1024);
        let session = VoiceAgentSession::new(
            Arc::new(stt),
            Arc::new(tts),
            Arc::new(llm),
            "You are a helpful assistant.".to_string(),
            TurnConfig::default(),
        );
        let handle = session.start(AudioIo {
            input: input_rx,
            output,
        });
        Harness {
            handle,
            input: input_tx,
            playout,
        }
    }

    async fn speak_one_turn(input: &mpsc::Sender<AudioFrame>) {
        let frame = |value: i16| AudioFrame {
            samples: vec![value; 160],
            sample_rate: STT_INPUT_SAMPLE_RATE,
        };
        for _ in 0..50 {
            input.send(frame(8000)).await.unwrap();
        }
        for _ in 0..80 {
            input.send(frame(0)).await.unwrap();
        }
    }

    async fn next_fragment(handle: &mut AgentSessionHandle) -> TranscriptFragment {
        tokio::time::timeout(Duration::from_secs(5), handle.transcripts.recv())
            .await
            .expect("timed out waiting for transcript")
            .expect("transcript channel closed")
    }

    #[tokio::test]
    async fn test_generate_reply_speaks_and_reports_agent_turn() {
        let mut llm = MockLlm::new();
        llm.expect_stream_reply()
            .withf(|conversation| {
                conversation.len() == 2
                    && conversation[0] == ChatTurn::System("You are a helpful assistant.".into())
                    && conversation[1] == ChatTurn::System("Hello! How can I help you?".into())
            })
            .times(1)
            .returning(|_| Ok(text_stream("Hello! How can I help you?")));

        let mut harness = start(MockSpeechToText::new(), silent_tts(1000), llm);
        harness
            .handle
            .generate_reply("Hello! How can I help you?")
            .await
            .unwrap();

        let fragment = next_fragment(&mut harness.handle).await;
        assert_eq!(fragment.role, TranscriptRole::Agent);
        assert_eq!(fragment.text, "Hello! How can I help you?");

        // 1000 samples play out as 480 + 480 + 40.
        let mut played = Vec::new();
        for _ in 0..3 {
            let Some(Playback::Frame(frame)) = harness.playout.next().await else {
                panic!("expected a frame");
            };
            assert_eq!(frame.sample_rate, TTS_OUTPUT_SAMPLE_RATE);
            played.push(frame.samples.len());
        }
        assert_eq!(played, vec![480, 480, 40]);
    }

    #[tokio::test]
    async fn test_user_speech_drops_queued_agent_audio() {
        let mut llm = MockLlm::new();
        llm.expect_stream_reply()
            .times(1)
            .returning(|_| Ok(text_stream("A long answer.")));

        // Two seconds of agent speech, all of it queued at once.
        let mut harness = start(MockSpeechToText::new(), silent_tts(48_000), llm);
        harness.handle.generate_reply("Talk for a while.").await.unwrap();
        next_fragment(&mut harness.handle).await;
        assert!(matches!(
            harness.playout.next().await,
            Some(Playback::Frame(_))
        ));

        harness
            .input
            .send(AudioFrame {
                samples: vec![8000; 160],
                sample_rate: STT_INPUT_SAMPLE_RATE,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(harness.playout.next().await, Some(Playback::Cleared));
        let after = tokio::time::timeout(Duration::from_millis(200), harness.playout.next()).await;
        assert!(after.is_err(), "agent audio kept playing: {:?}", after);
    }

    #[tokio::test]
    async fn test_user_turn_is_transcribed_then_answered_in_order() {
        let mut stt = MockSpeechToText::new();
        stt.expect_transcribe()
            .withf(|pcm16, rate| !pcm16.is_empty() && *rate == STT_INPUT_SAMPLE_RATE)
            .times(1)
            .returning(|_, _| Ok("What time is it?".to_string()));

        let mut llm = MockLlm::new();
        llm.expect_stream_reply()
            .withf(|conversation| {
                conversation.last() == Some(&ChatTurn::User("What time is it?".into()))
            })
            .times(1)
            .returning(|_| Ok(text_stream("It is noon.")));

        let mut harness = start(stt, silent_tts(480), llm);
        speak_one_turn(&harness.input).await;

        let first = next_fragment(&mut harness.handle).await;
        assert_eq!(first, TranscriptFragment::user("What time is it?"));
        let second = next_fragment(&mut harness.handle).await;
        assert_eq!(second, TranscriptFragment::agent("It is noon."));
    }

    #[tokio::test]
    async fn test_failed_transcription_keeps_session_alive() {
        let mut stt = MockSpeechToText::new();
        let mut seq = mockall::Sequence::new();
        stt.expect_transcribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(PipelineError::Audio("stt down".into())));
        stt.expect_transcribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("second try".to_string()));

        let mut llm = MockLlm::new();
        llm.expect_stream_reply()
            .returning(|_| Ok(text_stream("Got it.")));

        let mut harness = start(stt, silent_tts(10), llm);
        speak_one_turn(&harness.input).await;
        speak_one_turn(&harness.input).await;

        let first = next_fragment(&mut harness.handle).await;
        assert_eq!(first, TranscriptFragment::user("second try"));
    }

    #[tokio::test]
    async fn test_session_ends_when_room_audio_closes() {
        let mut harness = start(MockSpeechToText::new(), MockTextToSpeech::new(), MockLlm::new());
        drop(harness.input);

        let closed = tokio::time::timeout(Duration::from_secs(5), harness.handle.transcripts.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert!(matches!(
            harness.handle.generate_reply("anyone there?").await,
            Err(PipelineError::Closed)
        ));
    }
}
