//! Agent dispatch: registering with the LiveKit server and serving jobs.
//!
//! The worker keeps one WebSocket to `{LIVEKIT_URL}/agent`. The server offers
//! jobs (`AvailabilityRequest`), assigns accepted ones (`JobAssignment`) and
//! can terminate them (`JobTermination`). This worker runs one job at a time.

pub mod protocol;
pub mod token;

use crate::{config::Config, raised};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use livekit_protocol::{JobAssignment, JobStatus, ServerMessage, WorkerMessage, server_message};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest, http::header::InvalidHeaderValue, protocol::Message as WsMessage,
    },
};
use tracing::{Instrument, debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(10);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_TTL: Duration = Duration::from_secs(600);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid LiveKit URL '{0}'")]
    InvalidUrl(String),
    #[error("Failed to sign worker token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("Invalid authorization header: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Malformed server message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Dispatch server closed the connection")]
    Closed,
    #[error("Worker registration timed out")]
    RegisterTimeout,
    #[error("Giving up after {0} failed connection attempts")]
    RetriesExhausted(u32),
}

/// Runs one assigned job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// `stop` flips to `true` when the server terminates the job or the
    /// worker shuts down.
    async fn run_job(
        &self,
        assignment: JobAssignment,
        stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct WorkerSettings {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub agent_name: String,
    pub version: String,
    pub max_retries: u32,
    pub ping_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Result<Self, DispatchError> {
        Ok(Self {
            ws_url: protocol::agent_ws_url(&config.livekit.url)?,
            api_key: config.livekit.api_key.clone(),
            api_secret: config.livekit.api_secret.clone(),
            agent_name: config.agent_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_retries: config.max_retries,
            ping_interval: PING_INTERVAL,
        })
    }
}

/// Exponential reconnect delay.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct ActiveJob {
    id: String,
    stop: watch::Sender<bool>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveJob>>>;

pub struct Worker {
    settings: WorkerSettings,
    runner: Arc<dyn JobRunner>,
    active: ActiveSlot,
}

impl Worker {
    pub fn new(settings: WorkerSettings, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            settings,
            runner,
            active: Arc::new(Mutex::new(None)),
        }
    }

    fn is_busy(&self) -> bool {
        self.active.lock().map(|slot| slot.is_some()).unwrap_or(true)
    }

    /// Serves jobs until `shutdown` is raised, reconnecting on connection loss.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let (status_tx, mut status_rx) = mpsc::channel::<WorkerMessage>(32);
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        let mut failures = 0u32;

        loop {
            let mut registered = false;
            let result = self
                .serve_connection(&mut shutdown, &status_tx, &mut status_rx, &mut registered)
                .await;

            match result {
                Ok(()) => {
                    self.stop_active_job();
                    info!("Worker stopped.");
                    return Ok(());
                }
                Err(e) => {
                    if registered {
                        failures = 0;
                        backoff.reset();
                    }
                    failures += 1;
                    if failures > self.settings.max_retries {
                        error!(error = %e, failures, "Dispatch connection failed, giving up");
                        self.stop_active_job();
                        return Err(DispatchError::RetriesExhausted(failures));
                    }
                    let delay = backoff.next_delay();
                    warn!(error = %e, failures, ?delay, "Dispatch connection lost, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = raised(&mut shutdown) => {
                            self.stop_active_job();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// One connection lifetime. `Ok` means shutdown was requested.
    async fn serve_connection(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        status_tx: &mpsc::Sender<WorkerMessage>,
        status_rx: &mut mpsc::Receiver<WorkerMessage>,
        registered: &mut bool,
    ) -> Result<(), DispatchError> {
        let token = token::worker_token(&self.settings.api_key, &self.settings.api_secret, TOKEN_TTL)?;
        let mut request = self.settings.ws_url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", token).parse()?);

        let (ws_stream, _) = connect_async(request).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        debug!(url = %self.settings.ws_url, "Connected to dispatch server");

        let register = protocol::register(&self.settings.agent_name, &self.settings.version);
        ws_tx
            .send(WsMessage::Binary(protocol::encode(&register).into()))
            .await?;

        let worker_id = tokio::time::timeout(REGISTER_TIMEOUT, async {
            while let Some(frame) = ws_rx.next().await {
                if let WsMessage::Binary(bytes) = frame? {
                    if let Some(server_message::Message::Register(resp)) =
                        protocol::decode(&bytes)?.message
                    {
                        return Ok(resp.worker_id);
                    }
                }
            }
            Err::<String, DispatchError>(DispatchError::Closed)
        })
        .await
        .map_err(|_| DispatchError::RegisterTimeout)??;

        *registered = true;
        info!(%worker_id, agent_name = %self.settings.agent_name, "Registered with dispatch server");

        let mut ping = tokio::time::interval(self.settings.ping_interval);
        loop {
            tokio::select! {
                _ = raised(shutdown) => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    for message in [protocol::ping(now), protocol::worker_status(self.is_busy())] {
                        ws_tx.send(WsMessage::Binary(protocol::encode(&message).into())).await?;
                    }
                }
                Some(message) = status_rx.recv() => {
                    ws_tx.send(WsMessage::Binary(protocol::encode(&message).into())).await?;
                }
                frame = ws_rx.next() => match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let message = protocol::decode(&bytes)?;
                        if let Some(reply) = self.handle_server_message(message, status_tx) {
                            ws_tx.send(WsMessage::Binary(protocol::encode(&reply).into())).await?;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "Dispatch server sent close");
                        return Err(DispatchError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(DispatchError::Closed),
                },
            }
        }
    }

    /// Reacts to one server message, returning the immediate reply if any.
    fn handle_server_message(
        &self,
        message: ServerMessage,
        status_tx: &mpsc::Sender<WorkerMessage>,
    ) -> Option<WorkerMessage> {
        match message.message? {
            server_message::Message::Availability(request) => {
                let job = request.job?;
                let available = !self.is_busy();
                info!(job_id = %job.id, available, "Job offered");
                Some(protocol::availability(
                    &job.id,
                    available,
                    &self.settings.agent_name,
                ))
            }
            server_message::Message::Assignment(assignment) => {
                self.start_job(assignment, status_tx.clone());
                None
            }
            server_message::Message::Termination(termination) => {
                let guard = self.active.lock().ok()?;
                match guard.as_ref() {
                    Some(job) if job.id == termination.job_id => {
                        info!(job_id = %job.id, "Job terminated by server");
                        let _ = job.stop.send(true);
                    }
                    _ => debug!(job_id = %termination.job_id, "Termination for unknown job"),
                }
                None
            }
            server_message::Message::Pong(_) => None,
            server_message::Message::Register(_) => {
                debug!("Ignoring repeated registration response");
                None
            }
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    fn start_job(&self, assignment: JobAssignment, status_tx: mpsc::Sender<WorkerMessage>) {
        let Some(job) = assignment.job.as_ref() else {
            warn!("Job assignment without a job, ignoring");
            return;
        };
        let job_id = job.id.clone();
        let room_name = job.room.as_ref().map(|r| r.name.clone()).unwrap_or_default();

        let (stop_tx, stop_rx) = watch::channel(false);
        match self.active.lock() {
            Ok(mut slot) => {
                if slot.is_some() {
                    warn!(%job_id, "Already running a job, rejecting assignment");
                    let _ = status_tx.try_send(protocol::job_status(
                        &job_id,
                        JobStatus::JsFailed,
                        Some("worker is busy".to_string()),
                    ));
                    return;
                }
                *slot = Some(ActiveJob {
                    id: job_id.clone(),
                    stop: stop_tx,
                });
            }
            Err(_) => return,
        }

        let runner = self.runner.clone();
        let active = self.active.clone();
        let span = tracing::info_span!(
            "job",
            %job_id,
            room = %room_name,
            agent_id = tracing::field::Empty,
            session_id = tracing::field::Empty,
        );
        tokio::spawn(
            async move {
                info!("Job assigned");
                let _ = status_tx
                    .send(protocol::job_status(&job_id, JobStatus::JsRunning, None))
                    .await;

                let (status, error) = match runner.run_job(assignment, stop_rx).await {
                    Ok(()) => {
                        info!("Job finished");
                        (JobStatus::JsSuccess, None)
                    }
                    Err(e) => {
                        error!(error = ?e, "Job failed");
                        (JobStatus::JsFailed, Some(format!("{:#}", e)))
                    }
                };

                if let Ok(mut slot) = active.lock() {
                    if slot.as_ref().is_some_and(|job| job.id == job_id) {
                        *slot = None;
                    }
                }
                let _ = status_tx
                    .send(protocol::job_status(&job_id, status, error))
                    .await;
            }
            .instrument(span),
        );
    }

    /// Runs the worker, then gives a running job up to `drain` to finish
    /// ending its session, whether the worker stopped cleanly or gave up.
    pub async fn serve(
        &self,
        shutdown: watch::Receiver<bool>,
        drain: Duration,
    ) -> Result<(), DispatchError> {
        let result = self.run(shutdown).await;
        if !self.wait_idle(drain).await {
            warn!(?drain, "Running job did not finish before exit");
        }
        result
    }

    /// Waits for a running job to wind down, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_busy() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    fn stop_active_job(&self) {
        if let Ok(slot) = self.active.lock() {
            if let Some(job) = slot.as_ref() {
                let _ = job.stop.send(true);
            }
        }
    }
}
