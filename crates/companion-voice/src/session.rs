//! The call session machine: one companion call, from start to the post-end reset.
//!
//! States run `Idle → Connecting → Active → Ended → (grace) → Idle`. The machine owns
//! the transport, the capture loop and the playback scheduler for the lifetime of a
//! call; nothing else mutates them. All inputs (transport frames, utterances, timers,
//! decode and playback completion) are funnelled through `next_event` and applied by
//! `handle_event`, so every transition happens on one task.

use crate::amplitude::{self, VisemeTrack};
use crate::api::CallApi;
use crate::capture::{CaptureOutput, SpeechCaptureLoop, SpeechRecognizer};
use crate::config::CallConfig;
use crate::error::{CallResult, CaptureError, DecodeError, PlaybackError, SessionError, TransportError};
use crate::expression::Expression;
use crate::playback::{AudioSink, PlaybackScheduler};
use crate::protocol::{RemoteStatus, TransportMessage};
use crate::transport::{CallTransport, Connector, TransportEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

const SECOND: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    Ended,
}

/// The companion a call is placed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl CompanionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// Name to show the user; the id when no name is known.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: String,
    pub companion: CompanionRef,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: u64,
}

/// UI-facing view of the machine, published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub session_id: Option<String>,
    pub companion: Option<CompanionRef>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub response_text: Option<String>,
    pub expression: Expression,
    /// A user turn was sent and no response has arrived yet.
    pub processing: bool,
    /// The companion's reply is being decoded or played.
    pub speaking: bool,
    pub listening: bool,
    pub last_error: Option<String>,
}

/// Capabilities a machine is built from.
pub struct CallDependencies {
    pub api: Arc<dyn CallApi>,
    pub connector: Arc<dyn Connector>,
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub sink: Arc<dyn AudioSink>,
}

/// Everything that can wake the machine.
#[derive(Debug)]
pub enum SessionEvent {
    Transport(TransportEvent),
    Capture(Option<CaptureOutput>),
    DurationTick,
    ResponseTimeout,
    GraceElapsed,
    Decoded {
        audio: Vec<u8>,
        track: Result<VisemeTrack, DecodeError>,
    },
    PlaybackFinished(Result<(), PlaybackError>),
}

/// Commands accepted by `CallSessionMachine::run`.
#[derive(Debug)]
pub enum CallCommand {
    Start {
        companion: Option<CompanionRef>,
        reply: oneshot::Sender<CallResult<()>>,
    },
    End,
    Shutdown,
}

pub struct CallSessionMachine {
    config: CallConfig,
    api: Arc<dyn CallApi>,
    connector: Arc<dyn Connector>,
    capture: SpeechCaptureLoop,
    playback: PlaybackScheduler,

    status: CallStatus,
    session: Option<CallSession>,
    transport: Option<CallTransport>,
    processing: bool,
    response_text: Option<String>,
    expression: Expression,
    last_error: Option<String>,

    duration_ticker: Option<Interval>,
    response_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    decode_task: Option<JoinHandle<(Vec<u8>, Result<VisemeTrack, DecodeError>)>>,
    playback_task: Option<JoinHandle<Result<(), PlaybackError>>>,

    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl CallSessionMachine {
    pub fn new(config: CallConfig, deps: CallDependencies) -> Self {
        let capture = SpeechCaptureLoop::new(deps.recognizer, config.language.clone());
        let playback = PlaybackScheduler::new(deps.sink, config.frame_tick());
        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        Self {
            config,
            api: deps.api,
            connector: deps.connector,
            capture,
            playback,
            status: CallStatus::Idle,
            session: None,
            transport: None,
            processing: false,
            response_text: None,
            expression: Expression::Neutral,
            last_error: None,
            duration_ticker: None,
            response_deadline: None,
            grace_deadline: None,
            decode_task: None,
            playback_task: None,
            snapshot_tx,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Mouth-shape values for the presentation layer.
    pub fn subscribe_mouth(&self) -> watch::Receiver<f32> {
        self.playback.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            session_id: self.session.as_ref().map(|s| s.id.clone()),
            companion: self.session.as_ref().map(|s| s.companion.clone()),
            started_at: self.session.as_ref().map(|s| s.started_at),
            elapsed_secs: self.session.as_ref().map_or(0, |s| s.elapsed_secs),
            response_text: self.response_text.clone(),
            expression: self.expression,
            processing: self.processing,
            speaking: self.decode_task.is_some() || self.playback_task.is_some(),
            listening: self.capture.is_listening(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Place a call. Only valid from `Idle`; a teardown still in its grace period
    /// counts as in progress.
    pub async fn start_call(&mut self, companion: Option<CompanionRef>) -> CallResult<()> {
        if self.status != CallStatus::Idle {
            warn!(target: "companion::call", status = ?self.status, "Rejecting start: call not idle");
            return Err(SessionError::CallInProgress);
        }
        let companion = companion.ok_or(SessionError::NoCompanionSelected)?;

        self.status = CallStatus::Connecting;
        self.last_error = None;
        info!(target: "companion::call", companion_id = %companion.id, "📞 Starting call");
        self.publish();

        let record = match self.api.create_session(&companion.id).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail_connect(e)),
        };
        self.session = Some(CallSession {
            id: record.id.clone(),
            companion,
            started_at: Utc::now(),
            elapsed_secs: 0,
        });

        match CallTransport::open(
            self.connector.as_ref(),
            &record.id,
            &self.config.credentials,
        )
        .await
        {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => return Err(self.fail_connect(e)),
        }

        info!(target: "companion::call", session_id = %record.id, "Waiting for activation");
        self.publish();
        Ok(())
    }

    fn fail_connect(&mut self, e: TransportError) -> SessionError {
        error!(target: "companion::call", "Call setup failed: {}", e);
        self.last_error = Some(e.to_string());
        self.teardown();
        self.publish();
        SessionError::Transport(e)
    }

    /// User hang-up. No-op unless a call is connecting or live.
    pub fn end_call(&mut self) {
        if !self.is_live() {
            return;
        }
        info!(target: "companion::call", "📴 Ending call");
        self.teardown();
        self.publish();
    }

    fn is_live(&self) -> bool {
        matches!(self.status, CallStatus::Connecting | CallStatus::Active)
    }

    /// Wait for the next input. Cancel-safe.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            event = next_transport_event(&mut self.transport) => SessionEvent::Transport(event),
            output = self.capture.next_output() => SessionEvent::Capture(output),
            _ = tick(&mut self.duration_ticker) => SessionEvent::DurationTick,
            _ = sleep_until(self.response_deadline) => SessionEvent::ResponseTimeout,
            _ = sleep_until(self.grace_deadline) => SessionEvent::GraceElapsed,
            decoded = join(&mut self.decode_task) => {
                let (audio, track) = decoded.unwrap_or_else(|e| (Vec::new(), Err(DecodeError(e.to_string()))));
                SessionEvent::Decoded { audio, track }
            }
            finished = join(&mut self.playback_task) => {
                SessionEvent::PlaybackFinished(finished.unwrap_or_else(|e| Err(PlaybackError::Playback(e.to_string()))))
            }
        }
    }

    /// Wait for and apply one event.
    pub async fn step(&mut self) {
        let event = self.next_event().await;
        self.handle_event(event);
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport(TransportEvent::Message(message)) => self.on_message(message),
            SessionEvent::Transport(TransportEvent::Closed) => self.connection_lost(None),
            SessionEvent::Transport(TransportEvent::Failed(e)) => self.connection_lost(Some(e)),
            SessionEvent::Capture(Some(output)) => self.on_capture(output),
            SessionEvent::Capture(None) => {}
            SessionEvent::DurationTick => self.on_tick(),
            SessionEvent::ResponseTimeout => self.on_response_timeout(),
            SessionEvent::GraceElapsed => self.reset(),
            SessionEvent::Decoded { audio, track } => self.on_decoded(audio, track),
            SessionEvent::PlaybackFinished(result) => self.on_playback_finished(result),
        }
        self.publish();
    }

    /// Serve a front end until `Shutdown` or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) {
        enum Input {
            Command(Option<CallCommand>),
            Event(SessionEvent),
        }

        loop {
            let input = tokio::select! {
                command = commands.recv() => Input::Command(command),
                event = self.next_event() => Input::Event(event),
            };
            match input {
                Input::Event(event) => self.handle_event(event),
                Input::Command(Some(CallCommand::Start { companion, reply })) => {
                    let result = self.start_call(companion).await;
                    let _ = reply.send(result);
                }
                Input::Command(Some(CallCommand::End)) => self.end_call(),
                Input::Command(Some(CallCommand::Shutdown)) | Input::Command(None) => {
                    self.end_call();
                    info!(target: "companion::call", "Call machine shut down");
                    return;
                }
            }
        }
    }

    fn on_message(&mut self, message: TransportMessage) {
        match message {
            TransportMessage::Status { status, message } => {
                debug!(target: "companion::call", ?status, message = message.as_deref().unwrap_or(""), "Status");
                match status {
                    RemoteStatus::Active if self.status == CallStatus::Connecting => self.activate(),
                    RemoteStatus::Ended if self.is_live() => {
                        info!(target: "companion::call", "Call ended by service");
                        self.teardown();
                    }
                    _ => {}
                }
            }
            TransportMessage::Response {
                text,
                audio,
                audio_format,
            } => self.on_response(text, audio, &audio_format),
            TransportMessage::Error { message } => {
                warn!(target: "companion::call", %message, "Service error");
                self.last_error = Some(message);
                self.clear_processing();
            }
            TransportMessage::Pong { duration } => {
                debug!(target: "companion::call", duration, "Pong");
            }
            TransportMessage::End if self.is_live() => {
                info!(target: "companion::call", "Call ended by service");
                self.teardown();
            }
            other => {
                warn!(target: "companion::call", kind = other.kind(), "Ignoring unexpected message");
            }
        }
    }

    fn activate(&mut self) {
        self.status = CallStatus::Active;
        if let Some(session) = self.session.as_mut() {
            session.elapsed_secs = 0;
            session.started_at = Utc::now();
            info!(
                target: "companion::call",
                session_id = %session.id,
                companion = session.companion.display_name(),
                "✅ Call active"
            );
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + SECOND, SECOND);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.duration_ticker = Some(ticker);
        if let Some(output) = self.capture.start() {
            self.on_capture(output);
        }
    }

    fn on_capture(&mut self, output: CaptureOutput) {
        match output {
            CaptureOutput::Utterance(text) => self.on_utterance(text),
            CaptureOutput::Fatal(e) | CaptureOutput::Error(e) => self.surface_capture_error(e),
        }
    }

    fn surface_capture_error(&mut self, e: CaptureError) {
        if e != CaptureError::Transient {
            self.last_error = Some(e.to_string());
        }
    }

    fn on_utterance(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.status != CallStatus::Active {
            debug!(target: "companion::call", "Dropping utterance outside an active call");
            return;
        }
        if self.processing {
            info!(target: "companion::call", "Dropping utterance while a response is outstanding");
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(&TransportMessage::speech(text)) {
            self.connection_lost(Some(e));
            return;
        }
        info!(target: "companion::call", chars = text.chars().count(), "🗣️ Utterance sent");
        self.processing = true;
        self.expression = Expression::Thinking;
        self.last_error = None;
        self.response_deadline = Some(Instant::now() + self.config.response_timeout());
    }

    fn on_response(&mut self, text: String, audio: Option<Vec<u8>>, audio_format: &str) {
        if self.status != CallStatus::Active {
            debug!(target: "companion::call", "Ignoring response outside an active call");
            return;
        }
        self.processing = false;
        self.response_deadline = None;
        self.expression = Expression::from_response(&text);
        info!(target: "companion::call", expression = ?self.expression, "💬 Response received");
        self.response_text = Some(text);

        self.stop_speaking();
        if let Some(audio) = audio.filter(|a| !a.is_empty()) {
            debug!(target: "companion::call", bytes = audio.len(), %audio_format, "Decoding response audio");
            self.decode_task = Some(tokio::spawn(amplitude::analyze_async(audio)));
        }
    }

    fn on_decoded(&mut self, audio: Vec<u8>, track: Result<VisemeTrack, DecodeError>) {
        self.decode_task = None;
        if audio.is_empty() {
            let e = track.err().unwrap_or_else(|| DecodeError("clip missing".to_string()));
            self.on_playback_finished(Err(PlaybackError::Playback(e.to_string())));
            return;
        }
        let track = track.unwrap_or_else(|e| {
            warn!(target: "companion::call", "{}; playing without lip-sync", e);
            VisemeTrack::default()
        });
        let scheduler = self.playback.clone();
        self.playback_task = Some(tokio::spawn(async move { scheduler.play(audio, track).await }));
    }

    fn on_playback_finished(&mut self, result: Result<(), PlaybackError>) {
        self.playback_task = None;
        if let Err(e) = result {
            warn!(target: "companion::call", "Playback failed: {}", e);
        }
        if self.expression != Expression::Thinking {
            self.expression = Expression::Neutral;
        }
    }

    fn on_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.elapsed_secs += 1;
        let elapsed = session.elapsed_secs;
        let Some(every) = self.config.ping_interval() else {
            return;
        };
        if elapsed % every.as_secs().max(1) != 0 {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send(&TransportMessage::Ping) {
                self.connection_lost(Some(e));
            }
        }
    }

    fn on_response_timeout(&mut self) {
        self.response_deadline = None;
        if !self.processing {
            return;
        }
        warn!(target: "companion::call", timeout_secs = self.config.response_timeout_secs, "Response timed out");
        self.last_error = Some("The companion is taking too long to respond, please try again".to_string());
        self.clear_processing();
    }

    fn clear_processing(&mut self) {
        self.processing = false;
        self.response_deadline = None;
        if self.expression == Expression::Thinking {
            self.expression = Expression::Neutral;
        }
    }

    fn connection_lost(&mut self, cause: Option<TransportError>) {
        if !self.is_live() {
            self.transport = None;
            return;
        }
        let e = cause.unwrap_or(TransportError::Disconnected);
        error!(target: "companion::call", "Call channel lost: {}", e);
        self.last_error = Some(TransportError::Disconnected.to_string());
        self.teardown();
    }

    fn stop_speaking(&mut self) {
        if let Some(task) = self.decode_task.take() {
            task.abort();
        }
        if let Some(task) = self.playback_task.take() {
            task.abort();
            self.playback.stop();
        }
    }

    /// Stop capture, timers and playback, then close the channel. Leaves the machine
    /// in `Ended` with the grace timer armed.
    fn teardown(&mut self) {
        self.capture.stop();
        self.duration_ticker = None;
        self.clear_processing();
        self.stop_speaking();
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.expression = Expression::Neutral;
        self.status = CallStatus::Ended;
        self.grace_deadline = Some(Instant::now() + self.config.end_grace());
        if let Some(session) = self.session.as_ref() {
            info!(target: "companion::call", session_id = %session.id, elapsed_secs = session.elapsed_secs, "Call ended");
        }
    }

    fn reset(&mut self) {
        self.grace_deadline = None;
        self.status = CallStatus::Idle;
        self.session = None;
        self.response_text = None;
        self.last_error = None;
        self.expression = Expression::Neutral;
        self.processing = false;
        debug!(target: "companion::call", "Back to idle");
    }
}

async fn next_transport_event(transport: &mut Option<CallTransport>) -> TransportEvent {
    match transport {
        Some(transport) => match transport.recv().await {
            Some(event) => event,
            None => pending().await,
        },
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn join<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => pending().await,
    }
}
