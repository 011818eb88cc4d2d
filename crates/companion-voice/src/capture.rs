//! Continuous speech capture on top of a recognizer that turns itself off.
//!
//! Platform recognizers emit discrete events (utterance, ended, error) and stop on
//! their own every so often. `SpeechCaptureLoop` restarts them whenever it is still
//! listening, classifies errors, and hands utterances upward:
//!
//! - `Ended` while listening → restart.
//! - `NoSpeech` → transient; restart, nothing surfaced.
//! - `PermissionDenied` → fatal; listening stops, no restart.
//! - any other error → surfaced, and still restarted while listening.
//!
//! Every `start` of the recognizer is a new run. Lifecycle events from an earlier
//! run are ignored, so an error followed by that run's own `Ended` restarts once.

use crate::error::CaptureError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Raw error codes reported by a recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerErrorCode {
    PermissionDenied,
    NoSpeech,
    Other(String),
}

/// Lifecycle events a recognizer delivers through `RecognizerEvents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    Utterance(String),
    Ended,
    Error(RecognizerErrorCode),
}

/// Event sink handed to the recognizer for one run.
#[derive(Debug, Clone)]
pub struct RecognizerEvents {
    run: u64,
    tx: mpsc::UnboundedSender<(u64, RecognizerEvent)>,
}

impl RecognizerEvents {
    /// Deliver an event. Returns false once the capture loop is gone.
    pub fn emit(&self, event: RecognizerEvent) -> bool {
        self.tx.send((self.run, event)).is_ok()
    }

    pub fn run(&self) -> u64 {
        self.run
    }
}

/// Platform speech-to-text capability.
///
/// `start` must not block; results arrive later through `events`.
pub trait SpeechRecognizer: Send {
    fn start(&mut self, language: &str, events: RecognizerEvents) -> Result<(), RecognizerErrorCode>;

    fn stop(&mut self);
}

/// What the loop hands to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutput {
    Utterance(String),
    /// Capture stopped for good (permission denied).
    Fatal(CaptureError),
    /// User-visible error; capture keeps running.
    Error(CaptureError),
}

/// Listening flag plus the last classified error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureState {
    pub listening: bool,
    pub last_error: Option<CaptureError>,
}

pub struct SpeechCaptureLoop {
    recognizer: Box<dyn SpeechRecognizer>,
    language: String,
    state: CaptureState,
    active: bool,
    run: u64,
    restarts: u64,
    events_tx: mpsc::UnboundedSender<(u64, RecognizerEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, RecognizerEvent)>,
}

impl SpeechCaptureLoop {
    pub fn new(recognizer: Box<dyn SpeechRecognizer>, language: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            recognizer,
            language: language.into(),
            state: CaptureState::default(),
            active: false,
            run: 0,
            restarts: 0,
            events_tx,
            events_rx,
        }
    }

    /// Begin listening. If a capture is already active it is stopped first.
    pub fn start(&mut self) -> Option<CaptureOutput> {
        if self.active {
            debug!("Capture already active, restarting");
            self.recognizer.stop();
            self.active = false;
        }
        self.state.listening = true;
        self.state.last_error = None;
        info!(language = %self.language, "🎤 Speech capture started");
        self.launch()
    }

    /// Stop listening. Events still in flight are ignored for restart purposes.
    pub fn stop(&mut self) {
        if !self.state.listening && !self.active {
            return;
        }
        self.state.listening = false;
        if self.active {
            self.recognizer.stop();
            self.active = false;
        }
        info!("Speech capture stopped");
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state.listening
    }

    /// Number of automatic restarts since construction.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Wait for the next output worth surfacing. Restarts happen inside.
    /// Cancel-safe: an event is either fully handled or still queued.
    pub async fn next_output(&mut self) -> Option<CaptureOutput> {
        loop {
            let (run, event) = self.events_rx.recv().await?;
            if let Some(output) = self.handle_run_event(run, event) {
                return Some(output);
            }
        }
    }

    /// Apply the restart/classification policy to an event from the current run.
    pub fn handle_event(&mut self, event: RecognizerEvent) -> Option<CaptureOutput> {
        self.handle_run_event(self.run, event)
    }

    fn handle_run_event(&mut self, run: u64, event: RecognizerEvent) -> Option<CaptureOutput> {
        if let RecognizerEvent::Utterance(text) = event {
            if !self.state.listening {
                debug!("Dropping utterance received after stop");
                return None;
            }
            return Some(CaptureOutput::Utterance(text));
        }
        if run != self.run {
            debug!(run, current = self.run, "Ignoring event from a finished run");
            return None;
        }

        match event {
            RecognizerEvent::Utterance(_) => None,
            RecognizerEvent::Ended => {
                self.active = false;
                self.restart_if_listening()
            }
            RecognizerEvent::Error(RecognizerErrorCode::PermissionDenied) => {
                warn!("Microphone permission denied, capture will not restart");
                self.active = false;
                let was_listening = self.state.listening;
                self.state.listening = false;
                self.state.last_error = Some(CaptureError::PermissionDenied);
                was_listening.then_some(CaptureOutput::Fatal(CaptureError::PermissionDenied))
            }
            RecognizerEvent::Error(RecognizerErrorCode::NoSpeech) => {
                debug!("No speech detected");
                self.active = false;
                self.state.last_error = Some(CaptureError::Transient);
                self.restart_if_listening()
            }
            RecognizerEvent::Error(RecognizerErrorCode::Other(code)) => {
                warn!(%code, "Speech recognition error");
                self.active = false;
                let error = CaptureError::Recognizer { code };
                self.state.last_error = Some(error.clone());
                let surfaced = self.state.listening.then(|| CaptureOutput::Error(error));
                self.restart_if_listening().or(surfaced)
            }
        }
    }

    fn restart_if_listening(&mut self) -> Option<CaptureOutput> {
        if !self.state.listening {
            return None;
        }
        self.restarts += 1;
        debug!(restarts = self.restarts, "Restarting speech capture");
        self.launch()
    }

    /// Start a new recognizer run. A refused start is fatal: no retry loop.
    fn launch(&mut self) -> Option<CaptureOutput> {
        self.run += 1;
        let events = RecognizerEvents {
            run: self.run,
            tx: self.events_tx.clone(),
        };
        match self.recognizer.start(&self.language, events) {
            Ok(()) => {
                self.active = true;
                None
            }
            Err(code) => {
                self.active = false;
                self.state.listening = false;
                let error = match code {
                    RecognizerErrorCode::PermissionDenied => CaptureError::PermissionDenied,
                    RecognizerErrorCode::NoSpeech => CaptureError::Transient,
                    RecognizerErrorCode::Other(code) => CaptureError::Recognizer { code },
                };
                warn!("Speech recognizer refused to start: {}", error);
                self.state.last_error = Some(error.clone());
                Some(CaptureOutput::Fatal(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counts {
        starts: usize,
        stops: usize,
        runs: Vec<RecognizerEvents>,
    }

    struct FakeRecognizer {
        counts: Arc<Mutex<Counts>>,
        fail_start_with: Option<RecognizerErrorCode>,
    }

    impl SpeechRecognizer for FakeRecognizer {
        fn start(&mut self, _language: &str, events: RecognizerEvents) -> Result<(), RecognizerErrorCode> {
            let mut counts = self.counts.lock().unwrap();
            counts.starts += 1;
            counts.runs.push(events);
            match self.fail_start_with.clone() {
                Some(code) => Err(code),
                None => Ok(()),
            }
        }

        fn stop(&mut self) {
            self.counts.lock().unwrap().stops += 1;
        }
    }

    fn capture_loop() -> (SpeechCaptureLoop, Arc<Mutex<Counts>>) {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let recognizer = FakeRecognizer {
            counts: Arc::clone(&counts),
            fail_start_with: None,
        };
        (SpeechCaptureLoop::new(Box::new(recognizer), "zh-CN"), counts)
    }

    fn starts(counts: &Arc<Mutex<Counts>>) -> usize {
        counts.lock().unwrap().starts
    }

    #[test]
    fn ended_while_listening_restarts_once() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        assert_eq!(capture.handle_run_event(1, RecognizerEvent::Ended), None);
        assert_eq!(starts(&counts), 2);
        assert_eq!(capture.restarts(), 1);
    }

    #[test]
    fn no_speech_restarts_once_even_with_trailing_end() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        let no_speech = RecognizerEvent::Error(RecognizerErrorCode::NoSpeech);
        assert_eq!(capture.handle_run_event(1, no_speech), None);
        // The first run's own end arrives after the restart and is ignored.
        assert_eq!(capture.handle_run_event(1, RecognizerEvent::Ended), None);
        assert_eq!(starts(&counts), 2);
        assert_eq!(capture.restarts(), 1);
        assert_eq!(capture.state().last_error, Some(CaptureError::Transient));
        assert!(capture.is_listening());
    }

    #[test]
    fn permission_denied_never_restarts() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        let denied = RecognizerEvent::Error(RecognizerErrorCode::PermissionDenied);
        assert_eq!(
            capture.handle_run_event(1, denied),
            Some(CaptureOutput::Fatal(CaptureError::PermissionDenied))
        );
        assert_eq!(capture.handle_run_event(1, RecognizerEvent::Ended), None);
        assert_eq!(starts(&counts), 1);
        assert_eq!(capture.restarts(), 0);
        assert!(!capture.is_listening());
    }

    #[test]
    fn other_errors_surface_and_still_restart() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        let out = capture.handle_run_event(
            1,
            RecognizerEvent::Error(RecognizerErrorCode::Other("network".to_string())),
        );
        assert_eq!(
            out,
            Some(CaptureOutput::Error(CaptureError::Recognizer {
                code: "network".to_string()
            }))
        );
        assert_eq!(capture.handle_run_event(1, RecognizerEvent::Ended), None);
        assert_eq!(starts(&counts), 2);
        assert!(capture.is_listening());
    }

    #[test]
    fn ended_after_stop_does_not_restart() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        capture.stop();
        capture.handle_run_event(1, RecognizerEvent::Ended);
        let counts = counts.lock().unwrap();
        assert_eq!(counts.starts, 1);
        assert_eq!(counts.stops, 1);
    }

    #[test]
    fn start_while_active_implies_stop() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        capture.start();
        let counts = counts.lock().unwrap();
        assert_eq!(counts.starts, 2);
        assert_eq!(counts.stops, 1);
    }

    #[test]
    fn utterance_after_stop_is_dropped() {
        let (mut capture, _) = capture_loop();
        capture.start();
        capture.stop();
        assert_eq!(
            capture.handle_event(RecognizerEvent::Utterance("late".to_string())),
            None
        );
    }

    #[test]
    fn refused_start_is_fatal() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let recognizer = FakeRecognizer {
            counts: Arc::clone(&counts),
            fail_start_with: Some(RecognizerErrorCode::PermissionDenied),
        };
        let mut capture = SpeechCaptureLoop::new(Box::new(recognizer), "zh-CN");
        assert_eq!(
            capture.start(),
            Some(CaptureOutput::Fatal(CaptureError::PermissionDenied))
        );
        assert!(!capture.is_listening());
        assert_eq!(starts(&counts), 1);
    }

    #[tokio::test]
    async fn next_output_delivers_utterances_across_restarts() {
        let (mut capture, counts) = capture_loop();
        capture.start();
        let first_run = counts.lock().unwrap().runs[0].clone();
        assert!(first_run.emit(RecognizerEvent::Ended));

        // The restarted run carries the utterance.
        let next = capture.next_output();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), next).await;
        let second_run = counts.lock().unwrap().runs[1].clone();
        assert_eq!(second_run.run(), 2);
        assert!(second_run.emit(RecognizerEvent::Utterance("你好".to_string())));

        assert_eq!(
            capture.next_output().await,
            Some(CaptureOutput::Utterance("你好".to_string()))
        );
        assert_eq!(capture.restarts(), 1);
    }
}
