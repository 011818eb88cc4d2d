//! Typed lines stand in for recognized speech.

use companion_voice::{RecognizerErrorCode, RecognizerEvent, RecognizerEvents, SpeechRecognizer};
use std::sync::{Arc, Mutex};

type Slot = Arc<Mutex<Option<RecognizerEvents>>>;

/// Recognizer half, owned by the call machine.
pub struct ConsoleRecognizer {
    slot: Slot,
}

/// Feeding half, kept by the stdin loop.
#[derive(Clone)]
pub struct ConsoleMic {
    slot: Slot,
}

impl ConsoleRecognizer {
    pub fn new() -> (Self, ConsoleMic) {
        let slot: Slot = Arc::default();
        (Self { slot: slot.clone() }, ConsoleMic { slot })
    }
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn start(&mut self, _language: &str, events: RecognizerEvents) -> Result<(), RecognizerErrorCode> {
        *lock(&self.slot) = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        lock(&self.slot).take();
    }
}

impl ConsoleMic {
    /// Deliver a typed line as an utterance. False while nothing is listening.
    pub fn feed(&self, line: &str) -> bool {
        match lock(&self.slot).as_ref() {
            Some(events) => events.emit(RecognizerEvent::Utterance(line.to_string())),
            None => false,
        }
    }
}

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, Option<RecognizerEvents>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
