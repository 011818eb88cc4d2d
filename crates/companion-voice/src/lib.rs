//! # Companion Voice - Real-time Companion Calls
//!
//! This crate implements the voice call with a companion: a call session that
//! multiplexes the call-service channel, a continuous speech-capture loop with
//! automatic recovery, and amplitude-driven lip-sync for the companion's replies.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Call Session Machine                      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │ Speech Loop  │→ │    Turn      │→ │CallTransport │ ──→ ws │
//! │  │ (recognizer) │  │ (processing) │  │ (JSON frames)│ ←── ws │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │                                             ↓ response       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │  Audio Out   │← │  Playback    │← │  Amplitude   │        │
//! │  │   (rodio)    │  │  Scheduler   │  │  (50ms RMS)  │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │                           ↓ mouth shape                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod amplitude;
pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod expression;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;

pub use amplitude::{analyze, analyze_async, analyze_pcm, VisemeTrack, FRAME_INTERVAL};
pub use api::{CallApi, HttpCallApi, SessionRecord};
pub use capture::{
    CaptureOutput, CaptureState, RecognizerErrorCode, RecognizerEvent, RecognizerEvents,
    SpeechCaptureLoop, SpeechRecognizer,
};
pub use config::{CallConfig, Credentials};
pub use error::{
    CallResult, CaptureError, ConfigError, DecodeError, PlaybackError, SessionError,
    TransportError,
};
pub use expression::Expression;
pub use playback::{AudioSink, FrameTicker, PlaybackScheduler, RodioSink};
pub use protocol::{RemoteStatus, TransportMessage};
pub use session::{
    CallCommand, CallDependencies, CallSession, CallSessionMachine, CallSnapshot, CallStatus,
    CompanionRef, SessionEvent,
};
pub use transport::{
    CallTransport, Channel, ChannelState, Connector, InboundFrame, MemoryConnector, MemoryPeer,
    OutboundFrame, TransportEvent,
};
