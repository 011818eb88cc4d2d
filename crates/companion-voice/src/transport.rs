//! Call transport: the message channel to the call service.
//!
//! A `Connector` opens a raw text channel for one session; `CallTransport` layers the
//! call protocol on top. Channel lifecycle is `Opening → Open → Closed`, and the first
//! frame written after open is always `activate`.

use crate::config::Credentials;
use crate::error::TransportError;
use crate::protocol::TransportMessage;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frames written towards the call service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Frames and lifecycle signals read from the call service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Closed,
    Error(String),
}

/// Raw duplex channel. Adapters pump I/O on their own tasks.
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens channels to the call service (WebSocket in production, memory in tests).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<Channel, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
}

/// Inbound events after protocol decoding
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(TransportMessage),
    Closed,
    Failed(TransportError),
}

pub struct CallTransport {
    session_id: String,
    state: ChannelState,
    inbound_failed: bool,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl CallTransport {
    /// Open a channel for `session_id` and send `activate` with the given credentials.
    pub async fn open(
        connector: &dyn Connector,
        session_id: &str,
        credentials: &Credentials,
    ) -> Result<Self, TransportError> {
        debug!(target: "companion::call", session_id, state = ?ChannelState::Opening, "Opening call channel");
        let channel = connector.connect(session_id).await?;

        let mut transport = Self {
            session_id: session_id.to_string(),
            state: ChannelState::Open,
            inbound_failed: false,
            outbound: channel.outbound,
            inbound: channel.inbound,
        };

        let activate = TransportMessage::Activate {
            credentials: credentials.clone(),
        };
        transport.write(&activate)?;
        info!(target: "companion::call", session_id, "📞 Channel open, activation sent");
        Ok(transport)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a protocol message. `activate` is only ever sent by `open`.
    pub fn send(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        if matches!(message, TransportMessage::Activate { .. }) {
            return Err(TransportError::InvalidMessage(
                "activate is sent once, on open".to_string(),
            ));
        }
        self.write(message)
    }

    fn write(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        if self.state != ChannelState::Open {
            return Err(TransportError::Disconnected);
        }
        let frame = message.encode()?;
        debug!(target: "companion::call", kind = message.kind(), "→ send");
        self.outbound
            .send(OutboundFrame::Text(frame))
            .map_err(|_| TransportError::Disconnected)
    }

    /// Next inbound event. Malformed frames are logged and skipped.
    /// Returns `Closed` or `Failed` once, then `None`.
    ///
    /// A read error leaves the channel `Open` so `close` can still try to write `end`.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        if self.state == ChannelState::Closed || self.inbound_failed {
            return None;
        }
        loop {
            match self.inbound.recv().await {
                Some(InboundFrame::Text(frame)) => match TransportMessage::decode(&frame) {
                    Ok(message) => {
                        debug!(target: "companion::call", kind = message.kind(), "← recv");
                        return Some(TransportEvent::Message(message));
                    }
                    Err(e) => {
                        warn!(target: "companion::call", "Skipping malformed frame: {}", e);
                    }
                },
                Some(InboundFrame::Error(reason)) => {
                    self.inbound_failed = true;
                    warn!(target: "companion::call", %reason, "Call channel error");
                    return Some(TransportEvent::Failed(TransportError::Disconnected));
                }
                Some(InboundFrame::Closed) | None => {
                    self.state = ChannelState::Closed;
                    return Some(TransportEvent::Closed);
                }
            }
        }
    }

    /// Best-effort `end`, then close. Idempotent.
    pub fn close(&mut self) {
        if self.state == ChannelState::Open {
            if let Err(e) = self.write(&TransportMessage::End) {
                debug!(target: "companion::call", "End not delivered: {}", e);
            }
            let _ = self.outbound.send(OutboundFrame::Close);
            info!(target: "companion::call", session_id = %self.session_id, "Channel closed");
        }
        self.state = ChannelState::Closed;
    }
}

/// In-process connector: each `connect` hands the far end to the receiver returned
/// by `MemoryConnector::new`. Useful for tests and offline demos.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refuse: bool,
}

/// The service side of one in-memory channel.
pub struct MemoryPeer {
    pub session_id: String,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    to_client: mpsc::UnboundedSender<InboundFrame>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refuse: false,
            },
            rx,
        )
    }

    /// A connector whose every `connect` fails with `ConnectFailed`.
    pub fn refusing() -> Self {
        let (accepted, _) = mpsc::unbounded_channel();
        Self {
            accepted,
            refuse: true,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, session_id: &str) -> Result<Channel, TransportError> {
        if self.refuse {
            return Err(TransportError::ConnectFailed("connection refused".to_string()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            session_id: session_id.to_string(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("no listener".to_string()))?;
        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryPeer {
    /// Next decoded client message; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<TransportMessage> {
        loop {
            match self.from_client.recv().await? {
                OutboundFrame::Text(frame) => {
                    if let Ok(message) = TransportMessage::decode(&frame) {
                        return Some(message);
                    }
                }
                OutboundFrame::Close => return None,
            }
        }
    }

    /// Non-blocking variant of `recv` for asserting nothing else was sent.
    pub fn try_recv(&mut self) -> Option<TransportMessage> {
        loop {
            match self.from_client.try_recv().ok()? {
                OutboundFrame::Text(frame) => {
                    if let Ok(message) = TransportMessage::decode(&frame) {
                        return Some(message);
                    }
                }
                OutboundFrame::Close => return None,
            }
        }
    }

    pub fn send(&self, message: &TransportMessage) -> Result<(), TransportError> {
        let frame = message.encode()?;
        self.to_client
            .send(InboundFrame::Text(frame))
            .map_err(|_| TransportError::Disconnected)
    }

    pub fn send_raw(&self, frame: InboundFrame) -> Result<(), TransportError> {
        self.to_client
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }
}
