// Transport seam for the messaging server
// Everything the engine needs from the wire goes through the `Transport` trait,
// so the core can run against the loopback server or a real socket client.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{Message, PresenceRecord};

pub mod loopback;

pub use loopback::LoopbackTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("authentication rejected")]
    Unauthorized,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("i/o error: {0}")]
    Io(String),
}

/// An outbound chat message as written to the wire.
///
/// The server deduplicates on `temp_id`, so re-sending a frame after a
/// dropped connection never creates a second message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub temp_id: String,
    pub conversation_id: String,
    pub text: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    DeliveryReceipt,
    ReadReceiptBatch,
    TypingChanged,
    PresenceChanged,
}

/// Server-pushed events fanned out by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(Message),
    DeliveryReceipt {
        conversation_id: String,
        message_ids: Vec<String>,
    },
    ReadReceiptBatch {
        conversation_id: String,
        reader_id: String,
        message_ids: Vec<String>,
    },
    TypingChanged {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    PresenceChanged(PresenceRecord),
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::NewMessage(_) => EventKind::NewMessage,
            InboundEvent::DeliveryReceipt { .. } => EventKind::DeliveryReceipt,
            InboundEvent::ReadReceiptBatch { .. } => EventKind::ReadReceiptBatch,
            InboundEvent::TypingChanged { .. } => EventKind::TypingChanged,
            InboundEvent::PresenceChanged(_) => EventKind::PresenceChanged,
        }
    }

    /// Presence is per user, not per conversation.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            InboundEvent::NewMessage(msg) => Some(&msg.conversation_id),
            InboundEvent::DeliveryReceipt { conversation_id, .. }
            | InboundEvent::ReadReceiptBatch { conversation_id, .. }
            | InboundEvent::TypingChanged { conversation_id, .. } => Some(conversation_id),
            InboundEvent::PresenceChanged(_) => None,
        }
    }
}

/// Everything that can arrive on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server stored the message under a permanent id
    Ack {
        temp_id: String,
        message_id: String,
        conversation_id: String,
        timestamp: u64,
    },
    /// Explicit, non-retryable denial
    Rejected { temp_id: String, reason: String },
    Inbound(InboundEvent),
    /// The server or the socket closed the connection
    Closed { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection. Events for this connection arrive on the returned
    /// receiver; the receiver closing means the connection is gone.
    async fn open(&self, auth_token: &str) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn close(&self);

    /// Write a chat message. `Ok` means written, not acknowledged.
    async fn transmit(&self, frame: OutboundFrame) -> Result<(), TransportError>;

    async fn mark_read(&self, conversation_id: &str, message_ids: &[String]) -> Result<(), TransportError>;

    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> Result<(), TransportError>;

    async fn fetch_presence(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, TransportError>;
}
