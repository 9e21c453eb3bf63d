use serde::{Deserialize, Serialize};

/// Identifier of a message: a tempId while pending, the server id afterwards.
pub type MessageId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: u64, // ms since epoch
    pub state: MessageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

impl Message {
    pub fn is_failed(&self) -> bool {
        self.state == MessageState::Failed
    }

    /// A failed message the UI may offer to retry.
    pub fn is_retryable(&self) -> bool {
        self.is_failed() && self.error.as_ref().map_or(true, |e| e.retryable)
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum MessageState {
    Queued,    // Waiting for a connection
    Sending,   // Handed to the transport, no ack yet
    Sent,      // Acknowledged by the server, has a permanent id
    Delivered, // Delivered to the recipient's device
    Read,      // Read by the recipient
    Failed,    // Transport error, rejection or ack timeout
}

impl MessageState {
    /// Position on the forward path. `Failed` sits outside of it.
    fn rank(self) -> Option<u8> {
        match self {
            MessageState::Queued => Some(0),
            MessageState::Sending => Some(1),
            MessageState::Sent => Some(2),
            MessageState::Delivered => Some(3),
            MessageState::Read => Some(4),
            MessageState::Failed => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Forward moves are allowed along Queued → Sending → Sent → Delivered → Read,
    /// skipping forward only once the server has the message (Sent onwards).
    /// `Failed` is reachable from Queued/Sending and only leaves through the
    /// retry path (back to Sending, or Queued while offline).
    pub fn can_transition_to(self, next: MessageState) -> bool {
        use MessageState::*;
        match (self, next) {
            (Queued, Sending) | (Sending, Sent) => true,
            (Queued, Failed) | (Sending, Failed) => true,
            (Failed, Sending) | (Failed, Queued) => true,
            (Sent, Delivered) | (Sent, Read) | (Delivered, Read) => true,
            _ => false,
        }
    }

    /// A transition that would move backwards (or stand still) on the forward path.
    /// Such updates are stale duplicates and are dropped quietly.
    pub fn is_stale(self, next: MessageState) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(next)) => next <= current,
            _ => self == next,
        }
    }

    /// Receipt states only make sense once the server knows the message.
    pub fn is_receipt(self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Read)
    }

    pub fn is_confirmed(self) -> bool {
        matches!(
            self,
            MessageState::Sent | MessageState::Delivered | MessageState::Read
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transport,
    Timeout,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    pub kind: FailureKind,
    pub detail: String,
    pub retryable: bool,
}

impl MessageError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            detail: detail.into(),
            retryable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_ids: Vec<String>,
    pub last_activity: u64,
}

/// Durable record of an unconfirmed outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub temp_id: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(rename = "timestamp")]
    pub enqueued_at: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingState {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: Option<u64>,
    pub fetched_at: u64,
}

/// What a conversation subscriber observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    Message(Message),
    /// The entry known as `temp_id` now carries its permanent id
    Replaced { temp_id: String, message: Message },
    Removed { id: MessageId },
    Typing(TypingState),
    Presence(PresenceRecord),
}

/// Wall clock in milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
