// In-memory messaging server
// Behaves like the real server as far as the engine can observe: it assigns
// permanent ids, deduplicates on tempId, pushes acks and receipts, and can be
// made unreachable or drop the connection on demand. Used by the demo binary
// and by the test-suite.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{InboundEvent, OutboundFrame, Transport, TransportError, TransportEvent};
use crate::models::{now_millis, PresenceRecord};

const EVENT_BUFFER: usize = 256;

/// A message as the server stored it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub temp_id: String,
    pub conversation_id: String,
    pub text: String,
}

#[derive(Default)]
struct ServerState {
    reachable: bool,
    auto_ack: bool,
    fail_transmit: bool,
    required_token: Option<String>,
    connection: Option<mpsc::Sender<TransportEvent>>,
    opens: usize,
    acked: HashMap<String, StoredMessage>, // temp id -> stored message
    stored: Vec<StoredMessage>,
    transmissions: Vec<OutboundFrame>,
    unacked: Vec<OutboundFrame>,
    rejected_conversations: HashSet<String>,
    read_calls: Vec<(String, Vec<String>)>,
    typing_calls: Vec<(String, bool)>,
    presence: HashMap<String, PresenceRecord>,
    presence_fetches: Vec<Vec<String>>,
}

pub struct LoopbackTransport {
    state: Mutex<ServerState>,
    next_id: AtomicU64,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// A reachable server that acknowledges every message immediately.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                reachable: true,
                auto_ack: true,
                ..ServerState::default()
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        // A poisoned lock only means a test panicked while holding it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the server (un)reachable. Going unreachable drops the open connection.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.reachable = reachable;
        if !reachable {
            if let Some(tx) = state.connection.take() {
                let _ = tx.try_send(TransportEvent::Closed {
                    reason: "server unreachable".to_string(),
                });
            }
        }
    }

    /// Drop the current connection while staying reachable.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.lock().connection.take() {
            let _ = tx.try_send(TransportEvent::Closed {
                reason: "connection reset".to_string(),
            });
        }
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.lock().auto_ack = auto_ack;
    }

    pub fn set_fail_transmit(&self, fail: bool) {
        self.lock().fail_transmit = fail;
    }

    pub fn require_token(&self, token: impl Into<String>) {
        self.lock().required_token = Some(token.into());
    }

    /// Every message sent to this conversation is rejected, e.g. a blocked counterpart.
    pub fn reject_conversation(&self, conversation_id: impl Into<String>) {
        self.lock().rejected_conversations.insert(conversation_id.into());
    }

    pub fn set_presence(&self, record: PresenceRecord) {
        self.lock().presence.insert(record.user_id.clone(), record);
    }

    /// Acknowledge a frame held back while auto-ack is off.
    pub async fn ack(&self, temp_id: &str) -> bool {
        let (event, tx) = {
            let mut state = self.lock();
            let Some(pos) = state.unacked.iter().position(|f| f.temp_id == temp_id) else {
                return false;
            };
            let frame = state.unacked.remove(pos);
            let stored = self.store(&mut state, &frame);
            (Self::ack_event(&stored), state.connection.clone())
        };
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Push a server event down the open connection.
    pub async fn push(&self, event: InboundEvent) -> bool {
        let tx = self.lock().connection.clone();
        match tx {
            Some(tx) => tx.send(TransportEvent::Inbound(event)).await.is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn stored_messages(&self) -> Vec<StoredMessage> {
        self.lock().stored.clone()
    }

    pub fn transmissions(&self) -> Vec<OutboundFrame> {
        self.lock().transmissions.clone()
    }

    pub fn read_calls(&self) -> Vec<(String, Vec<String>)> {
        self.lock().read_calls.clone()
    }

    pub fn typing_calls(&self) -> Vec<(String, bool)> {
        self.lock().typing_calls.clone()
    }

    pub fn presence_fetches(&self) -> Vec<Vec<String>> {
        self.lock().presence_fetches.clone()
    }

    fn store(&self, state: &mut ServerState, frame: &OutboundFrame) -> StoredMessage {
        if let Some(existing) = state.acked.get(&frame.temp_id) {
            debug!("Duplicate frame {} re-acked as {}", frame.temp_id, existing.message_id);
            return existing.clone();
        }
        let stored = StoredMessage {
            message_id: format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            temp_id: frame.temp_id.clone(),
            conversation_id: frame.conversation_id.clone(),
            text: frame.text.clone(),
        };
        state.acked.insert(frame.temp_id.clone(), stored.clone());
        state.stored.push(stored.clone());
        stored
    }

    fn ack_event(stored: &StoredMessage) -> TransportEvent {
        TransportEvent::Ack {
            temp_id: stored.temp_id.clone(),
            message_id: stored.message_id.clone(),
            conversation_id: stored.conversation_id.clone(),
            timestamp: now_millis(),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, auth_token: &str) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(TransportError::Io("server unreachable".to_string()));
        }
        if let Some(required) = &state.required_token {
            if required != auth_token {
                return Err(TransportError::Unauthorized);
            }
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.connection = Some(tx);
        state.opens += 1;
        info!("Loopback connection #{} opened", state.opens);
        Ok(rx)
    }

    async fn close(&self) {
        if self.lock().connection.take().is_some() {
            debug!("Loopback connection closed by client");
        }
    }

    async fn transmit(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        let (event, tx) = {
            let mut state = self.lock();
            let Some(tx) = state.connection.clone() else {
                return Err(TransportError::NotConnected);
            };
            if state.fail_transmit {
                return Err(TransportError::Io("write failed".to_string()));
            }
            state.transmissions.push(frame.clone());

            let event = if state.rejected_conversations.contains(&frame.conversation_id) {
                Some(TransportEvent::Rejected {
                    temp_id: frame.temp_id.clone(),
                    reason: "recipient unavailable".to_string(),
                })
            } else if state.auto_ack || state.acked.contains_key(&frame.temp_id) {
                let stored = self.store(&mut state, &frame);
                Some(Self::ack_event(&stored))
            } else {
                state.unacked.push(frame);
                None
            };
            (event, tx)
        };
        if let Some(event) = event {
            tx.send(event)
                .await
                .map_err(|_| TransportError::ConnectionLost("connection closed".to_string()))?;
        }
        Ok(())
    }

    async fn mark_read(&self, conversation_id: &str, message_ids: &[String]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.connection.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.read_calls.push((conversation_id.to_string(), message_ids.to_vec()));
        Ok(())
    }

    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.connection.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.typing_calls.push((conversation_id.to_string(), is_typing));
        Ok(())
    }

    async fn fetch_presence(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, TransportError> {
        let mut state = self.lock();
        if state.connection.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.presence_fetches.push(user_ids.to_vec());
        let now = now_millis();
        Ok(user_ids
            .iter()
            .map(|id| {
                let mut record = state.presence.get(id).cloned().unwrap_or(PresenceRecord {
                    user_id: id.clone(),
                    is_online: false,
                    last_seen: None,
                    fetched_at: now,
                });
                record.fetched_at = now;
                record
            })
            .collect())
    }
}
