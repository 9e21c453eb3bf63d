// Message State Tracker
// Canonical state of every message the client knows about. Pending messages are
// keyed by their tempId and re-keyed in place once the server assigns a
// permanent id; per-conversation order is kept separately so a re-key never
// moves a message in the list.

use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, SyncError};
use crate::models::{Message, MessageError, MessageId, MessageState};

/// Result of asking the tracker to move a message
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Message),
    /// Receipt for a message that is unknown or not yet on the server
    Buffered,
    /// Duplicate or backwards update
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct BufferedReceipt {
    state: MessageState,
    received_at: Instant,
}

pub struct MessageStateTracker {
    messages: HashMap<MessageId, Message>,
    pending_temp_ids: HashSet<String>,
    order: HashMap<String, Vec<MessageId>>,
    buffered: HashMap<MessageId, BufferedReceipt>,
    grace: Duration,
}

impl MessageStateTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            messages: HashMap::new(),
            pending_temp_ids: HashSet::new(),
            order: HashMap::new(),
            buffered: HashMap::new(),
            grace,
        }
    }

    /// Track a message created locally under a tempId. Re-inserting an id that
    /// is already tracked replaces it in place.
    pub fn insert_local(&mut self, message: Message) -> Message {
        let id = message.id.clone();
        if self.messages.insert(id.clone(), message.clone()).is_none() {
            self.order
                .entry(message.conversation_id.clone())
                .or_default()
                .push(id.clone());
        }
        self.pending_temp_ids.insert(id);
        message
    }

    /// Insert or merge a message that came from the server.
    pub fn upsert(&mut self, message: Message, now: Instant) -> Option<Message> {
        let id = message.id.clone();
        match self.messages.get_mut(&id) {
            Some(existing) => {
                let mut changed = false;
                if existing.text != message.text {
                    existing.text = message.text.clone();
                    changed = true;
                }
                if existing.state.can_transition_to(message.state) {
                    existing.state = message.state;
                    changed = true;
                }
                if !changed {
                    return None;
                }
                let updated = existing.clone();
                Some(self.apply_buffered(&id, now).unwrap_or(updated))
            }
            None => {
                self.order
                    .entry(message.conversation_id.clone())
                    .or_default()
                    .push(id.clone());
                self.messages.insert(id.clone(), message.clone());
                Some(self.apply_buffered(&id, now).unwrap_or(message))
            }
        }
    }

    pub fn transition(
        &mut self,
        id: &str,
        next: MessageState,
        error: Option<MessageError>,
        now: Instant,
    ) -> Result<TransitionOutcome> {
        let current = match self.messages.get(id) {
            Some(message) => message.state,
            None if next.is_receipt() => {
                self.buffer(id, next, now);
                return Ok(TransitionOutcome::Buffered);
            }
            None => return Err(SyncError::UnknownMessage(id.to_string())),
        };

        // Read/Delivered cannot land before the server has the message
        if next.is_receipt() && !current.is_confirmed() {
            self.buffer(id, next, now);
            return Ok(TransitionOutcome::Buffered);
        }

        let Some(message) = self.messages.get_mut(id) else {
            return Err(SyncError::UnknownMessage(id.to_string()));
        };
        if message.state.can_transition_to(next) {
            debug!("Message {} {:?} -> {:?}", id, message.state, next);
            message.state = next;
            message.error = if next == MessageState::Failed { error } else { None };
            return Ok(TransitionOutcome::Applied(message.clone()));
        }

        if message.state.is_stale(next) {
            return Ok(TransitionOutcome::Ignored);
        }

        Err(SyncError::InvalidTransition {
            id: id.to_string(),
            from: message.state,
            to: next,
        })
    }

    /// Swap a tempId for the server's permanent id, keeping list position.
    pub fn promote(
        &mut self,
        temp_id: &str,
        permanent_id: &str,
        timestamp: u64,
        now: Instant,
    ) -> Result<TransitionOutcome> {
        if !self.pending_temp_ids.contains(temp_id) {
            if self.messages.contains_key(permanent_id) {
                debug!("Duplicate ack for {} ({})", temp_id, permanent_id);
                return Ok(TransitionOutcome::Ignored);
            }
            return Err(SyncError::UnknownMessage(temp_id.to_string()));
        }

        let Some(current) = self.messages.get(temp_id) else {
            return Err(SyncError::UnknownMessage(temp_id.to_string()));
        };
        // Only Sending may become Sent
        if current.state != MessageState::Sending {
            return Err(SyncError::InvalidTransition {
                id: temp_id.to_string(),
                from: current.state,
                to: MessageState::Sent,
            });
        }

        let mut message = match self.messages.remove(temp_id) {
            Some(message) => message,
            None => return Err(SyncError::UnknownMessage(temp_id.to_string())),
        };
        self.pending_temp_ids.remove(temp_id);

        let conversation_id = message.conversation_id.clone();
        // The server may have echoed the message before acking it
        if self.messages.remove(permanent_id).is_some() {
            if let Some(order) = self.order.get_mut(&conversation_id) {
                order.retain(|id| id != permanent_id);
            }
        }

        message.id = permanent_id.to_string();
        message.timestamp = timestamp;
        message.state = MessageState::Sent;
        message.error = None;

        if let Some(order) = self.order.get_mut(&conversation_id) {
            if let Some(slot) = order.iter_mut().find(|id| id.as_str() == temp_id) {
                *slot = permanent_id.to_string();
            }
        }
        self.messages.insert(permanent_id.to_string(), message.clone());

        Ok(TransitionOutcome::Applied(
            self.apply_buffered(permanent_id, now).unwrap_or(message),
        ))
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Resolves only while the message still waits for its permanent id.
    pub fn lookup_by_temp_id(&self, temp_id: &str) -> Option<&Message> {
        if self.pending_temp_ids.contains(temp_id) {
            self.messages.get(temp_id)
        } else {
            None
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_temp_ids.contains(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let message = self.messages.remove(id)?;
        self.pending_temp_ids.remove(id);
        self.buffered.remove(id);
        if let Some(order) = self.order.get_mut(&message.conversation_id) {
            order.retain(|m| m != id);
        }
        Some(message)
    }

    pub fn conversation_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.order
            .get(conversation_id)
            .map(|ids| ids.iter().filter_map(|id| self.messages.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Inbound messages of a conversation that have not been read yet.
    pub fn unread_inbound(&self, conversation_id: &str, own_user_id: &str) -> Vec<MessageId> {
        self.conversation_messages(conversation_id)
            .into_iter()
            .filter(|m| m.sender_id != own_user_id && m.state == MessageState::Delivered)
            .map(|m| m.id)
            .collect()
    }

    pub fn in_state(&self, state: MessageState) -> Vec<Message> {
        self.messages.values().filter(|m| m.state == state).cloned().collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Drop buffered receipts older than the grace window.
    pub fn expire_buffered(&mut self, now: Instant) -> Vec<(MessageId, MessageState)> {
        let grace = self.grace;
        let expired: Vec<(MessageId, MessageState)> = self
            .buffered
            .iter()
            .filter(|(_, receipt)| now.duration_since(receipt.received_at) >= grace)
            .map(|(id, receipt)| (id.clone(), receipt.state))
            .collect();
        for (id, state) in &expired {
            self.buffered.remove(id);
            let stale = SyncError::StaleReceipt(id.clone());
            warn!("Discarding {:?} receipt: {}", state, stale);
        }
        expired
    }

    fn buffer(&mut self, id: &str, state: MessageState, now: Instant) {
        debug!("Buffering {:?} receipt for {}", state, id);
        let entry = self.buffered.entry(id.to_string()).or_insert(BufferedReceipt {
            state,
            received_at: now,
        });
        if state == MessageState::Read {
            entry.state = MessageState::Read;
        }
    }

    fn apply_buffered(&mut self, id: &str, now: Instant) -> Option<Message> {
        let receipt = self.buffered.get(id).copied()?;
        if now.duration_since(receipt.received_at) >= self.grace {
            self.buffered.remove(id);
            return None;
        }
        let message = self.messages.get_mut(id)?;
        if !message.state.is_confirmed() {
            return None;
        }
        self.buffered.remove(id);
        if message.state.can_transition_to(receipt.state) {
            debug!("Applying buffered {:?} receipt to {}", receipt.state, id);
            message.state = receipt.state;
            return Some(message.clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;

    fn outbound(id: &str, conversation: &str, state: MessageState) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            sender_id: "me".to_string(),
            text: format!("text of {}", id),
            timestamp: 1,
            state,
            error: None,
        }
    }

    fn inbound(id: &str, conversation: &str) -> Message {
        Message {
            sender_id: "them".to_string(),
            state: MessageState::Delivered,
            ..outbound(id, conversation, MessageState::Delivered)
        }
    }

    fn ids(tracker: &MessageStateTracker, conversation: &str) -> Vec<String> {
        tracker
            .conversation_messages(conversation)
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[test]
    fn test_promote_keeps_position_and_retires_temp_id() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));
        tracker.insert_local(outbound("tmp-b", "c", MessageState::Sending));

        // b is acknowledged first
        tracker.promote("tmp-b", "srv-2", 20, now).unwrap();
        tracker.promote("tmp-a", "srv-1", 10, now).unwrap();

        assert_eq!(ids(&tracker, "c"), vec!["srv-1", "srv-2"]);
        assert!(tracker.lookup_by_temp_id("tmp-a").is_none());
        assert!(tracker.get("tmp-a").is_none());
        assert_eq!(tracker.get("srv-2").unwrap().state, MessageState::Sent);
        assert_eq!(tracker.get("srv-2").unwrap().timestamp, 20);
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));
        tracker.promote("tmp-a", "srv-1", 10, now).unwrap();
        assert_eq!(
            tracker.promote("tmp-a", "srv-1", 10, now).unwrap(),
            TransitionOutcome::Ignored
        );
        assert_eq!(ids(&tracker, "c"), vec!["srv-1"]);
    }

    #[test]
    fn test_ack_after_server_echo_does_not_duplicate() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));
        tracker.upsert(outbound("srv-1", "c", MessageState::Sent), now);
        tracker.promote("tmp-a", "srv-1", 10, now).unwrap();
        assert_eq!(ids(&tracker, "c"), vec!["srv-1"]);
    }

    #[test]
    fn test_guarded_transitions() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Queued));

        assert!(matches!(
            tracker.transition("tmp-a", MessageState::Sent, None, now),
            Err(SyncError::InvalidTransition { .. })
        ));

        // Read before the server has it waits in the buffer
        assert_eq!(
            tracker.transition("tmp-a", MessageState::Read, None, now).unwrap(),
            TransitionOutcome::Buffered
        );
        assert_eq!(tracker.get("tmp-a").unwrap().state, MessageState::Queued);

        let failed = tracker
            .transition(
                "tmp-a",
                MessageState::Failed,
                Some(MessageError::transport("socket closed")),
                now,
            )
            .unwrap();
        match failed {
            TransitionOutcome::Applied(m) => {
                assert_eq!(m.error.unwrap().kind, FailureKind::Transport);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // Retry clears the error
        match tracker.transition("tmp-a", MessageState::Sending, None, now).unwrap() {
            TransitionOutcome::Applied(m) => assert!(m.error.is_none()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_stale_receipts_are_ignored() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));
        tracker.promote("tmp-a", "srv-1", 10, now).unwrap();
        tracker.transition("srv-1", MessageState::Read, None, now).unwrap();
        assert_eq!(
            tracker.transition("srv-1", MessageState::Delivered, None, now).unwrap(),
            TransitionOutcome::Ignored
        );
        assert_eq!(tracker.get("srv-1").unwrap().state, MessageState::Read);
    }

    #[test]
    fn test_receipt_racing_ack_is_applied_on_promote() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));

        assert_eq!(
            tracker.transition("srv-1", MessageState::Delivered, None, now).unwrap(),
            TransitionOutcome::Buffered
        );
        tracker.transition("srv-1", MessageState::Read, None, now).unwrap();

        let promoted = tracker
            .promote("tmp-a", "srv-1", 10, now + Duration::from_secs(1))
            .unwrap();
        match promoted {
            TransitionOutcome::Applied(m) => assert_eq!(m.state, MessageState::Read),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(tracker.buffered_len(), 0);
    }

    #[test]
    fn test_unknown_receipt_expires_after_grace() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.transition("ghost", MessageState::Read, None, now).unwrap();

        assert!(tracker.expire_buffered(now + Duration::from_secs(1)).is_empty());
        let expired = tracker.expire_buffered(now + Duration::from_secs(5));
        assert_eq!(expired, vec![("ghost".to_string(), MessageState::Read)]);

        // Materializing afterwards does not resurrect the receipt
        let msg = tracker.upsert(inbound("ghost", "c"), now + Duration::from_secs(6)).unwrap();
        assert_eq!(msg.state, MessageState::Delivered);
    }

    #[test]
    fn test_only_sending_messages_are_promoted() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.insert_local(outbound("tmp-q", "c", MessageState::Queued));
        assert!(matches!(
            tracker.promote("tmp-q", "srv-0", 10, now),
            Err(SyncError::InvalidTransition { .. })
        ));

        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));
        tracker
            .transition("tmp-a", MessageState::Failed, Some(MessageError::timeout("no ack")), now)
            .unwrap();
        assert!(matches!(
            tracker.promote("tmp-a", "srv-1", 10, now),
            Err(SyncError::InvalidTransition { from: MessageState::Failed, .. })
        ));
        assert_eq!(tracker.get("tmp-a").unwrap().state, MessageState::Failed);

        // through Sending it goes
        tracker.transition("tmp-a", MessageState::Sending, None, now).unwrap();
        tracker.promote("tmp-a", "srv-1", 10, now).unwrap();
        assert_eq!(tracker.get("srv-1").unwrap().state, MessageState::Sent);

        tracker.insert_local(outbound("tmp-b", "c", MessageState::Sending));
        tracker
            .transition("tmp-b", MessageState::Failed, Some(MessageError::rejected("blocked")), now)
            .unwrap();
        assert!(tracker.promote("tmp-b", "srv-2", 10, now).is_err());
    }

    #[test]
    fn test_unread_inbound_and_remove() {
        let now = Instant::now();
        let mut tracker = MessageStateTracker::new(Duration::from_secs(5));
        tracker.upsert(inbound("srv-1", "c"), now);
        tracker.upsert(inbound("srv-2", "c"), now);
        tracker.insert_local(outbound("tmp-a", "c", MessageState::Sending));
        assert_eq!(tracker.unread_inbound("c", "me"), vec!["srv-1", "srv-2"]);

        tracker.transition("srv-1", MessageState::Read, None, now).unwrap();
        assert_eq!(tracker.unread_inbound("c", "me"), vec!["srv-2"]);

        assert!(tracker.remove("tmp-a").is_some());
        assert!(tracker.lookup_by_temp_id("tmp-a").is_none());
        assert_eq!(ids(&tracker, "c"), vec!["srv-1", "srv-2"]);
    }
}
