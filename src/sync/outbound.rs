// Outbound Queue & Send Pipeline
// Every conversation gets one worker task with a FIFO mailbox; immediate sends,
// manual retries and reconnect flushes for that conversation all go through it,
// so they never overlap and keep submission order. Messages submitted while
// offline are persisted in the durable queue until the server acknowledges them.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::feed::ConversationFeed;
use super::tracker::{MessageStateTracker, TransitionOutcome};
use super::{ConversationDirectory, EngineEvent};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError, ValidationError};
use crate::models::{
    now_millis, ConversationUpdate, Message, MessageError, MessageState, QueuedMessage,
};
use crate::store::QueueStore;
use crate::transport::{OutboundFrame, Transport};

/// Reject text that must never be queued.
pub fn validate_text(text: &str, max_len: usize) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = text.chars().count();
    if len > max_len {
        return Err(ValidationError::TooLong { len, max: max_len });
    }
    Ok(())
}

pub fn new_temp_id() -> String {
    format!("tmp-{}", Uuid::new_v4())
}

/// Durable, per-conversation ordered queue of unconfirmed messages
pub struct OutboundQueue {
    store: Arc<dyn QueueStore>,
    entries: BTreeMap<String, Vec<QueuedMessage>>,
    last_enqueued_at: u64,
}

impl OutboundQueue {
    /// Load whatever a previous process left behind, in submission order.
    pub fn restore(store: Arc<dyn QueueStore>) -> Result<Self> {
        let mut restored = store.load_all()?;
        restored.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.temp_id.cmp(&b.temp_id))
        });

        let mut queue = Self {
            store,
            entries: BTreeMap::new(),
            last_enqueued_at: 0,
        };
        for entry in restored {
            queue.last_enqueued_at = queue.last_enqueued_at.max(entry.enqueued_at);
            queue
                .entries
                .entry(entry.conversation_id.clone())
                .or_default()
                .push(entry);
        }
        if queue.len() > 0 {
            info!("Restored {} queued message(s) from storage", queue.len());
        }
        Ok(queue)
    }

    /// Append a message. Enqueue times are strictly increasing so the restore
    /// order matches submission order.
    pub fn enqueue(&mut self, temp_id: &str, conversation_id: &str, text: &str) -> QueuedMessage {
        let enqueued_at = now_millis().max(self.last_enqueued_at + 1);
        self.last_enqueued_at = enqueued_at;
        let entry = QueuedMessage {
            temp_id: temp_id.to_string(),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            enqueued_at,
            attempt: 0,
        };
        if let Err(e) = self.store.put(&entry) {
            error!("Failed to persist queued message {}: {}", temp_id, e);
        }
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .push(entry.clone());
        entry
    }

    pub fn remove(&mut self, temp_id: &str) -> Option<QueuedMessage> {
        let mut removed = None;
        for entries in self.entries.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.temp_id == temp_id) {
                removed = Some(entries.remove(pos));
                break;
            }
        }
        self.entries.retain(|_, entries| !entries.is_empty());
        if removed.is_some() {
            if let Err(e) = self.store.delete(temp_id) {
                error!("Failed to delete queued message {}: {}", temp_id, e);
            }
        }
        removed
    }

    pub fn contains(&self, temp_id: &str) -> bool {
        self.entries.values().flatten().any(|e| e.temp_id == temp_id)
    }

    pub fn pending(&self, conversation_id: &str) -> Vec<QueuedMessage> {
        self.entries.get(conversation_id).cloned().unwrap_or_default()
    }

    pub fn conversations(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count one more transmission attempt, returning the new count.
    pub fn bump_attempt(&mut self, temp_id: &str) -> Option<u32> {
        let entry = self
            .entries
            .values_mut()
            .flatten()
            .find(|e| e.temp_id == temp_id)?;
        entry.attempt += 1;
        if let Err(e) = self.store.put(entry) {
            error!("Failed to persist attempt count of {}: {}", temp_id, e);
        }
        Some(entry.attempt)
    }
}

/// Queue entries become Queued messages again after a restart.
pub(crate) fn materialize_restored(
    queue: &OutboundQueue,
    tracker: &mut MessageStateTracker,
    own_user_id: &str,
) {
    for conversation_id in queue.conversations() {
        for entry in queue.pending(&conversation_id) {
            tracker.insert_local(Message {
                id: entry.temp_id.clone(),
                conversation_id: entry.conversation_id.clone(),
                sender_id: own_user_id.to_string(),
                text: entry.text.clone(),
                timestamp: entry.enqueued_at,
                state: MessageState::Queued,
                error: None,
            });
        }
    }
}

#[derive(Debug)]
enum OutboundCommand {
    /// Write one message that is already in `Sending`
    Transmit { temp_id: String, epoch: u64 },
    /// Replay the conversation's queue for this connection epoch
    Flush { epoch: u64 },
}

struct Worker {
    tx: mpsc::UnboundedSender<OutboundCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Dispatch {
    connected: bool,
    epoch: u64,
    workers: HashMap<String, Worker>,
}

pub struct SendPipeline {
    config: SyncConfig,
    user_id: String,
    transport: Arc<dyn Transport>,
    tracker: Arc<TokioMutex<MessageStateTracker>>,
    queue: TokioMutex<OutboundQueue>,
    feed: Arc<ConversationFeed>,
    conversations: Arc<ConversationDirectory>,
    events: mpsc::UnboundedSender<EngineEvent>,
    // Lock order: dispatch, then queue, then tracker
    dispatch: TokioMutex<Dispatch>,
    live_epoch: AtomicU64, // 0 while disconnected
    in_flight: Mutex<HashMap<String, u64>>, // temp id -> transmission token
    next_token: AtomicU64,
}

impl SendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SyncConfig,
        user_id: String,
        transport: Arc<dyn Transport>,
        tracker: Arc<TokioMutex<MessageStateTracker>>,
        queue: OutboundQueue,
        feed: Arc<ConversationFeed>,
        conversations: Arc<ConversationDirectory>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            user_id,
            transport,
            tracker,
            queue: TokioMutex::new(queue),
            feed,
            conversations,
            events,
            dispatch: TokioMutex::new(Dispatch::default()),
            live_epoch: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, message: &Message) {
        self.feed.publish(
            &message.conversation_id,
            ConversationUpdate::Message(message.clone()),
        );
    }

    pub async fn queued(&self) -> Vec<QueuedMessage> {
        let queue = self.queue.lock().await;
        queue
            .conversations()
            .iter()
            .flat_map(|c| queue.pending(c))
            .collect()
    }

    /// Submit a message. Returns its tempId without waiting on the network.
    pub async fn send(self: &Arc<Self>, conversation_id: &str, text: &str) -> Result<String> {
        validate_text(text, self.config.max_message_length)?;

        let temp_id = new_temp_id();
        let timestamp = now_millis();
        let mut message = Message {
            id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.user_id.clone(),
            text: text.to_string(),
            timestamp,
            state: MessageState::Queued,
            error: None,
        };

        let mut dispatch = self.dispatch.lock().await;
        if dispatch.connected {
            message.state = MessageState::Sending;
            {
                let mut tracker = self.tracker.lock().await;
                tracker.insert_local(message.clone());
                self.publish(&message);
            }
            let epoch = dispatch.epoch;
            self.command(
                &mut dispatch,
                conversation_id,
                OutboundCommand::Transmit {
                    temp_id: temp_id.clone(),
                    epoch,
                },
            );
        } else {
            let mut queue = self.queue.lock().await;
            queue.enqueue(&temp_id, conversation_id, text);
            let mut tracker = self.tracker.lock().await;
            tracker.insert_local(message.clone());
            self.publish(&message);
            info!("Offline, queued message {} for {}", temp_id, conversation_id);
        }
        drop(dispatch);

        self.conversations.touch(conversation_id, timestamp);
        Ok(temp_id)
    }

    /// Resubmit a failed message under its existing tempId and list position.
    pub async fn retry(self: &Arc<Self>, message_id: &str) -> Result<()> {
        let mut dispatch = self.dispatch.lock().await;
        let mut queue = self.queue.lock().await;
        let mut tracker = self.tracker.lock().await;

        let message = match tracker.lookup_by_temp_id(message_id) {
            Some(message) => message.clone(),
            None if tracker.get(message_id).is_some() => {
                return Err(SyncError::NotRetryable(message_id.to_string()))
            }
            None => return Err(SyncError::UnknownMessage(message_id.to_string())),
        };
        if !message.is_retryable() {
            return Err(SyncError::NotRetryable(message_id.to_string()));
        }

        let next = if dispatch.connected {
            MessageState::Sending
        } else {
            if !queue.contains(message_id) {
                queue.enqueue(message_id, &message.conversation_id, &message.text);
            }
            MessageState::Queued
        };
        if let TransitionOutcome::Applied(updated) =
            tracker.transition(message_id, next, None, Instant::now())?
        {
            self.publish(&updated);
        }
        drop(tracker);
        drop(queue);

        info!("Retrying message {} ({:?})", message_id, next);
        if next == MessageState::Sending {
            let epoch = dispatch.epoch;
            self.command(
                &mut dispatch,
                &message.conversation_id,
                OutboundCommand::Transmit {
                    temp_id: message_id.to_string(),
                    epoch,
                },
            );
        }
        Ok(())
    }

    /// Remove a message the user deleted, along with its queue entry.
    pub async fn delete(&self, message_id: &str) -> Result<Message> {
        let mut queue = self.queue.lock().await;
        let mut tracker = self.tracker.lock().await;
        let removed = tracker
            .remove(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        queue.remove(message_id);
        self.in_flight().remove(message_id);
        self.feed.publish(
            &removed.conversation_id,
            ConversationUpdate::Removed {
                id: message_id.to_string(),
            },
        );
        info!("Deleted message {}", message_id);
        Ok(removed)
    }

    /// Connection state as seen by the engine loop.
    pub(crate) async fn on_connection_change(self: &Arc<Self>, connected: bool, epoch: u64) {
        let mut dispatch = self.dispatch.lock().await;
        if connected {
            dispatch.connected = true;
            dispatch.epoch = epoch;
            self.live_epoch.store(epoch, Ordering::SeqCst);
            let conversations = self.queue.lock().await.conversations();
            if !conversations.is_empty() {
                info!("Flushing {} conversation queue(s) for epoch {}", conversations.len(), epoch);
            }
            for conversation_id in conversations {
                self.command(&mut dispatch, &conversation_id, OutboundCommand::Flush { epoch });
            }
            return;
        }

        let was_connected = dispatch.connected;
        dispatch.connected = false;
        self.live_epoch.store(0, Ordering::SeqCst);
        if was_connected {
            self.fail_in_flight("connection lost before acknowledgment").await;
        }
    }

    async fn fail_in_flight(&self, detail: &str) {
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        for message in tracker.in_state(MessageState::Sending) {
            if let Ok(TransitionOutcome::Applied(failed)) = tracker.transition(
                &message.id,
                MessageState::Failed,
                Some(MessageError::transport(detail)),
                now,
            ) {
                warn!("Message {} failed: {}", failed.id, detail);
                self.publish(&failed);
            }
        }
        self.in_flight().clear();
    }

    pub(crate) async fn on_ack(&self, temp_id: &str, message_id: &str, timestamp: u64) {
        let mut queue = self.queue.lock().await;
        let mut tracker = self.tracker.lock().await;
        self.in_flight().remove(temp_id);
        let now = Instant::now();

        // A late ack after a timeout or a dropped connection confirms an
        // implicit retry, which still has to pass through Sending.
        let resume = tracker
            .lookup_by_temp_id(temp_id)
            .map_or(false, |m| m.state == MessageState::Queued || m.is_retryable());
        if resume {
            if let Ok(TransitionOutcome::Applied(sending)) =
                tracker.transition(temp_id, MessageState::Sending, None, now)
            {
                info!("Late ack for {}, treating it as retried", temp_id);
                self.publish(&sending);
            }
        }

        match tracker.promote(temp_id, message_id, timestamp, now) {
            Ok(TransitionOutcome::Applied(message)) => {
                debug!("Message {} acknowledged as {}", temp_id, message_id);
                let conversation_id = message.conversation_id.clone();
                self.conversations.touch(&conversation_id, timestamp);
                self.feed.publish(
                    &conversation_id,
                    ConversationUpdate::Replaced {
                        temp_id: temp_id.to_string(),
                        message,
                    },
                );
            }
            Ok(_) => {}
            Err(e) => debug!("Ack for {} not applied: {}", temp_id, e),
        }
        queue.remove(temp_id);
    }

    pub(crate) async fn on_rejected(&self, temp_id: &str, reason: &str) {
        let rejection = SyncError::ServerRejection {
            temp_id: temp_id.to_string(),
            reason: reason.to_string(),
        };
        warn!("{}", rejection);
        self.in_flight().remove(temp_id);
        self.fail(temp_id, MessageError::rejected(reason)).await;
    }

    pub(crate) async fn on_ack_timeout(&self, temp_id: &str, token: u64) {
        {
            let mut in_flight = self.in_flight();
            if in_flight.get(temp_id) != Some(&token) {
                return;
            }
            in_flight.remove(temp_id);
        }
        warn!("No acknowledgment for {} within {:?}", temp_id, self.config.ack_timeout());
        self.fail(temp_id, MessageError::timeout("no acknowledgment from server"))
            .await;
    }

    async fn fail(&self, temp_id: &str, error: MessageError) {
        let mut tracker = self.tracker.lock().await;
        match tracker.transition(temp_id, MessageState::Failed, Some(error), Instant::now()) {
            Ok(TransitionOutcome::Applied(failed)) => self.publish(&failed),
            Ok(_) => {}
            Err(e) => debug!("Could not mark {} failed: {}", temp_id, e),
        }
    }

    fn command(self: &Arc<Self>, dispatch: &mut Dispatch, conversation_id: &str, command: OutboundCommand) {
        let command = match dispatch.workers.get(conversation_id) {
            Some(worker) => match worker.tx.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.clone().run_worker(conversation_id.to_string(), rx));
        let _ = tx.send(command);
        dispatch
            .workers
            .insert(conversation_id.to_string(), Worker { tx, task });
    }

    async fn run_worker(
        self: Arc<Self>,
        conversation_id: String,
        mut rx: mpsc::UnboundedReceiver<OutboundCommand>,
    ) {
        debug!("Outbound worker for {} started", conversation_id);
        let mut last_flushed_epoch = 0;
        while let Some(command) = rx.recv().await {
            match command {
                OutboundCommand::Transmit { temp_id, epoch } => {
                    self.transmit_pending(&temp_id, epoch).await;
                }
                OutboundCommand::Flush { epoch } => {
                    // One automatic attempt per reconnect
                    if epoch <= last_flushed_epoch {
                        continue;
                    }
                    last_flushed_epoch = epoch;
                    self.flush(&conversation_id, epoch).await;
                }
            }
        }
        debug!("Outbound worker for {} stopped", conversation_id);
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.live_epoch.load(Ordering::SeqCst) == epoch
    }

    async fn transmit_pending(&self, temp_id: &str, epoch: u64) {
        if !self.is_live(epoch) {
            debug!("Skipping transmit of {}, connection epoch {} is gone", temp_id, epoch);
            return;
        }
        let frame = {
            let mut queue = self.queue.lock().await;
            let tracker = self.tracker.lock().await;
            let Some(message) = tracker.lookup_by_temp_id(temp_id) else {
                return;
            };
            if message.state != MessageState::Sending {
                return;
            }
            OutboundFrame {
                temp_id: temp_id.to_string(),
                conversation_id: message.conversation_id.clone(),
                text: message.text.clone(),
                attempt: queue.bump_attempt(temp_id).unwrap_or(1),
            }
        };
        self.write(frame).await;
    }

    /// Replay queued messages of one conversation in submission order. Stops at
    /// the first sign the connection is gone; the next epoch resumes from the
    /// first entry that is still unconfirmed.
    async fn flush(&self, conversation_id: &str, epoch: u64) {
        let entries = self.queue.lock().await.pending(conversation_id);
        debug!("Flushing {} entries of {}", entries.len(), conversation_id);

        for entry in entries {
            if !self.is_live(epoch) {
                info!("Flush of {} interrupted, connection gone", conversation_id);
                return;
            }

            let frame = {
                let mut queue = self.queue.lock().await;
                let mut tracker = self.tracker.lock().await;
                if !queue.contains(&entry.temp_id) {
                    continue;
                }
                let Some(message) = tracker.lookup_by_temp_id(&entry.temp_id).cloned() else {
                    // Confirmed while we were busy
                    queue.remove(&entry.temp_id);
                    continue;
                };
                match message.state {
                    MessageState::Queued => {}
                    MessageState::Failed if message.is_retryable() => {}
                    MessageState::Failed => {
                        debug!("Not replaying rejected message {}", message.id);
                        continue;
                    }
                    // Already written on this connection
                    MessageState::Sending => continue,
                    _ => {
                        queue.remove(&entry.temp_id);
                        continue;
                    }
                }
                match tracker.transition(&message.id, MessageState::Sending, None, Instant::now()) {
                    Ok(TransitionOutcome::Applied(sending)) => self.publish(&sending),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Cannot replay {}: {}", message.id, e);
                        continue;
                    }
                }
                OutboundFrame {
                    temp_id: message.id.clone(),
                    conversation_id: message.conversation_id.clone(),
                    text: message.text.clone(),
                    attempt: queue.bump_attempt(&message.id).unwrap_or(1),
                }
            };

            if !self.write(frame).await {
                info!("Flush of {} stopped after a transport error", conversation_id);
                return;
            }
        }
    }

    /// Hand a frame to the transport and arm its ack timeout.
    async fn write(&self, frame: OutboundFrame) -> bool {
        let temp_id = frame.temp_id.clone();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.in_flight().insert(temp_id.clone(), token);

        match self.transport.transmit(frame).await {
            Ok(()) => {
                let events = self.events.clone();
                let timeout = self.config.ack_timeout();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = events.send(EngineEvent::AckTimeout { temp_id, token });
                });
                true
            }
            Err(e) => {
                error!("Failed to transmit {}: {}", temp_id, e);
                {
                    let mut in_flight = self.in_flight();
                    if in_flight.get(&temp_id) == Some(&token) {
                        in_flight.remove(&temp_id);
                    }
                }
                self.fail(&temp_id, MessageError::transport(e.to_string())).await;
                false
            }
        }
    }

    pub(crate) async fn shutdown(&self) {
        let mut dispatch = self.dispatch.lock().await;
        for (conversation_id, worker) in dispatch.workers.drain() {
            worker.task.abort();
            debug!("Stopped outbound worker for {}", conversation_id);
        }
        dispatch.connected = false;
        self.live_epoch.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_validate_text() {
        assert_eq!(validate_text("", 10), Err(ValidationError::Empty));
        assert_eq!(validate_text("   \n", 10), Err(ValidationError::Empty));
        assert_eq!(
            validate_text("abcdefghijk", 10),
            Err(ValidationError::TooLong { len: 11, max: 10 })
        );
        // limit is in characters, not bytes
        assert!(validate_text("ééééé", 5).is_ok());
    }

    #[test]
    fn test_queue_order_survives_restore() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        {
            let mut queue = OutboundQueue::restore(store.clone()).unwrap();
            queue.enqueue("tmp-3", "c1", "first");
            queue.enqueue("tmp-1", "c1", "second");
            queue.enqueue("tmp-2", "c2", "other");
            queue.enqueue("tmp-0", "c1", "third");
            assert_eq!(queue.bump_attempt("tmp-1"), Some(1));
        }

        let queue = OutboundQueue::restore(store).unwrap();
        let texts: Vec<String> = queue.pending("c1").into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(queue.pending("c1")[1].attempt, 1);
        assert_eq!(queue.conversations(), vec!["c1", "c2"]);
    }

    #[test]
    fn test_remove_deletes_from_store() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = OutboundQueue::restore(store.clone()).unwrap();
        queue.enqueue("tmp-1", "c1", "hello");
        assert!(queue.contains("tmp-1"));
        assert!(queue.remove("tmp-1").is_some());
        assert!(queue.is_empty());
        assert!(store.load_all().unwrap().is_empty());
        assert!(queue.conversations().is_empty());
    }

    #[test]
    fn test_materialize_restored_messages_are_queued() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let mut queue = OutboundQueue::restore(store).unwrap();
        queue.enqueue("tmp-1", "c1", "hello");
        let mut tracker = MessageStateTracker::new(std::time::Duration::from_secs(1));
        materialize_restored(&queue, &mut tracker, "me");
        let message = tracker.lookup_by_temp_id("tmp-1").unwrap();
        assert_eq!(message.state, MessageState::Queued);
        assert_eq!(message.sender_id, "me");
    }
}
