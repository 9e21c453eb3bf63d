// Sync engine
// Wires the components together around a single event loop. Transport events,
// connection changes and timer expirations all arrive on one channel and are
// handled one at a time, in arrival order.

pub mod connection;
pub mod feed;
pub mod outbound;
pub mod presence;
pub mod receipts;
pub mod router;
pub mod tracker;
pub mod typing;

use async_trait::async_trait;
use futures::Stream;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use self::connection::{ConnectionManager, ConnectionStatus};
use self::feed::{ConversationFeed, ConversationStream};
use self::outbound::{materialize_restored, OutboundQueue, SendPipeline};
use self::presence::PresenceCache;
use self::receipts::ReadReceiptBatcher;
use self::router::{EventHandler, EventRouter, Subscription};
use self::tracker::{MessageStateTracker, TransitionOutcome};
use self::typing::TypingCoordinator;
use crate::auth::AuthProvider;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{
    Conversation, ConnectionState, ConversationUpdate, Message, MessageState, PresenceRecord,
    QueuedMessage, TypingState,
};
use crate::store::QueueStore;
use crate::transport::{EventKind, InboundEvent, Transport, TransportEvent};

/// Everything the engine loop reacts to
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Transport { epoch: u64, event: TransportEvent },
    Connection(ConnectionStatus),
    AckTimeout { temp_id: String, token: u64 },
    /// Buffered receipts may have outlived their grace window
    ExpireReceipts,
}

/// Known conversations and their participants
#[derive(Default)]
pub struct ConversationDirectory {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl ConversationDirectory {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, conversation: Conversation) {
        let mut conversations = self.lock();
        match conversations.get_mut(&conversation.id) {
            Some(existing) => {
                existing.participant_ids = conversation.participant_ids;
                existing.last_activity = existing.last_activity.max(conversation.last_activity);
            }
            None => {
                conversations.insert(conversation.id.clone(), conversation);
            }
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock().get(conversation_id).cloned()
    }

    /// Most recently active first.
    pub fn all(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn touch(&self, conversation_id: &str, timestamp: u64) {
        let mut conversations = self.lock();
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                id: conversation_id.to_string(),
                participant_ids: Vec::new(),
                last_activity: 0,
            });
        conversation.last_activity = conversation.last_activity.max(timestamp);
    }

    pub fn conversations_with(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|c| c.participant_ids.iter().any(|p| p == user_id))
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn participants(&self) -> BTreeSet<String> {
        self.lock()
            .values()
            .flat_map(|c| c.participant_ids.iter().cloned())
            .collect()
    }
}

/// Applies pushed messages and receipts to the tracker.
struct TrackerHandler {
    own_user_id: String,
    tracker: Arc<TokioMutex<MessageStateTracker>>,
    feed: Arc<ConversationFeed>,
    conversations: Arc<ConversationDirectory>,
    events: mpsc::UnboundedSender<EngineEvent>,
    grace: Duration,
}

impl TrackerHandler {
    fn schedule_expiry(&self) {
        let events = self.events.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(EngineEvent::ExpireReceipts);
        });
    }

    async fn apply_receipts(&self, conversation_id: &str, ids: &[String], state: MessageState) {
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        let mut buffered = false;
        for id in ids {
            match tracker.transition(id, state, None, now) {
                Ok(TransitionOutcome::Applied(message)) => {
                    self.feed
                        .publish(conversation_id, ConversationUpdate::Message(message));
                }
                Ok(TransitionOutcome::Buffered) => buffered = true,
                Ok(TransitionOutcome::Ignored) => {}
                Err(e) => debug!("{:?} receipt for {} not applied: {}", state, id, e),
            }
        }
        if buffered {
            self.schedule_expiry();
        }
    }
}

#[async_trait]
impl EventHandler for TrackerHandler {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        match event {
            InboundEvent::NewMessage(message) => {
                let mut message = message.clone();
                // Reaching this device is delivery
                if message.sender_id != self.own_user_id && !message.state.is_receipt() {
                    message.state = MessageState::Delivered;
                }
                let timestamp = message.timestamp;
                let conversation_id = message.conversation_id.clone();
                {
                    let mut tracker = self.tracker.lock().await;
                    if let Some(updated) = tracker.upsert(message, Instant::now()) {
                        self.feed
                            .publish(&conversation_id, ConversationUpdate::Message(updated));
                    }
                }
                self.conversations.touch(&conversation_id, timestamp);
            }
            InboundEvent::DeliveryReceipt {
                conversation_id,
                message_ids,
            } => {
                self.apply_receipts(conversation_id, message_ids, MessageState::Delivered)
                    .await;
            }
            InboundEvent::ReadReceiptBatch {
                conversation_id,
                reader_id,
                message_ids,
            } => {
                debug!("{} read {} message(s) in {}", reader_id, message_ids.len(), conversation_id);
                self.apply_receipts(conversation_id, message_ids, MessageState::Read)
                    .await;
            }
            other => anyhow::bail!("unexpected {:?} event", other.kind()),
        }
        Ok(())
    }
}

/// Client-side conversation sync engine
pub struct SyncEngine {
    user_id: String,
    connection: Arc<ConnectionManager>,
    outbound: Arc<SendPipeline>,
    tracker: Arc<TokioMutex<MessageStateTracker>>,
    router: Arc<EventRouter>,
    feed: Arc<ConversationFeed>,
    conversations: Arc<ConversationDirectory>,
    typing: Arc<TypingCoordinator>,
    receipts: Arc<ReadReceiptBatcher>,
    presence: Arc<PresenceCache>,
    subscriptions: Mutex<Vec<Subscription>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncEngine {
    /// Build the engine and start its event loop. Anything a previous process
    /// left in `store` comes back as Queued and is flushed on the first
    /// connection. Must be called inside a tokio runtime.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self> {
        let user_id = auth.user_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let queue = OutboundQueue::restore(store)?;
        let mut tracker = MessageStateTracker::new(config.receipt_grace());
        materialize_restored(&queue, &mut tracker, &user_id);
        let tracker = Arc::new(TokioMutex::new(tracker));

        let feed = ConversationFeed::new();
        let conversations = Arc::new(ConversationDirectory::default());
        for entry in queue.conversations() {
            if let Some(last) = queue.pending(&entry).last() {
                conversations.touch(&entry, last.enqueued_at);
            }
        }
        let router = EventRouter::new();

        let connection = ConnectionManager::new(
            transport.clone(),
            auth,
            config.backoff.clone(),
            events_tx.clone(),
        );
        let outbound = SendPipeline::new(
            config.clone(),
            user_id.clone(),
            transport.clone(),
            tracker.clone(),
            queue,
            feed.clone(),
            conversations.clone(),
            events_tx.clone(),
        );
        let typing = Arc::new(TypingCoordinator::new(
            user_id.clone(),
            transport.clone(),
            feed.clone(),
            config.typing_debounce(),
            config.typing_timeout(),
        ));
        let receipts = Arc::new(ReadReceiptBatcher::new(
            user_id.clone(),
            transport.clone(),
            tracker.clone(),
            feed.clone(),
            config.read_batch_window(),
        ));
        let presence = Arc::new(PresenceCache::new(
            transport,
            feed.clone(),
            conversations.clone(),
            config.presence_ttl(),
        ));

        let tracker_handler: Arc<dyn EventHandler> = Arc::new(TrackerHandler {
            own_user_id: user_id.clone(),
            tracker: tracker.clone(),
            feed: feed.clone(),
            conversations: conversations.clone(),
            events: events_tx,
            grace: config.receipt_grace(),
        });
        let subscriptions = vec![
            router.subscribe(EventKind::NewMessage, None, tracker_handler.clone()),
            router.subscribe(EventKind::DeliveryReceipt, None, tracker_handler.clone()),
            router.subscribe(EventKind::ReadReceiptBatch, None, tracker_handler),
            router.subscribe(EventKind::TypingChanged, None, typing.clone()),
            router.subscribe(EventKind::PresenceChanged, None, presence.clone()),
        ];

        let event_loop = tokio::spawn(run_event_loop(
            events_rx,
            outbound.clone(),
            router.clone(),
            presence.clone(),
            tracker.clone(),
        ));
        info!("Sync engine started for {}", user_id);

        Ok(Self {
            user_id,
            connection,
            outbound,
            tracker,
            router,
            feed,
            conversations,
            typing,
            receipts,
            presence,
            subscriptions: Mutex::new(subscriptions),
            event_loop: Mutex::new(Some(event_loop)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Submit a message and return its tempId. Never waits on the network.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<String> {
        self.ensure_open()?;
        self.outbound.send(conversation_id, text).await
    }

    pub async fn retry(&self, message_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.outbound.retry(message_id).await
    }

    pub async fn delete(&self, message_id: &str) -> Result<Message> {
        self.ensure_open()?;
        self.outbound.delete(message_id).await
    }

    pub fn mark_read(&self, conversation_id: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.receipts.mark_read(conversation_id);
    }

    pub fn on_local_input(&self, conversation_id: &str, text: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.typing.on_local_input(conversation_id, text);
    }

    pub fn subscribe_to_conversation(&self, conversation_id: &str) -> ConversationStream {
        self.feed.subscribe(conversation_id)
    }

    /// Stop every timer of the conversation and end its update streams.
    pub fn close_conversation(&self, conversation_id: &str) {
        self.typing.dispose(conversation_id);
        self.receipts.dispose(conversation_id);
        self.feed.close(conversation_id);
        debug!("Closed conversation {}", conversation_id);
    }

    pub fn register_conversation(&self, conversation: Conversation) {
        self.conversations.register(conversation);
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.all()
    }

    /// Messages of a conversation in list order.
    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.tracker.lock().await.conversation_messages(conversation_id)
    }

    /// Look a message up by its current id.
    pub async fn message(&self, message_id: &str) -> Option<Message> {
        self.tracker.lock().await.get(message_id).cloned()
    }

    /// Unconfirmed messages still in the durable queue.
    pub async fn queued(&self) -> Vec<QueuedMessage> {
        self.outbound.queued().await
    }

    pub fn remote_typers(&self, conversation_id: &str) -> Vec<TypingState> {
        self.typing.remote_typers(conversation_id)
    }

    pub async fn get_online_status(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, PresenceRecord>> {
        Ok(self.presence.get_online_status(user_ids).await?)
    }

    /// Register an extra handler for pushed events.
    pub fn on_event(
        &self,
        kind: EventKind,
        conversation_id: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        self.router.subscribe(kind, conversation_id, handler)
    }

    pub async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.connection.connect().await;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Current connection state followed by every change.
    pub fn connection_states(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        self.connection.state_changes()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Disconnect and stop every task the engine owns. Queued messages stay in
    /// the store for the next start.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down sync engine");
        self.connection.disconnect().await;
        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = event_loop {
            handle.abort();
        }
        self.outbound.shutdown().await;
        self.typing.shutdown();
        self.receipts.shutdown();
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.feed.close_all();
    }
}

async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    outbound: Arc<SendPipeline>,
    router: Arc<EventRouter>,
    presence: Arc<PresenceCache>,
    tracker: Arc<TokioMutex<MessageStateTracker>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Connection(status) => match status.state {
                ConnectionState::Connected => {
                    outbound.on_connection_change(true, status.epoch).await;
                    let presence = presence.clone();
                    tokio::spawn(async move {
                        if let Err(e) = presence.refresh_all().await {
                            warn!("Presence refresh after reconnect failed: {}", e);
                        }
                    });
                }
                ConnectionState::Disconnected => {
                    outbound.on_connection_change(false, status.epoch).await;
                }
                ConnectionState::Connecting => {}
            },
            EngineEvent::Transport { epoch, event } => match event {
                TransportEvent::Ack {
                    temp_id,
                    message_id,
                    timestamp,
                    ..
                } => outbound.on_ack(&temp_id, &message_id, timestamp).await,
                TransportEvent::Rejected { temp_id, reason } => {
                    outbound.on_rejected(&temp_id, &reason).await
                }
                TransportEvent::Inbound(inbound) => {
                    if router.dispatch(&inbound).await == 0 {
                        debug!("No handler took {:?} (epoch {})", inbound.kind(), epoch);
                    }
                }
                TransportEvent::Closed { reason } => {
                    debug!("Transport closed (epoch {}): {}", epoch, reason)
                }
            },
            EngineEvent::AckTimeout { temp_id, token } => {
                outbound.on_ack_timeout(&temp_id, token).await
            }
            EngineEvent::ExpireReceipts => {
                let expired = tracker.lock().await.expire_buffered(Instant::now());
                if !expired.is_empty() {
                    debug!("Expired {} buffered receipt(s)", expired.len());
                }
            }
        }
    }
    debug!("Engine event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: &str, participants: &[&str], last_activity: u64) -> Conversation {
        Conversation {
            id: id.to_string(),
            participant_ids: participants.iter().map(|p| p.to_string()).collect(),
            last_activity,
        }
    }

    #[test]
    fn test_directory_lookup_by_participant() {
        let directory = ConversationDirectory::default();
        directory.register(conversation("c1", &["me", "alice"], 10));
        directory.register(conversation("c2", &["me", "bob"], 20));
        directory.register(conversation("c3", &["alice", "bob"], 5));

        assert_eq!(directory.conversations_with("alice"), vec!["c1", "c3"]);
        assert_eq!(
            directory.participants().into_iter().collect::<Vec<_>>(),
            vec!["alice", "bob", "me"]
        );
    }

    #[test]
    fn test_directory_touch_orders_by_activity() {
        let directory = ConversationDirectory::default();
        directory.register(conversation("c1", &["me"], 10));
        directory.register(conversation("c2", &["me"], 20));
        directory.touch("c1", 30);
        // never moves backwards
        directory.touch("c2", 1);
        directory.touch("c9", 25);

        let order: Vec<String> = directory.all().into_iter().map(|c| c.id).collect();
        assert_eq!(order, vec!["c1", "c9", "c2"]);
        assert_eq!(directory.get("c2").unwrap().last_activity, 20);
        assert!(directory.get("c9").unwrap().participant_ids.is_empty());
    }
}
