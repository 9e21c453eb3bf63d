// Read-Receipt Batcher
// `mark_read` is cheap to call on every inbound message: the first call opens a
// window, later calls inside it are absorbed, and when it closes a single
// request covers everything that is unread at that moment.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::feed::ConversationFeed;
use super::tracker::{MessageStateTracker, TransitionOutcome};
use crate::models::{ConversationUpdate, MessageId, MessageState};
use crate::transport::Transport;

struct Inner {
    own_user_id: String,
    transport: Arc<dyn Transport>,
    tracker: Arc<TokioMutex<MessageStateTracker>>,
    feed: Arc<ConversationFeed>,
    window: Duration,
    windows: Mutex<HashMap<String, JoinHandle<()>>>,
    // Ids of a request that has not finished yet, so an overlapping batch skips them
    in_flight: Mutex<HashMap<String, HashSet<MessageId>>>,
}

impl Inner {
    fn windows(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.windows.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, HashSet<MessageId>>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(&self, conversation_id: &str, ids: &[MessageId]) {
        let mut in_flight = self.in_flight();
        if let Some(pending) = in_flight.get_mut(conversation_id) {
            for id in ids {
                pending.remove(id);
            }
            if pending.is_empty() {
                in_flight.remove(conversation_id);
            }
        }
    }

    async fn send_batch(&self, conversation_id: &str) {
        let unread = {
            let tracker = self.tracker.lock().await;
            tracker.unread_inbound(conversation_id, &self.own_user_id)
        };
        let ids: Vec<MessageId> = {
            let mut in_flight = self.in_flight();
            let pending = in_flight.entry(conversation_id.to_string()).or_default();
            let ids: Vec<MessageId> = unread
                .into_iter()
                .filter(|id| !pending.contains(id))
                .collect();
            pending.extend(ids.iter().cloned());
            if pending.is_empty() {
                in_flight.remove(conversation_id);
            }
            ids
        };
        if ids.is_empty() {
            debug!("Read batch for {} suppressed, nothing new", conversation_id);
            return;
        }

        if let Err(e) = self.transport.mark_read(conversation_id, &ids).await {
            warn!("Failed to mark {} message(s) read in {}: {}", ids.len(), conversation_id, e);
            self.release(conversation_id, &ids);
            return;
        }
        info!("Marked {} message(s) read in {}", ids.len(), conversation_id);

        {
            let mut tracker = self.tracker.lock().await;
            let now = Instant::now();
            for id in &ids {
                if let Ok(TransitionOutcome::Applied(message)) =
                    tracker.transition(id, MessageState::Read, None, now)
                {
                    self.feed
                        .publish(conversation_id, ConversationUpdate::Message(message));
                }
            }
        }
        // Read now, so unread_inbound no longer lists them
        self.release(conversation_id, &ids);
    }
}

pub struct ReadReceiptBatcher {
    inner: Arc<Inner>,
}

impl ReadReceiptBatcher {
    pub fn new(
        own_user_id: String,
        transport: Arc<dyn Transport>,
        tracker: Arc<TokioMutex<MessageStateTracker>>,
        feed: Arc<ConversationFeed>,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                own_user_id,
                transport,
                tracker,
                feed,
                window,
                windows: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn mark_read(&self, conversation_id: &str) {
        let mut windows = self.inner.windows();
        if windows.contains_key(conversation_id) {
            return;
        }

        let inner = self.inner.clone();
        let conversation = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            // Close the window first so calls during the request open a new one
            inner.windows().remove(&conversation);
            inner.send_batch(&conversation).await;
        });
        windows.insert(conversation_id.to_string(), handle);
    }

    pub fn has_open_window(&self, conversation_id: &str) -> bool {
        self.inner.windows().contains_key(conversation_id)
    }

    pub fn dispose(&self, conversation_id: &str) {
        if let Some(handle) = self.inner.windows().remove(conversation_id) {
            handle.abort();
        }
        self.inner.in_flight().remove(conversation_id);
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.inner.windows().drain() {
            handle.abort();
        }
        self.inner.in_flight().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::transport::LoopbackTransport;

    fn delivered(id: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c".to_string(),
            sender_id: "bob".to_string(),
            text: format!("text of {}", id),
            timestamp: 1,
            state: MessageState::Delivered,
            error: None,
        }
    }

    async fn setup(ids: &[&str]) -> (ReadReceiptBatcher, Arc<LoopbackTransport>, Arc<TokioMutex<MessageStateTracker>>) {
        let server = Arc::new(LoopbackTransport::new());
        let tracker = Arc::new(TokioMutex::new(MessageStateTracker::new(Duration::from_secs(5))));
        {
            let mut tracker = tracker.lock().await;
            for id in ids {
                tracker.upsert(delivered(id), Instant::now());
            }
        }
        let batcher = ReadReceiptBatcher::new(
            "me".to_string(),
            server.clone(),
            tracker.clone(),
            ConversationFeed::new(),
            Duration::from_millis(500),
        );
        (batcher, server, tracker)
    }

    async fn state_of(tracker: &TokioMutex<MessageStateTracker>, id: &str) -> Option<MessageState> {
        tracker.lock().await.get(id).map(|m| m.state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_within_a_window_share_one_request() {
        let (batcher, server, tracker) = setup(&["m1", "m2"]).await;
        let _events = server.open("token").await.unwrap();

        batcher.mark_read("c");
        tokio::time::sleep(Duration::from_millis(200)).await;
        batcher.mark_read("c");
        assert!(batcher.has_open_window("c"));
        assert!(server.read_calls().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!batcher.has_open_window("c"));
        assert_eq!(
            server.read_calls(),
            vec![("c".to_string(), vec!["m1".to_string(), "m2".to_string()])]
        );
        assert_eq!(state_of(&tracker, "m2").await, Some(MessageState::Read));
        assert!(batcher.inner.in_flight().is_empty());

        // everything is read already
        batcher.mark_read("c");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.read_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_is_sent_again_later() {
        let (batcher, server, tracker) = setup(&["m1"]).await;

        // not connected, the request fails
        batcher.mark_read("c");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.read_calls().is_empty());
        assert_eq!(state_of(&tracker, "m1").await, Some(MessageState::Delivered));
        assert!(batcher.inner.in_flight().is_empty());

        let _events = server.open("token").await.unwrap();
        batcher.mark_read("c");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.read_calls(), vec![("c".to_string(), vec!["m1".to_string()])]);
        assert_eq!(state_of(&tracker, "m1").await, Some(MessageState::Read));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_ids_are_skipped() {
        let (batcher, server, _tracker) = setup(&["m1", "m2"]).await;
        let _events = server.open("token").await.unwrap();
        batcher
            .inner
            .in_flight()
            .entry("c".to_string())
            .or_default()
            .insert("m1".to_string());

        batcher.inner.send_batch("c").await;
        assert_eq!(server.read_calls(), vec![("c".to_string(), vec!["m2".to_string()])]);
        assert_eq!(batcher.inner.in_flight()["c"].len(), 1);

        batcher.dispose("c");
        assert!(batcher.inner.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_the_window() {
        let (batcher, server, tracker) = setup(&["m1"]).await;
        let _events = server.open("token").await.unwrap();

        batcher.mark_read("c");
        batcher.dispose("c");
        assert!(!batcher.has_open_window("c"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(server.read_calls().is_empty());
        assert_eq!(state_of(&tracker, "m1").await, Some(MessageState::Delivered));
    }
}
