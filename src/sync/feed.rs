// Per-conversation update streams handed to the presentation layer

use futures::Stream;
use log::debug;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::models::ConversationUpdate;

type Senders = HashMap<String, Vec<(u64, mpsc::UnboundedSender<ConversationUpdate>)>>;

#[derive(Default)]
pub struct ConversationFeed {
    subscribers: Mutex<Senders>,
    next_id: AtomicU64,
}

impl ConversationFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribers(&self) -> MutexGuard<'_, Senders> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(self: &Arc<Self>, conversation_id: &str) -> ConversationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers()
            .entry(conversation_id.to_string())
            .or_default()
            .push((id, tx));
        ConversationStream {
            id,
            conversation_id: conversation_id.to_string(),
            rx,
            feed: Arc::downgrade(self),
        }
    }

    /// Send `update` to every live subscriber of the conversation, pruning
    /// subscribers whose stream is gone.
    pub fn publish(&self, conversation_id: &str, update: ConversationUpdate) {
        let mut subscribers = self.subscribers();
        let Some(senders) = subscribers.get_mut(conversation_id) else {
            return;
        };
        senders.retain(|(_, tx)| tx.send(update.clone()).is_ok());
        if senders.is_empty() {
            subscribers.remove(conversation_id);
        }
    }

    /// End every stream of the conversation.
    pub fn close(&self, conversation_id: &str) {
        if let Some(senders) = self.subscribers().remove(conversation_id) {
            debug!("Closed {} stream(s) of {}", senders.len(), conversation_id);
        }
    }

    pub fn close_all(&self) {
        self.subscribers().clear();
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers().get(conversation_id).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, conversation_id: &str, id: u64) {
        let mut subscribers = self.subscribers();
        if let Some(senders) = subscribers.get_mut(conversation_id) {
            senders.retain(|(sid, _)| *sid != id);
            if senders.is_empty() {
                subscribers.remove(conversation_id);
            }
        }
    }
}

/// Stream of updates for one conversation; dropping it unsubscribes.
pub struct ConversationStream {
    id: u64,
    conversation_id: String,
    rx: mpsc::UnboundedReceiver<ConversationUpdate>,
    feed: Weak<ConversationFeed>,
}

impl ConversationStream {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<ConversationUpdate> {
        self.rx.recv().await
    }

    /// Next update if one is already waiting.
    pub fn try_recv(&mut self) -> Option<ConversationUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ConversationStream {
    type Item = ConversationUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ConversationStream {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.unsubscribe(&self.conversation_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TypingState;

    fn typing(user: &str) -> ConversationUpdate {
        ConversationUpdate::Typing(TypingState {
            conversation_id: "c1".to_string(),
            user_id: user.to_string(),
            is_typing: true,
            expires_at: None,
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_only_that_conversation() {
        let feed = ConversationFeed::new();
        let mut c1 = feed.subscribe("c1");
        let mut c2 = feed.subscribe("c2");

        feed.publish("c1", typing("u1"));
        assert_eq!(c1.recv().await, Some(typing("u1")));
        assert!(c2.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_and_close() {
        let feed = ConversationFeed::new();
        let first = feed.subscribe("c1");
        let mut second = feed.subscribe("c1");
        assert_eq!(feed.subscriber_count("c1"), 2);

        drop(first);
        assert_eq!(feed.subscriber_count("c1"), 1);

        feed.close("c1");
        assert_eq!(second.recv().await, None);
        assert_eq!(feed.subscriber_count("c1"), 0);
    }
}
