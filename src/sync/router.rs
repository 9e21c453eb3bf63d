// Inbound Event Router
// Fans server-pushed events out to handlers registered per event kind and,
// optionally, per conversation. Dispatch is sequential, so handlers see the
// events of a conversation in transport-arrival order.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::transport::{EventKind, InboundEvent};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()>;
}

struct Registration {
    id: u64,
    kind: EventKind,
    conversation_id: Option<String>,
    handler: Arc<dyn EventHandler>,
}

impl Registration {
    fn matches(&self, event: &InboundEvent) -> bool {
        if self.kind != event.kind() {
            return false;
        }
        match &self.conversation_id {
            None => true,
            Some(wanted) => event.conversation_id() == Some(wanted.as_str()),
        }
    }
}

#[derive(Default)]
pub struct EventRouter {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

/// Handle returned by [`EventRouter::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes the handler"]
pub struct Subscription {
    id: u64,
    router: Weak<EventRouter>,
}

impl Subscription {
    pub fn cancel(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id);
        }
    }
}

impl EventRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for events of `kind`, for one conversation or for all
    /// of them when `conversation_id` is `None`.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: EventKind,
        conversation_id: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            kind,
            conversation_id: conversation_id.map(str::to_string),
            handler,
        };
        self.registrations
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(registration);
        debug!("Router subscription {} for {:?} ({:?})", id, kind, conversation_id);
        Subscription {
            id,
            router: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.registrations
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|r| r.id != id);
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Deliver `event` to every matching handler. Returns how many handled it
    /// without error.
    pub async fn dispatch(&self, event: &InboundEvent) -> usize {
        let handlers: Vec<(u64, Arc<dyn EventHandler>)> = self
            .registrations
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.matches(event))
            .map(|r| (r.id, r.handler.clone()))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match handler.handle(event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Handler {} failed on {:?}: {}", id, event.kind(), e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
            if let InboundEvent::TypingChanged { user_id, .. } = event {
                self.seen.lock().unwrap().push(user_id.clone());
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &InboundEvent) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    fn typing(conversation: &str, user: &str) -> InboundEvent {
        InboundEvent::TypingChanged {
            conversation_id: conversation.to_string(),
            user_id: user.to_string(),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn test_routes_by_kind_and_conversation() {
        let router = EventRouter::new();
        let all = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let only_c1 = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let _a = router.subscribe(EventKind::TypingChanged, None, all.clone());
        let _b = router.subscribe(EventKind::TypingChanged, Some("c1"), only_c1.clone());
        let _c = router.subscribe(EventKind::NewMessage, None, Arc::new(Failing));

        router.dispatch(&typing("c1", "u1")).await;
        router.dispatch(&typing("c2", "u2")).await;
        router.dispatch(&typing("c1", "u3")).await;

        assert_eq!(*all.seen.lock().unwrap(), vec!["u1", "u2", "u3"]);
        assert_eq!(*only_c1.seen.lock().unwrap(), vec!["u1", "u3"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let router = EventRouter::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let _f = router.subscribe(EventKind::TypingChanged, None, Arc::new(Failing));
        let _r = router.subscribe(EventKind::TypingChanged, None, recorder.clone());

        assert_eq!(router.dispatch(&typing("c1", "u1")).await, 1);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let router = EventRouter::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let sub = router.subscribe(EventKind::TypingChanged, None, recorder.clone());
        assert_eq!(router.handler_count(), 1);
        sub.cancel();
        assert_eq!(router.handler_count(), 0);
        assert_eq!(router.dispatch(&typing("c1", "u1")).await, 0);
    }
}
