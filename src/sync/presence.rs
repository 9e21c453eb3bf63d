// Presence Cache
// Online/offline status of conversation participants. Refreshed only on demand
// (stale reads) or on reconnect, and patched in place by pushed presence
// events. Nothing polls.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;

use super::feed::ConversationFeed;
use super::router::EventHandler;
use super::ConversationDirectory;
use crate::models::{ConversationUpdate, PresenceRecord};
use crate::transport::{InboundEvent, Transport, TransportError};

struct CachedPresence {
    record: PresenceRecord,
    refreshed: Instant,
}

pub struct PresenceCache {
    transport: Arc<dyn Transport>,
    feed: Arc<ConversationFeed>,
    conversations: Arc<ConversationDirectory>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedPresence>>,
    refresh: TokioMutex<()>,
}

impl PresenceCache {
    pub fn new(
        transport: Arc<dyn Transport>,
        feed: Arc<ConversationFeed>,
        conversations: Arc<ConversationDirectory>,
        ttl: Duration,
    ) -> Self {
        Self {
            transport,
            feed,
            conversations,
            ttl,
            entries: Mutex::new(HashMap::new()),
            refresh: TokioMutex::new(()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedPresence>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn cached(&self, user_id: &str) -> Option<PresenceRecord> {
        self.entries().get(user_id).map(|c| c.record.clone())
    }

    /// Presence for `user_ids`, with at most one bulk fetch for whatever is
    /// missing or older than the TTL.
    pub async fn get_online_status(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, PresenceRecord>, TransportError> {
        let _refresh = self.refresh.lock().await;

        let now = Instant::now();
        let stale: Vec<String> = {
            let entries = self.entries();
            user_ids
                .iter()
                .filter(|id| {
                    entries
                        .get(id.as_str())
                        .map_or(true, |c| now.duration_since(c.refreshed) >= self.ttl)
                })
                .cloned()
                .collect::<BTreeSet<String>>()
                .into_iter()
                .collect()
        };

        if !stale.is_empty() {
            debug!("Refreshing presence of {} user(s)", stale.len());
            match self.transport.fetch_presence(&stale).await {
                Ok(records) => self.store(records, Instant::now(), false),
                Err(e) => {
                    let entries = self.entries();
                    if stale.iter().any(|id| !entries.contains_key(id)) {
                        return Err(e);
                    }
                    warn!("Presence refresh failed, serving stale entries: {}", e);
                }
            }
        }

        let entries = self.entries();
        Ok(user_ids
            .iter()
            .filter_map(|id| entries.get(id).map(|c| (id.clone(), c.record.clone())))
            .collect())
    }

    /// Re-fetch every known user, e.g. after reconnecting.
    pub async fn refresh_all(&self) -> Result<(), TransportError> {
        let _refresh = self.refresh.lock().await;
        let mut users: BTreeSet<String> = self.entries().keys().cloned().collect();
        users.extend(self.conversations.participants());
        if users.is_empty() {
            return Ok(());
        }
        let users: Vec<String> = users.into_iter().collect();
        let records = self.transport.fetch_presence(&users).await?;
        debug!("Presence refreshed for {} user(s)", records.len());
        self.store(records, Instant::now(), true);
        Ok(())
    }

    /// Apply a pushed presence change.
    pub fn apply(&self, record: PresenceRecord) {
        self.store(vec![record], Instant::now(), true);
    }

    fn store(&self, records: Vec<PresenceRecord>, now: Instant, publish_changes: bool) {
        let mut changed = Vec::new();
        {
            let mut entries = self.entries();
            for record in records {
                let differs = entries
                    .get(&record.user_id)
                    .map_or(true, |c| c.record.is_online != record.is_online);
                if differs && publish_changes {
                    changed.push(record.clone());
                }
                entries.insert(
                    record.user_id.clone(),
                    CachedPresence {
                        record,
                        refreshed: now,
                    },
                );
            }
        }
        for record in changed {
            for conversation_id in self.conversations.conversations_with(&record.user_id) {
                self.feed
                    .publish(&conversation_id, ConversationUpdate::Presence(record.clone()));
            }
        }
    }
}

#[async_trait]
impl EventHandler for PresenceCache {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        if let InboundEvent::PresenceChanged(record) = event {
            self.apply(record.clone());
        }
        Ok(())
    }
}
