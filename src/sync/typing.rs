// Typing Indicator Coordinator
// Local side: emit "typing" on the first keystroke, "stopped" once input has
// been quiet for the debounce window. Remote side: show an indicator on
// "typing" and clear it on "stopped" or after a hard timeout, whichever comes
// first, so a lost stop event cannot leave it stuck.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::feed::ConversationFeed;
use super::router::EventHandler;
use crate::models::{now_millis, ConversationUpdate, TypingState};
use crate::transport::{InboundEvent, Transport};

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct RemoteIndicator {
    state: TypingState,
    timer: Timer,
}

#[derive(Default)]
struct Timers {
    local: HashMap<String, Timer>, // present while we are typing
    remote: HashMap<(String, String), RemoteIndicator>,
    next_generation: u64,
}

impl Timers {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Inner {
    own_user_id: String,
    feed: Arc<ConversationFeed>,
    debounce: Duration,
    timeout: Duration,
    timers: Mutex<Timers>,
    emit_tx: mpsc::UnboundedSender<(String, bool)>,
}

impl Inner {
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, conversation_id: &str, is_typing: bool) {
        let _ = self.emit_tx.send((conversation_id.to_string(), is_typing));
    }

    fn publish(&self, state: TypingState) {
        let conversation_id = state.conversation_id.clone();
        self.feed
            .publish(&conversation_id, ConversationUpdate::Typing(state));
    }
}

pub struct TypingCoordinator {
    inner: Arc<Inner>,
    emitter: JoinHandle<()>,
}

impl TypingCoordinator {
    pub fn new(
        own_user_id: String,
        transport: Arc<dyn Transport>,
        feed: Arc<ConversationFeed>,
        debounce: Duration,
        timeout: Duration,
    ) -> Self {
        let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<(String, bool)>();
        // Single sender task keeps typing/stopped in emission order
        let emitter = tokio::spawn(async move {
            while let Some((conversation_id, is_typing)) = emit_rx.recv().await {
                match transport.send_typing(&conversation_id, is_typing).await {
                    Ok(()) => debug!("Sent typing={} for {}", is_typing, conversation_id),
                    Err(e) => debug!("Failed to send typing state for {}: {}", conversation_id, e),
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                own_user_id,
                feed,
                debounce,
                timeout,
                timers: Mutex::new(Timers::default()),
                emit_tx,
            }),
            emitter,
        }
    }

    /// Feed the current contents of the input box on every keystroke.
    pub fn on_local_input(&self, conversation_id: &str, text: &str) {
        let inner = &self.inner;
        let mut timers = inner.timers();

        if text.trim().is_empty() {
            if let Some(timer) = timers.local.remove(conversation_id) {
                timer.handle.abort();
                inner.emit(conversation_id, false);
            }
            return;
        }

        match timers.local.remove(conversation_id) {
            Some(timer) => timer.handle.abort(),
            None => inner.emit(conversation_id, true),
        }

        let generation = timers.generation();
        let task_inner = inner.clone();
        let conversation = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(task_inner.debounce).await;
            let mut timers = task_inner.timers();
            if timers.local.get(&conversation).map(|t| t.generation) == Some(generation) {
                timers.local.remove(&conversation);
                task_inner.emit(&conversation, false);
            }
        });
        timers
            .local
            .insert(conversation_id.to_string(), Timer { generation, handle });
    }

    pub fn is_local_typing(&self, conversation_id: &str) -> bool {
        self.inner.timers().local.contains_key(conversation_id)
    }

    pub fn on_remote_typing(&self, conversation_id: &str, user_id: &str, is_typing: bool) {
        let inner = &self.inner;
        if user_id == inner.own_user_id {
            return;
        }
        let key = (conversation_id.to_string(), user_id.to_string());
        let mut timers = inner.timers();

        if !is_typing {
            if let Some(indicator) = timers.remote.remove(&key) {
                indicator.timer.handle.abort();
                inner.publish(TypingState {
                    is_typing: false,
                    expires_at: None,
                    ..indicator.state
                });
            }
            return;
        }

        if let Some(previous) = timers.remote.remove(&key) {
            previous.timer.handle.abort();
        }

        let generation = timers.generation();
        let state = TypingState {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            is_typing: true,
            expires_at: Some(now_millis() + inner.timeout.as_millis() as u64),
        };

        let task_inner = inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(task_inner.timeout).await;
            let mut timers = task_inner.timers();
            let current = timers.remote.get(&task_key).map(|i| i.timer.generation);
            if current == Some(generation) {
                if let Some(indicator) = timers.remote.remove(&task_key) {
                    debug!(
                        "Typing indicator of {} in {} timed out",
                        task_key.1, task_key.0
                    );
                    task_inner.publish(TypingState {
                        is_typing: false,
                        expires_at: None,
                        ..indicator.state
                    });
                }
            }
        });

        timers.remote.insert(
            key,
            RemoteIndicator {
                state: state.clone(),
                timer: Timer { generation, handle },
            },
        );
        inner.publish(state);
    }

    /// Remote users currently shown as typing in a conversation.
    pub fn remote_typers(&self, conversation_id: &str) -> Vec<TypingState> {
        self.inner
            .timers()
            .remote
            .values()
            .filter(|i| i.state.conversation_id == conversation_id)
            .map(|i| i.state.clone())
            .collect()
    }

    /// Cancel every timer of a conversation that is being closed.
    pub fn dispose(&self, conversation_id: &str) {
        let inner = &self.inner;
        let mut timers = inner.timers();
        if let Some(timer) = timers.local.remove(conversation_id) {
            timer.handle.abort();
            inner.emit(conversation_id, false);
        }
        timers.remote.retain(|(conversation, _), indicator| {
            if conversation == conversation_id {
                indicator.timer.handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn shutdown(&self) {
        let mut timers = self.inner.timers();
        for (_, timer) in timers.local.drain() {
            timer.handle.abort();
        }
        for (_, indicator) in timers.remote.drain() {
            indicator.timer.handle.abort();
        }
        self.emitter.abort();
    }
}

#[async_trait]
impl EventHandler for TypingCoordinator {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        match event {
            InboundEvent::TypingChanged {
                conversation_id,
                user_id,
                is_typing,
            } => {
                self.on_remote_typing(conversation_id, user_id, *is_typing);
                Ok(())
            }
            other => {
                warn!("Typing coordinator got unexpected {:?}", other.kind());
                Ok(())
            }
        }
    }
}
