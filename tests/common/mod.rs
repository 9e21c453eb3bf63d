// Common test utilities for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use log::LevelFilter;
use tokio::time::{sleep, timeout, Instant};

use chatsync::auth::StaticAuth;
use chatsync::config::{BackoffConfig, SyncConfig};
use chatsync::models::{now_millis, ConversationUpdate, Message, MessageState};
use chatsync::store::MemoryStore;
use chatsync::sync::feed::ConversationStream;
use chatsync::transport::LoopbackTransport;
use chatsync::SyncEngine;

pub const ME: &str = "me";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Defaults, with a short deterministic reconnect backoff
pub fn test_config() -> SyncConfig {
    SyncConfig {
        backoff: BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 0,
        },
        ..SyncConfig::default()
    }
}

/// An engine wired to a loopback server
pub struct Harness {
    pub engine: SyncEngine,
    pub server: Arc<LoopbackTransport>,
    pub store: Arc<MemoryStore>,
    pub auth: Arc<StaticAuth>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), Arc::new(MemoryStore::new()))
    }

    pub fn with(config: SyncConfig, store: Arc<MemoryStore>) -> Self {
        setup_logging();
        let server = Arc::new(LoopbackTransport::new());
        let auth = Arc::new(StaticAuth::new(ME, "token"));
        let engine = SyncEngine::new(config, server.clone(), auth.clone(), store.clone())
            .expect("engine starts");
        Self {
            engine,
            server,
            store,
            auth,
        }
    }

    pub async fn connected() -> Self {
        let harness = Self::new();
        harness.connect().await;
        harness
    }

    pub async fn connect(&self) {
        self.engine.connect().await.expect("engine is running");
        let engine = &self.engine;
        wait_until("connected", || engine.is_connected()).await;
        // let the engine loop see the new connection
        sleep(Duration::from_millis(1)).await;
    }
}

/// Poll `condition` until it holds, letting other tasks and timers run in
/// between. Panics after 30s of (virtual) time.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(1)).await;
    }
}

/// Wait until the message known as `id` is in `state`.
pub async fn wait_for_state(engine: &SyncEngine, id: &str, state: MessageState) -> Message {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(message) = engine.message(id).await {
            if message.state == state {
                return message;
            }
        }
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for {} to become {:?}, it is {:?}",
                id,
                state,
                engine.message(id).await.map(|m| m.state)
            );
        }
        sleep(Duration::from_millis(1)).await;
    }
}

/// Wait until the conversation's message list satisfies `condition`.
pub async fn wait_for_messages<F: FnMut(&[Message]) -> bool>(
    engine: &SyncEngine,
    conversation_id: &str,
    mut condition: F,
) -> Vec<Message> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let messages = engine.messages(conversation_id).await;
        if condition(&messages) {
            return messages;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting on messages of {}: {:?}", conversation_id, messages);
        }
        sleep(Duration::from_millis(1)).await;
    }
}

/// Next update on the stream, `None` if it ended or stayed silent for 30s.
pub async fn next_update(stream: &mut ConversationStream) -> Option<ConversationUpdate> {
    timeout(Duration::from_secs(30), stream.recv())
        .await
        .ok()
        .flatten()
}

/// A message another user posted, as the server pushes it
pub fn inbound(id: &str, conversation_id: &str, sender_id: &str, text: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        timestamp: now_millis(),
        state: MessageState::Sent,
        error: None,
    }
}

pub fn texts(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.text.clone()).collect()
}
