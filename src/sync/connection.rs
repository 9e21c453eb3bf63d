// Connection Manager
// Owns the single transport connection: connect/disconnect, reconnect with
// capped exponential backoff, and the observable connection state. Events read
// off the connection are forwarded onto the engine's event path together with
// state changes, so the engine sees both in the order they happened.

use futures::Stream;
use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use super::EngineEvent;
use crate::auth::AuthProvider;
use crate::config::BackoffConfig;
use crate::models::ConnectionState;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Connection state plus the epoch of the connection it refers to. The epoch
/// is bumped on every transition into `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub epoch: u64,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    backoff: BackoffConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<EngineEvent>,
    supervisor: TokioMutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        backoff: BackoffConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        Arc::new(Self {
            transport,
            auth,
            backoff,
            status_tx,
            events,
            supervisor: TokioMutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Current state first, then every change.
    pub fn state_changes(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        WatchStream::new(self.status_tx.subscribe()).map(|status| status.state)
    }

    /// Start connecting. No-op while a connection exists or is being attempted.
    pub async fn connect(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.as_ref() {
            if !handle.is_finished() {
                debug!("connect() ignored, connection supervisor already running");
                return;
            }
        }
        info!("Starting connection supervisor");
        *supervisor = Some(tokio::spawn(self.clone().supervise()));
    }

    /// Tear the connection down and stop reconnecting until the next `connect()`.
    pub async fn disconnect(&self) {
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Disconnecting from messaging server");
        }
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected, self.epoch.load(Ordering::SeqCst));
    }

    fn set_state(&self, state: ConnectionState, epoch: u64) {
        let status = ConnectionStatus { state, epoch };
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!("Connection state -> {:?} (epoch {})", state, epoch);
            let _ = self.events.send(EngineEvent::Connection(status));
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.backoff.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.backoff.jitter_ms)
        } else {
            0
        };
        self.backoff.delay_for(attempt) + Duration::from_millis(jitter)
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut refresh_token = false;

        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            self.set_state(ConnectionState::Connecting, epoch);

            let token = if refresh_token {
                self.auth.refresh_token().await
            } else {
                self.auth.auth_token().await
            };
            refresh_token = false;

            let opened = match token {
                Ok(token) => self.transport.open(&token).await,
                Err(e) => Err(e),
            };

            match opened {
                Ok(mut rx) => {
                    attempt = 0;
                    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Connected to messaging server (epoch {})", epoch);
                    self.set_state(ConnectionState::Connected, epoch);

                    let reason = loop {
                        match rx.recv().await {
                            Some(TransportEvent::Closed { reason }) => break reason,
                            Some(event) => {
                                if self.events.send(EngineEvent::Transport { epoch, event }).is_err() {
                                    debug!("Engine gone, stopping connection supervisor");
                                    return;
                                }
                            }
                            None => break "event stream ended".to_string(),
                        }
                    };
                    warn!("Connection lost: {}", reason);
                    self.set_state(ConnectionState::Disconnected, epoch);
                }
                Err(TransportError::Unauthorized) => {
                    warn!("Server refused the auth token, refreshing before next attempt");
                    refresh_token = true;
                    self.set_state(ConnectionState::Disconnected, epoch);
                }
                Err(e) => {
                    error!("Failed to connect: {}", e);
                    self.set_state(ConnectionState::Disconnected, epoch);
                }
            }

            if self.events.is_closed() {
                return;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.reconnect_delay(attempt);
            info!("Retrying connection in {:?} (attempt {})", delay, attempt);
            tokio::time::sleep(delay).await;
        }
    }
}
