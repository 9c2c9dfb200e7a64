//! Realtime change-feed subscriptions with per-scope debouncing.
//!
//! One underlying transport connection exists per distinct scope; multiple
//! subscribers share it through reference counting. Incoming events restart
//! a quiet-period timer, and when the timer elapses every listener of the
//! scope gets exactly one `Changed` signal, regardless of how many events
//! arrived in the window.
//!
//! Reconnection is deliberately not handled here: when the transport drops a
//! feed, every listener receives `Lost` once and the scope becomes inactive
//! until someone subscribes again.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lexsync_types::{ChangeEvent, SubscriptionScope, SyncError};
use tokio::sync::{mpsc, oneshot};

use crate::config::DEFAULT_DEBOUNCE_MS;

/// Signal delivered to feed listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSignal {
    /// At least one matching change event arrived; caches should invalidate
    Changed,
    /// The transport dropped the feed; re-subscribe to resume
    Lost,
}

/// Listener callback. Must be cheap; spawn a task for real work.
pub type FeedListener = Arc<dyn Fn(FeedSignal) + Send + Sync>;

/// One open feed as handed over by the transport.
pub struct FeedConnection {
    /// Stream of change events for the scope
    pub events: mpsc::Receiver<ChangeEvent>,
    /// Fired (or dropped) when the client no longer wants the feed
    pub close: Option<oneshot::Sender<()>>,
}

/// Minimal realtime-transport boundary. The embedder supplies the actual
/// protocol (typically a websocket change feed) and applies the scope's
/// owner filter server-side when opening the feed.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, scope: &SubscriptionScope) -> Result<FeedConnection, SyncError>;
}

struct ScopeState {
    refcount: AtomicUsize,
    listeners: Arc<DashMap<u64, FeedListener>>,
    pump: tokio::task::JoinHandle<()>,
    close: Mutex<Option<oneshot::Sender<()>>>,
}

/// Subscribes to remote change notifications, sharing one connection per
/// scope and debouncing event bursts into single notifications.
pub struct ChangeFeedClient {
    transport: Arc<dyn RealtimeTransport>,
    scopes: Arc<DashMap<String, Arc<ScopeState>>>,
    debounce: Duration,
    next_listener_id: AtomicU64,
    /// Serializes subscribe calls so a scope never gets two connections.
    subscribe_gate: tokio::sync::Mutex<()>,
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self::with_debounce(transport, Duration::from_millis(DEFAULT_DEBOUNCE_MS))
    }

    pub fn with_debounce(transport: Arc<dyn RealtimeTransport>, debounce: Duration) -> Self {
        Self {
            transport,
            scopes: Arc::new(DashMap::new()),
            debounce,
            next_listener_id: AtomicU64::new(1),
            subscribe_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Open (or join) the feed for `scope`. The returned handle must be
    /// disposed on every exit path; the last disposal closes the underlying
    /// connection.
    pub async fn subscribe(
        &self,
        scope: SubscriptionScope,
        listener: FeedListener,
    ) -> Result<SubscriptionHandle, SyncError> {
        let _gate = self.subscribe_gate.lock().await;
        let key = scope.scope_key();
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);

        if let Some(state) = self.scopes.get(&key) {
            state.refcount.fetch_add(1, Ordering::SeqCst);
            state.listeners.insert(listener_id, listener);
            tracing::debug!(scope = %key, "joined existing feed");
            return Ok(SubscriptionHandle {
                scopes: Arc::clone(&self.scopes),
                state: Arc::downgrade(state.value()),
                key,
                listener_id,
                disposed: std::sync::atomic::AtomicBool::new(false),
            });
        }

        let connection = self.transport.connect(&scope).await?;
        let listeners: Arc<DashMap<u64, FeedListener>> = Arc::new(DashMap::new());
        listeners.insert(listener_id, listener);

        let pump = tokio::spawn(pump_events(
            scope,
            connection.events,
            Arc::clone(&listeners),
            Arc::clone(&self.scopes),
            key.clone(),
            self.debounce,
        ));

        let state = Arc::new(ScopeState {
            refcount: AtomicUsize::new(1),
            listeners,
            pump,
            close: Mutex::new(connection.close),
        });
        let weak = Arc::downgrade(&state);
        self.scopes.insert(key.clone(), state);
        tracing::debug!(scope = %key, "feed opened");

        Ok(SubscriptionHandle {
            scopes: Arc::clone(&self.scopes),
            state: weak,
            key,
            listener_id,
            disposed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Number of scopes with an open connection (diagnostics and tests).
    pub fn active_scopes(&self) -> usize {
        self.scopes.len()
    }
}

/// Per-scope event pump: filters, debounces, and fans out signals.
async fn pump_events(
    scope: SubscriptionScope,
    mut events: mpsc::Receiver<ChangeEvent>,
    listeners: Arc<DashMap<u64, FeedListener>>,
    scopes: Arc<DashMap<String, Arc<ScopeState>>>,
    key: String,
    debounce: Duration,
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            maybe_event = events.recv() => match maybe_event {
                Some(event) => {
                    if scope.matches(&event) {
                        tracing::trace!(scope = %key, event = %event.event_type, "change event; debounce restarted");
                        deadline = Some(tokio::time::Instant::now() + debounce);
                    }
                }
                None => {
                    tracing::warn!(scope = %key, "change feed transport dropped");
                    // Events already coalescing in the debounce window must
                    // still be delivered, before the loss signal.
                    if deadline.is_some() {
                        for entry in listeners.iter() {
                            (entry.value())(FeedSignal::Changed);
                        }
                    }
                    for entry in listeners.iter() {
                        (entry.value())(FeedSignal::Lost);
                    }
                    // Scope is inactive until re-subscribed; no implicit retry.
                    scopes.remove(&key);
                    break;
                }
            },
            () = timer => {
                deadline = None;
                tracing::debug!(scope = %key, "debounce window elapsed; notifying");
                for entry in listeners.iter() {
                    (entry.value())(FeedSignal::Changed);
                }
            }
        }
    }
}

/// Handle to one subscription. Dropping it disposes it, but callers should
/// call `dispose()` explicitly on all exit paths.
///
/// The handle is tied to the exact connection it joined, not to the scope
/// key: after a transport loss and a re-subscribe, disposing a stale handle
/// must never touch the fresh connection under the same key.
pub struct SubscriptionHandle {
    scopes: Arc<DashMap<String, Arc<ScopeState>>>,
    state: Weak<ScopeState>,
    key: String,
    listener_id: u64,
    disposed: std::sync::atomic::AtomicBool,
}

impl SubscriptionHandle {
    /// Detach this listener. When the last listener of the scope detaches,
    /// the underlying feed connection is closed and the pump task aborted.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // A dead weak means the connection this handle joined is already
        // gone (transport loss). A later subscription may own the key now.
        let Some(state) = self.state.upgrade() else {
            return;
        };

        state.listeners.remove(&self.listener_id);
        if state.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.scopes.remove_if(&self.key, |_, current| Arc::ptr_eq(current, &state));
            if let Some(close) = state.close.lock().ok().and_then(|mut c| c.take()) {
                let _ = close.send(());
            }
            state.pump.abort();
            tracing::debug!(scope = %self.key, "feed closed");
        }
    }

    pub fn scope_key(&self) -> &str {
        &self.key
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// In-process transport backed by plain channels.
///
/// Used by tests and by embedders that generate change events locally
/// (e.g. while running against fixture data with no realtime backend).
#[derive(Default)]
pub struct InProcessTransport {
    senders: Arc<DashMap<String, mpsc::Sender<ChangeEvent>>>,
    connect_count: AtomicUsize,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the feed for `scope_key`, if one is open.
    pub async fn emit(&self, scope_key: &str, event: ChangeEvent) -> bool {
        let sender = match self.senders.get(scope_key) {
            Some(s) => s.value().clone(),
            None => return false,
        };
        sender.send(event).await.is_ok()
    }

    /// Simulate the transport dropping a feed.
    pub fn drop_feed(&self, scope_key: &str) {
        self.senders.remove(scope_key);
    }

    /// How many connections were ever opened (for sharing assertions).
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeTransport for InProcessTransport {
    async fn connect(&self, scope: &SubscriptionScope) -> Result<FeedConnection, SyncError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        let (close_tx, close_rx) = oneshot::channel();
        let key = scope.scope_key();
        self.senders.insert(key.clone(), tx);

        // Tear the sender down when the client closes the feed (send or
        // drop of the close channel), so later emits report the feed gone.
        let senders = Arc::clone(&self.senders);
        tokio::spawn(async move {
            let _ = close_rx.await;
            senders.remove(&key);
            tracing::trace!(scope = %key, "in-process feed closed by client");
        });

        Ok(FeedConnection { events: rx, close: Some(close_tx) })
    }
}
