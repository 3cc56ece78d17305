//! Change feed relay: turns store row changes into domain events for every
//! connected admin session.
//!
//! The relay is a live tap. It keeps no log, so a gap (upstream disconnect,
//! a lagging listener) is closed by a full re-read of the stores, published
//! as [`ChangeEvent::Resynced`]. Delivery is at-least-once; per-entity order
//! is preserved by forwarding only changes whose row version is newer than
//! the last one forwarded for that entity.

use crate::config::RelayConfig;
use crate::domain::events::{ChangeEvent, EntityKey, RowChange, Snapshot};
use crate::domain::ports::{BalanceStoreRef, ChangeSourceRef, RequestStoreRef};
use crate::error::StoreError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Reads the full state of both stores.
async fn read_snapshot(
    requests: &RequestStoreRef,
    balances: &BalanceStoreRef,
    timeout: Duration,
) -> Result<Snapshot, StoreError> {
    let read = async {
        Ok(Snapshot {
            requests: requests.all().await?,
            users: balances.all().await?,
        })
    };
    tokio::time::timeout(timeout, read)
        .await
        .unwrap_or_else(|_| Err(StoreError::Unavailable("snapshot read timed out".to_string())))
}

/// Handle to a running relay.
pub struct ChangeFeedRelay {
    events: broadcast::Sender<ChangeEvent>,
    requests: RequestStoreRef,
    balances: BalanceStoreRef,
    config: RelayConfig,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    next_session: AtomicU64,
}

impl ChangeFeedRelay {
    /// Subscribes to `source` and starts relaying on a background task.
    ///
    /// The upstream subscription is in place when this returns, so a
    /// listener that subscribes and then reads [`snapshot`](Self::snapshot)
    /// sees every later write. If `source` refuses, the worker keeps retrying
    /// with backoff and publishes a [`ChangeEvent::Resynced`] once it gets in.
    ///
    /// `requests` and `balances` are only read, for reconciliation.
    pub async fn start(
        source: ChangeSourceRef,
        requests: RequestStoreRef,
        balances: BalanceStoreRef,
        config: RelayConfig,
    ) -> Self {
        let initial = match tokio::time::timeout(config.store_timeout, source.subscribe()).await {
            Ok(Ok(rx)) => Some(rx),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Change feed refused the first subscription");
                None
            }
            Err(_) => {
                tracing::warn!("Change feed subscription timed out");
                None
            }
        };
        let (events, _) = broadcast::channel(config.channel_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = RelayWorker {
            source,
            requests: requests.clone(),
            balances: balances.clone(),
            config: config.clone(),
            events: events.clone(),
            last_forwarded: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(initial, shutdown_rx));
        Self {
            events,
            requests,
            balances,
            config,
            shutdown,
            task,
            next_session: AtomicU64::new(1),
        }
    }

    /// Opens a listener session. Dropping the session unsubscribes it.
    pub fn subscribe(&self) -> ListenerSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "Listener session opened");
        ListenerSession {
            id,
            rx: self.events.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Current state of both stores, for a listener that must rebuild.
    pub async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        read_snapshot(&self.requests, &self.balances, self.config.store_timeout).await
    }

    /// Stops the relay. Open sessions observe the end of their stream.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Relay task ended abnormally");
        }
    }
}

enum PumpEnd {
    Shutdown,
    Disconnected { received: bool },
}

struct RelayWorker {
    source: ChangeSourceRef,
    requests: RequestStoreRef,
    balances: BalanceStoreRef,
    config: RelayConfig,
    events: broadcast::Sender<ChangeEvent>,
    last_forwarded: HashMap<EntityKey, u64>,
}

impl RelayWorker {
    async fn run(
        mut self,
        mut initial: Option<broadcast::Receiver<RowChange>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        // Without a subscription from `start` there is already a gap.
        let mut resubscribing = initial.is_none();
        loop {
            let subscribed = match initial.take() {
                Some(rx) => Ok(rx),
                None => self.source.subscribe().await,
            };
            let rx = match subscribed {
                Ok(rx) => rx,
                Err(e) => {
                    resubscribing = true;
                    let delay = self.config.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Change feed subscription failed, backing off"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            // Subscribe first, then re-read: anything committed after the
            // snapshot arrives through `rx`, duplicates are dropped by version.
            if resubscribing {
                tracing::info!("Change feed resubscribed, reconciling");
                if !self.reconcile(&mut shutdown).await {
                    return;
                }
            }
            resubscribing = true;

            match self.pump(rx, &mut shutdown).await {
                PumpEnd::Shutdown => return,
                PumpEnd::Disconnected { received } => {
                    if received {
                        attempt = 0;
                    }
                    let delay = self.config.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Change feed disconnected, resubscribing"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    async fn pump(
        &mut self,
        mut rx: broadcast::Receiver<RowChange>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpEnd {
        let mut received = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return PumpEnd::Shutdown,
                msg = rx.recv() => match msg {
                    Ok(change) => {
                        received = true;
                        self.forward(change);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Relay fell behind the change feed, reconciling");
                        if !self.reconcile(shutdown).await {
                            return PumpEnd::Shutdown;
                        }
                    }
                    Err(RecvError::Closed) => return PumpEnd::Disconnected { received },
                },
            }
        }
    }

    fn forward(&mut self, change: RowChange) {
        let key = change.key();
        let version = change.version();
        if self
            .last_forwarded
            .get(&key)
            .is_some_and(|&seen| seen >= version)
        {
            tracing::trace!(?key, version, "Stale or duplicate change dropped");
            return;
        }
        self.last_forwarded.insert(key, version);
        if let Some(event) = ChangeEvent::from_row(change) {
            // No listeners is fine.
            let _ = self.events.send(event);
        }
    }

    /// Re-reads everything and publishes it, retrying with backoff. Returns
    /// `false` if shutdown was requested meanwhile.
    async fn reconcile(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            match read_snapshot(&self.requests, &self.balances, self.config.store_timeout).await {
                Ok(snapshot) => {
                    for request in &snapshot.requests {
                        self.remember(EntityKey::Request(request.id), request.version);
                    }
                    for user in &snapshot.users {
                        self.remember(EntityKey::User(user.id), user.version);
                    }
                    tracing::info!(
                        requests = snapshot.requests.len(),
                        users = snapshot.users.len(),
                        "Reconciliation snapshot published"
                    );
                    let _ = self.events.send(ChangeEvent::Resynced(snapshot));
                    return true;
                }
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(error = %e, attempt, "Reconciliation read failed, backing off");
                    if sleep_or_shutdown(delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    fn remember(&mut self, key: EntityKey, version: u64) {
        let seen = self.last_forwarded.entry(key).or_insert(version);
        *seen = (*seen).max(version);
    }
}

/// Sleeps for `delay`; returns `true` if shutdown was requested first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

/// What a listener session hands to its admin view.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Event(ChangeEvent),
    /// The session fell behind and dropped events; rebuild from a snapshot.
    ResyncRequired { missed: u64 },
}

/// One admin session's subscription to the relay.
pub struct ListenerSession {
    id: u64,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ListenerSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next update. `None` once the relay has shut down.
    pub async fn next(&mut self) -> Option<SessionUpdate> {
        match self.rx.recv().await {
            Ok(event) => Some(SessionUpdate::Event(event)),
            Err(RecvError::Lagged(missed)) => Some(SessionUpdate::ResyncRequired { missed }),
            Err(RecvError::Closed) => None,
        }
    }

    /// Returns an already delivered update without waiting.
    pub fn try_next(&mut self) -> Option<SessionUpdate> {
        match self.rx.try_recv() {
            Ok(event) => Some(SessionUpdate::Event(event)),
            Err(TryRecvError::Lagged(missed)) => Some(SessionUpdate::ResyncRequired { missed }),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }
}

impl Drop for ListenerSession {
    fn drop(&mut self) {
        tracing::debug!(session = self.id, "Listener session closed");
    }
}
