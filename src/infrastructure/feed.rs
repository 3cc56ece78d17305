use crate::domain::events::RowChange;
use crate::domain::ports::ChangeSource;
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Broadcast hub the stores publish their row changes into.
///
/// Stores sharing one feed give the relay a single tap over every table.
/// `sever` and `set_available` simulate the upstream realtime service
/// dropping connections or refusing new subscriptions.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: Arc<Mutex<broadcast::Sender<RowChange>>>,
    available: Arc<AtomicBool>,
    capacity: usize,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(Mutex::new(sender)),
            available: Arc::new(AtomicBool::new(true)),
            capacity,
        }
    }

    /// Publishes a change to whoever is subscribed right now.
    pub fn publish(&self, change: RowChange) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // No subscribers is not an error for a live tap.
        let _ = sender.send(change);
    }

    /// Drops every current subscription. Subscribers observe `Closed`.
    pub fn sever(&self) {
        let (fresh, _) = broadcast::channel(self.capacity);
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        *sender = fresh;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeSource for ChangeFeed {
    async fn subscribe(&self) -> Result<broadcast::Receiver<RowChange>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "change feed refused subscription".to_string(),
            ));
        }
        Ok(self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe())
    }
}
