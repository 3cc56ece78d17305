use super::events::RowChange;
use super::request::{RequestId, RequestKind, RequestStatus, SettlableRequest, SettlementRef};
use super::user::{Adjustment, UserAccount, UserId};
use crate::domain::money::Balance;
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Result of a conditional status write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write happened; carries the row as stored.
    Swapped(SettlableRequest),
    /// The row did not hold the expected status (or ref); carries it unchanged.
    Mismatch(SettlableRequest),
    Missing,
}

/// Result of a conditional balance adjustment.
#[derive(Debug, Clone, PartialEq)]
pub enum AdjustOutcome {
    /// Applied now, or already applied earlier under the same settlement ref.
    Applied(UserAccount),
    /// The floor check refused the debit; carries the balance at that instant.
    Insufficient { available: Balance },
    UnknownUser,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert(&self, request: SettlableRequest) -> Result<(), StoreError>;
    async fn get(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError>;
    async fn all(&self) -> Result<Vec<SettlableRequest>, StoreError>;
    async fn list_pending(&self, kind: RequestKind) -> Result<Vec<SettlableRequest>, StoreError>;
    /// Atomically moves `id` from `expected` to `next`, following the rules of
    /// [`SettlableRequest::swap_status`].
    async fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        settlement_ref: SettlementRef,
    ) -> Result<CasOutcome, StoreError>;
    async fn remove(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn insert_user(&self, user: UserAccount) -> Result<(), StoreError>;
    async fn get(&self, id: UserId) -> Result<Option<UserAccount>, StoreError>;
    async fn all(&self) -> Result<Vec<UserAccount>, StoreError>;
    /// Atomic increment/decrement. Idempotent per `settlement_ref`.
    async fn apply_adjustment(&self, adjustment: Adjustment) -> Result<AdjustOutcome, StoreError>;
    async fn find_adjustment(
        &self,
        user: UserId,
        settlement_ref: SettlementRef,
    ) -> Result<Option<Adjustment>, StoreError>;
    /// Overwrites the balance outside of settlement.
    async fn set_balance(&self, id: UserId, balance: Balance)
    -> Result<Option<UserAccount>, StoreError>;
}

/// Live tap on store mutations. Not a queue: nothing is replayed.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn subscribe(&self) -> Result<broadcast::Receiver<RowChange>, StoreError>;
}

pub type RequestStoreRef = Arc<dyn RequestStore>;
pub type BalanceStoreRef = Arc<dyn BalanceStore>;
pub type ChangeSourceRef = Arc<dyn ChangeSource>;
