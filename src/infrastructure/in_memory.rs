use super::feed::ChangeFeed;
use crate::domain::events::{RowChange, RowOp};
use crate::domain::money::Balance;
use crate::domain::ports::{AdjustOutcome, BalanceStore, CasOutcome, RequestStore};
use crate::domain::request::{
    RequestId, RequestKind, RequestStatus, SettlableRequest, SettlementRef,
};
use crate::domain::user::{Adjustment, UserAccount, UserId};
use crate::error::StoreError;
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Newest first, ties broken by id so the order is total.
pub(crate) fn sort_newest_first(requests: &mut [SettlableRequest]) {
    requests.sort_by_key(|r| Reverse((r.created_at, r.id)));
}

#[derive(Default)]
struct RequestTable {
    rows: HashMap<RequestId, SettlableRequest>,
    /// Ids of removed requests. They are never handed out again.
    retired: HashSet<RequestId>,
}

/// A thread-safe in-memory request table.
///
/// Every write happens under the table's write lock and publishes its row
/// change before the lock is released, so changes to one request reach the
/// feed in commit order.
#[derive(Clone)]
pub struct InMemoryRequestStore {
    table: Arc<RwLock<RequestTable>>,
    feed: ChangeFeed,
}

impl InMemoryRequestStore {
    /// Creates an empty store with a private change feed.
    pub fn new() -> Self {
        Self::with_feed(ChangeFeed::default())
    }

    pub fn with_feed(feed: ChangeFeed) -> Self {
        Self {
            table: Arc::default(),
            feed,
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, mut request: SettlableRequest) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        if table.rows.contains_key(&request.id) {
            return Err(StoreError::Duplicate(format!(
                "request {} already exists",
                request.id
            )));
        }
        if table.retired.contains(&request.id) {
            return Err(StoreError::Duplicate(format!(
                "request {} was removed and cannot be reused",
                request.id
            )));
        }
        request.version = 1;
        table.rows.insert(request.id, request.clone());
        self.feed.publish(RowChange::Request {
            op: RowOp::Insert,
            row: request,
        });
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn all(&self) -> Result<Vec<SettlableRequest>, StoreError> {
        let table = self.table.read().await;
        let mut all: Vec<_> = table.rows.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    async fn list_pending(&self, kind: RequestKind) -> Result<Vec<SettlableRequest>, StoreError> {
        let table = self.table.read().await;
        let mut pending: Vec<_> = table
            .rows
            .values()
            .filter(|r| r.status == RequestStatus::Pending && r.kind() == kind)
            .cloned()
            .collect();
        sort_newest_first(&mut pending);
        Ok(pending)
    }

    async fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        settlement_ref: SettlementRef,
    ) -> Result<CasOutcome, StoreError> {
        let mut table = self.table.write().await;
        let Some(request) = table.rows.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };
        if !request.swap_status(expected, next, settlement_ref) {
            return Ok(CasOutcome::Mismatch(request.clone()));
        }
        let row = request.clone();
        self.feed.publish(RowChange::Request {
            op: RowOp::Update,
            row: row.clone(),
        });
        Ok(CasOutcome::Swapped(row))
    }

    async fn remove(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError> {
        let mut table = self.table.write().await;
        let Some(mut row) = table.rows.remove(&id) else {
            return Ok(None);
        };
        table.retired.insert(id);
        row.version += 1;
        self.feed.publish(RowChange::Request {
            op: RowOp::Delete,
            row: row.clone(),
        });
        Ok(Some(row))
    }
}

#[derive(Default)]
struct BalanceTable {
    users: HashMap<UserId, UserAccount>,
    adjustments: HashMap<(UserId, SettlementRef), Adjustment>,
}

/// A thread-safe in-memory balance table with its adjustment ledger.
///
/// The floor check, the increment and the idempotency record happen under
/// one write lock, which is what makes concurrent adjustments commute.
#[derive(Clone)]
pub struct InMemoryBalanceStore {
    table: Arc<RwLock<BalanceTable>>,
    feed: ChangeFeed,
}

impl InMemoryBalanceStore {
    /// Creates an empty store with a private change feed.
    pub fn new() -> Self {
        Self::with_feed(ChangeFeed::default())
    }

    pub fn with_feed(feed: ChangeFeed) -> Self {
        Self {
            table: Arc::default(),
            feed,
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

impl Default for InMemoryBalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn insert_user(&self, mut user: UserAccount) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        if table.users.contains_key(&user.id) {
            return Err(StoreError::Duplicate(format!("user {} already exists", user.id)));
        }
        user.version = 1;
        table.users.insert(user.id, user.clone());
        self.feed.publish(RowChange::User {
            op: RowOp::Insert,
            row: user,
        });
        Ok(())
    }

    async fn get(&self, id: UserId) -> Result<Option<UserAccount>, StoreError> {
        let table = self.table.read().await;
        Ok(table.users.get(&id).cloned())
    }

    async fn all(&self) -> Result<Vec<UserAccount>, StoreError> {
        let table = self.table.read().await;
        let mut users: Vec<_> = table.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn apply_adjustment(&self, adjustment: Adjustment) -> Result<AdjustOutcome, StoreError> {
        let mut guard = self.table.write().await;
        let table = &mut *guard;
        let key = (adjustment.user, adjustment.settlement_ref);
        let Some(user) = table.users.get_mut(&adjustment.user) else {
            return Ok(AdjustOutcome::UnknownUser);
        };
        if table.adjustments.contains_key(&key) {
            return Ok(AdjustOutcome::Applied(user.clone()));
        }
        if let Err(available) = user.apply(&adjustment) {
            return Ok(AdjustOutcome::Insufficient { available });
        }
        let row = user.clone();
        table.adjustments.insert(key, adjustment);
        self.feed.publish(RowChange::User {
            op: RowOp::Update,
            row: row.clone(),
        });
        Ok(AdjustOutcome::Applied(row))
    }

    async fn find_adjustment(
        &self,
        user: UserId,
        settlement_ref: SettlementRef,
    ) -> Result<Option<Adjustment>, StoreError> {
        let table = self.table.read().await;
        Ok(table.adjustments.get(&(user, settlement_ref)).copied())
    }

    async fn set_balance(
        &self,
        id: UserId,
        balance: Balance,
    ) -> Result<Option<UserAccount>, StoreError> {
        let mut table = self.table.write().await;
        let Some(user) = table.users.get_mut(&id) else {
            return Ok(None);
        };
        user.balance = balance;
        user.version += 1;
        let row = user.clone();
        self.feed.publish(RowChange::User {
            op: RowOp::Update,
            row: row.clone(),
        });
        Ok(Some(row))
    }
}
