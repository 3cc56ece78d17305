use super::feed::ChangeFeed;
use super::in_memory::sort_newest_first;
use crate::domain::events::{RowChange, RowOp};
use crate::domain::money::Balance;
use crate::domain::ports::{AdjustOutcome, BalanceStore, CasOutcome, ChangeSource, RequestStore};
use crate::domain::request::{
    RequestId, RequestKind, RequestStatus, SettlableRequest, SettlementRef,
};
use crate::domain::user::{Adjustment, UserAccount, UserId};
use crate::error::StoreError;
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

/// Column Family for request rows.
pub const CF_REQUESTS: &str = "requests";
/// Column Family for user rows.
pub const CF_USERS: &str = "users";
/// Column Family for the adjustment ledger, keyed by user and settlement ref.
pub const CF_ADJUSTMENTS: &str = "adjustments";
/// Column Family marking removed request ids, which are never reused.
pub const CF_RETIRED: &str = "retired_requests";

fn adjustment_key(user: UserId, settlement_ref: SettlementRef) -> Vec<u8> {
    let mut key = user.0.to_be_bytes().to_vec();
    key.extend_from_slice(settlement_ref.0.as_bytes());
    key
}

/// A persistent store implementation using RocksDB.
///
/// Requests, users and the adjustment ledger live in separate Column
/// Families. Conditional writes are serialized through `write_lock` and
/// committed with a single `WriteBatch`, so a balance change and its ledger
/// entry land together or not at all. Row changes are published on an
/// in-process [`ChangeFeed`] after each commit, while the lock is still held.
///
/// `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    feed: ChangeFeed,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating missing
    /// column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_REQUESTS, CF_USERS, CF_ADJUSTMENTS, CF_RETIRED]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::default(),
            feed: ChangeFeed::default(),
        })
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, cf: &str, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.db.get_pinned_cf(self.cf(cf)?, key)?.is_some())
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf)?;
        self.db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| -> Result<T, StoreError> {
                let (_key, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }
}

#[async_trait]
impl RequestStore for RocksDBStore {
    async fn insert(&self, mut request: SettlableRequest) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = request.id.0.to_be_bytes();
        if self.read::<SettlableRequest>(CF_REQUESTS, &key)?.is_some() {
            return Err(StoreError::Duplicate(format!(
                "request {} already exists",
                request.id
            )));
        }
        if self.contains(CF_RETIRED, &key)? {
            return Err(StoreError::Duplicate(format!(
                "request {} was removed and cannot be reused",
                request.id
            )));
        }
        request.version = 1;
        self.put(CF_REQUESTS, &key, &request)?;
        self.feed.publish(RowChange::Request {
            op: RowOp::Insert,
            row: request,
        });
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError> {
        self.read(CF_REQUESTS, &id.0.to_be_bytes())
    }

    async fn all(&self) -> Result<Vec<SettlableRequest>, StoreError> {
        // Big-endian keys iterate in id order.
        self.scan(CF_REQUESTS)
    }

    async fn list_pending(&self, kind: RequestKind) -> Result<Vec<SettlableRequest>, StoreError> {
        let mut pending: Vec<SettlableRequest> = self
            .scan::<SettlableRequest>(CF_REQUESTS)?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Pending && r.kind() == kind)
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
        let _guard = self.write_lock.lock().await;
        let key = id.0.to_be_bytes();
        let Some(mut request) = self.read::<SettlableRequest>(CF_REQUESTS, &key)? else {
            return Ok(CasOutcome::Missing);
        };
        if !request.swap_status(expected, next, settlement_ref) {
            return Ok(CasOutcome::Mismatch(request));
        }
        self.put(CF_REQUESTS, &key, &request)?;
        self.feed.publish(RowChange::Request {
            op: RowOp::Update,
            row: request.clone(),
        });
        Ok(CasOutcome::Swapped(request))
    }

    async fn remove(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = id.0.to_be_bytes();
        let Some(mut row) = self.read::<SettlableRequest>(CF_REQUESTS, &key)? else {
            return Ok(None);
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_REQUESTS)?, key);
        batch.put_cf(self.cf(CF_RETIRED)?, key, b"");
        self.db.write(batch)?;
        row.version += 1;
        self.feed.publish(RowChange::Request {
            op: RowOp::Delete,
            row: row.clone(),
        });
        Ok(Some(row))
    }
}

#[async_trait]
impl BalanceStore for RocksDBStore {
    async fn insert_user(&self, mut user: UserAccount) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = user.id.0.to_be_bytes();
        if self.read::<UserAccount>(CF_USERS, &key)?.is_some() {
            return Err(StoreError::Duplicate(format!("user {} already exists", user.id)));
        }
        user.version = 1;
        self.put(CF_USERS, &key, &user)?;
        self.feed.publish(RowChange::User {
            op: RowOp::Insert,
            row: user,
        });
        Ok(())
    }

    async fn get(&self, id: UserId) -> Result<Option<UserAccount>, StoreError> {
        self.read(CF_USERS, &id.0.to_be_bytes())
    }

    async fn all(&self) -> Result<Vec<UserAccount>, StoreError> {
        self.scan(CF_USERS)
    }

    async fn apply_adjustment(&self, adjustment: Adjustment) -> Result<AdjustOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let user_key = adjustment.user.0.to_be_bytes();
        let Some(mut user) = self.read::<UserAccount>(CF_USERS, &user_key)? else {
            return Ok(AdjustOutcome::UnknownUser);
        };
        let ledger_key = adjustment_key(adjustment.user, adjustment.settlement_ref);
        if self.read::<Adjustment>(CF_ADJUSTMENTS, &ledger_key)?.is_some() {
            return Ok(AdjustOutcome::Applied(user));
        }
        if let Err(available) = user.apply(&adjustment) {
            return Ok(AdjustOutcome::Insufficient { available });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_USERS)?, user_key, serde_json::to_vec(&user)?);
        batch.put_cf(
            self.cf(CF_ADJUSTMENTS)?,
            ledger_key,
            serde_json::to_vec(&adjustment)?,
        );
        self.db.write(batch)?;

        self.feed.publish(RowChange::User {
            op: RowOp::Update,
            row: user.clone(),
        });
        Ok(AdjustOutcome::Applied(user))
    }

    async fn find_adjustment(
        &self,
        user: UserId,
        settlement_ref: SettlementRef,
    ) -> Result<Option<Adjustment>, StoreError> {
        self.read(CF_ADJUSTMENTS, &adjustment_key(user, settlement_ref))
    }

    async fn set_balance(
        &self,
        id: UserId,
        balance: Balance,
    ) -> Result<Option<UserAccount>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = id.0.to_be_bytes();
        let Some(mut user) = self.read::<UserAccount>(CF_USERS, &key)? else {
            return Ok(None);
        };
        user.balance = balance;
        user.version += 1;
        self.put(CF_USERS, &key, &user)?;
        self.feed.publish(RowChange::User {
            op: RowOp::Update,
            row: user.clone(),
        });
        Ok(Some(user))
    }
}

#[async_trait]
impl ChangeSource for RocksDBStore {
    async fn subscribe(&self) -> Result<broadcast::Receiver<RowChange>, StoreError> {
        self.feed.subscribe().await
    }
}
