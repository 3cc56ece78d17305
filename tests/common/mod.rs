#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use settlement_desk::application::engine::SettlementEngine;
use settlement_desk::domain::money::{Amount, Balance};
use settlement_desk::domain::ports::{
    AdjustOutcome, BalanceStore, CasOutcome, RequestStore,
};
use settlement_desk::domain::request::{
    RequestId, RequestKind, RequestStatus, SettlableRequest, SettlementRef,
};
use settlement_desk::domain::user::{Adjustment, UserAccount, UserId};
use settlement_desk::error::StoreError;
use settlement_desk::infrastructure::feed::ChangeFeed;
use settlement_desk::infrastructure::in_memory::{InMemoryBalanceStore, InMemoryRequestStore};
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory stores sharing one change feed.
#[derive(Clone)]
pub struct Fixture {
    pub feed: ChangeFeed,
    pub requests: InMemoryRequestStore,
    pub balances: InMemoryBalanceStore,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_feed_capacity(256)
    }

    /// A fixture whose change feed only buffers `capacity` changes per
    /// subscriber.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let feed = ChangeFeed::new(capacity);
        Self {
            requests: InMemoryRequestStore::with_feed(feed.clone()),
            balances: InMemoryBalanceStore::with_feed(feed.clone()),
            feed,
        }
    }

    pub async fn user(&self, id: u32, balance: Decimal) -> &Self {
        self.balances
            .insert_user(
                UserAccount::new(UserId(id), format!("user{id}"), format!("user{id}@example.com"))
                    .with_balance(Balance::new(balance)),
            )
            .await
            .unwrap();
        self
    }

    pub async fn request(&self, id: u64, kind: RequestKind, owner: u32, amount: Decimal) -> &Self {
        self.requests
            .insert(SettlableRequest::new(
                RequestId(id),
                kind,
                UserId(owner),
                Amount::new(amount).unwrap(),
            ))
            .await
            .unwrap();
        self
    }

    pub fn engine(&self) -> SettlementEngine {
        SettlementEngine::new(
            Arc::new(self.requests.clone()),
            Arc::new(self.balances.clone()),
        )
    }

    pub async fn balance(&self, id: u32) -> Balance {
        BalanceStore::get(&self.balances, UserId(id))
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    pub async fn status(&self, id: u64) -> RequestStatus {
        RequestStore::get(&self.requests, RequestId(id))
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

pub fn balance(value: Decimal) -> Balance {
    Balance::new(value)
}

/// How a [`FlakyBalanceStore`] misbehaves on `apply_adjustment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustFault {
    None,
    /// Fails without touching the balance.
    FailBeforeApply,
    /// Applies the adjustment, then reports a failure.
    FailAfterApply,
    /// Never answers.
    Hang,
    /// Answers correctly after the given delay.
    Slow(Duration),
    /// Overwrites the user's balance just before applying, as a concurrent
    /// edit would.
    DrainFirst(Balance),
}

/// Wraps the in-memory balance store with injectable faults.
#[derive(Clone)]
pub struct FlakyBalanceStore {
    pub inner: InMemoryBalanceStore,
    adjust: Arc<Mutex<AdjustFault>>,
    lookup_fails: Arc<Mutex<bool>>,
}

impl FlakyBalanceStore {
    pub fn new(inner: InMemoryBalanceStore) -> Self {
        Self {
            inner,
            adjust: Arc::new(Mutex::new(AdjustFault::None)),
            lookup_fails: Arc::new(Mutex::new(false)),
        }
    }

    pub fn fail_adjustments(&self, fault: AdjustFault) {
        *self.adjust.lock().unwrap() = fault;
    }

    pub fn fail_lookups(&self, fail: bool) {
        *self.lookup_fails.lock().unwrap() = fail;
    }
}

#[async_trait]
impl BalanceStore for FlakyBalanceStore {
    async fn insert_user(&self, user: UserAccount) -> Result<(), StoreError> {
        self.inner.insert_user(user).await
    }

    async fn get(&self, id: UserId) -> Result<Option<UserAccount>, StoreError> {
        BalanceStore::get(&self.inner, id).await
    }

    async fn all(&self) -> Result<Vec<UserAccount>, StoreError> {
        BalanceStore::all(&self.inner).await
    }

    async fn apply_adjustment(&self, adjustment: Adjustment) -> Result<AdjustOutcome, StoreError> {
        let fault = *self.adjust.lock().unwrap();
        match fault {
            AdjustFault::None => self.inner.apply_adjustment(adjustment).await,
            AdjustFault::FailBeforeApply => {
                Err(StoreError::Unavailable("connection reset".to_string()))
            }
            AdjustFault::FailAfterApply => {
                self.inner.apply_adjustment(adjustment).await?;
                Err(StoreError::Unavailable("response lost".to_string()))
            }
            AdjustFault::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(StoreError::Unavailable("unreachable".to_string()))
            }
            AdjustFault::Slow(delay) => {
                tokio::time::sleep(delay).await;
                self.inner.apply_adjustment(adjustment).await
            }
            AdjustFault::DrainFirst(balance) => {
                self.inner.set_balance(adjustment.user, balance).await?;
                self.inner.apply_adjustment(adjustment).await
            }
        }
    }

    async fn find_adjustment(
        &self,
        user: UserId,
        settlement_ref: SettlementRef,
    ) -> Result<Option<Adjustment>, StoreError> {
        if *self.lookup_fails.lock().unwrap() {
            return Err(StoreError::Unavailable("ledger unreachable".to_string()));
        }
        self.inner.find_adjustment(user, settlement_ref).await
    }

    async fn set_balance(
        &self,
        id: UserId,
        balance: Balance,
    ) -> Result<Option<UserAccount>, StoreError> {
        self.inner.set_balance(id, balance).await
    }
}

/// How a [`FlakyRequestStore`] misbehaves on `compare_and_set_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapFault {
    None,
    /// Refuses every revert to `Pending`.
    FailRevert,
    /// Applies forward swaps, then reports a failure.
    LoseAck,
    /// Like `LoseAck`, and also refuses every revert to `Pending`.
    LoseAckAndRevert,
    /// Fails forward swaps without applying them.
    DropForward,
}

/// How a [`FlakyRequestStore`] misbehaves on `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    None,
    /// Reads fail from the first forward swap onward.
    FailAfterSwap,
    Failing,
}

#[derive(Clone)]
pub struct FlakyRequestStore {
    pub inner: InMemoryRequestStore,
    swap: Arc<Mutex<SwapFault>>,
    read: Arc<Mutex<ReadFault>>,
}

impl FlakyRequestStore {
    pub fn new(inner: InMemoryRequestStore) -> Self {
        Self {
            inner,
            swap: Arc::new(Mutex::new(SwapFault::None)),
            read: Arc::new(Mutex::new(ReadFault::None)),
        }
    }

    pub fn fail_swaps(&self, fault: SwapFault) {
        *self.swap.lock().unwrap() = fault;
    }

    pub fn fail_reads(&self, fault: ReadFault) {
        *self.read.lock().unwrap() = fault;
    }
}

#[async_trait]
impl RequestStore for FlakyRequestStore {
    async fn insert(&self, request: SettlableRequest) -> Result<(), StoreError> {
        self.inner.insert(request).await
    }

    async fn get(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError> {
        if *self.read.lock().unwrap() == ReadFault::Failing {
            return Err(StoreError::Unavailable("read replica down".to_string()));
        }
        RequestStore::get(&self.inner, id).await
    }

    async fn all(&self) -> Result<Vec<SettlableRequest>, StoreError> {
        RequestStore::all(&self.inner).await
    }

    async fn list_pending(&self, kind: RequestKind) -> Result<Vec<SettlableRequest>, StoreError> {
        self.inner.list_pending(kind).await
    }

    async fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        settlement_ref: SettlementRef,
    ) -> Result<CasOutcome, StoreError> {
        let forward = next != RequestStatus::Pending;
        if forward {
            let mut read = self.read.lock().unwrap();
            if *read == ReadFault::FailAfterSwap {
                *read = ReadFault::Failing;
            }
        }
        let fault = *self.swap.lock().unwrap();
        match fault {
            SwapFault::FailRevert | SwapFault::LoseAckAndRevert if !forward => {
                Err(StoreError::Unavailable("revert rejected".to_string()))
            }
            SwapFault::LoseAck | SwapFault::LoseAckAndRevert if forward => {
                self.inner
                    .compare_and_set_status(id, expected, next, settlement_ref)
                    .await?;
                Err(StoreError::Unavailable("response lost".to_string()))
            }
            SwapFault::DropForward if forward => {
                Err(StoreError::Unavailable("connection reset".to_string()))
            }
            _ => {
                self.inner
                    .compare_and_set_status(id, expected, next, settlement_ref)
                    .await
            }
        }
    }

    async fn remove(&self, id: RequestId) -> Result<Option<SettlableRequest>, StoreError> {
        self.inner.remove(id).await
    }
}

/// Waits until someone (the relay worker) is subscribed to `feed`.
pub async fn wait_for_subscriber(feed: &ChangeFeed) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while feed.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("relay never subscribed");
}

pub fn write_users(path: &Path, users: &[(u32, &str)]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["user", "username", "email", "balance"])?;
    for (id, balance) in users {
        let username = format!("user{id}");
        let email = format!("{username}@example.com");
        wtr.write_record([id.to_string().as_str(), &username, &email, *balance])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_requests(path: &Path, requests: &[(u64, &str, u32, &str)]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["request", "kind", "user", "amount"])?;
    for (id, kind, user, amount) in requests {
        wtr.write_record([id.to_string().as_str(), *kind, &user.to_string(), *amount])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_actions(path: &Path, actions: &[(&str, u64)]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["action", "request"])?;
    for (action, request) in actions {
        wtr.write_record([*action, request.to_string().as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}
