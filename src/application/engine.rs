use crate::config::EngineConfig;
use crate::domain::money::Balance;
use crate::domain::ports::{AdjustOutcome, BalanceStoreRef, CasOutcome, RequestStoreRef};
use crate::domain::request::{
    RequestId, RequestKind, RequestStatus, SettlableRequest, SettlementRef, SettlementTarget,
};
use crate::domain::user::{Adjustment, UserAccount, UserId};
use crate::error::{Result, SettlementError, StoreError};
use crate::telemetry::{Alert, AlertSinkRef, TracingAlertSink};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A request after a successful transition, with the owner's balance as
/// observed right after the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledRequest {
    pub request: SettlableRequest,
    /// `None` only if the owner could not be read back after a rejection.
    pub owner_balance: Option<Balance>,
}

/// Owner display metadata joined onto a pending request.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerSummary {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub balance: Balance,
}

impl From<UserAccount> for OwnerSummary {
    fn from(user: UserAccount) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            balance: user.balance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub request: SettlableRequest,
    /// `None` when the owner row is missing from the balance store.
    pub owner: Option<OwnerSummary>,
}

/// Moves requests out of `Pending` and applies their balance effect.
///
/// The engine never relies on in-process serialization: the request store's
/// status compare-and-swap picks the single winner among concurrent callers,
/// and the balance store's conditional adjustment keeps concurrent debits and
/// credits for the same user commutative. The two halves are linked by a
/// [`SettlementRef`]; when the balance half fails after the status half
/// succeeded, the status swap is reverted under the same ref.
///
/// Cloning is cheap and shares the stores.
#[derive(Clone)]
pub struct SettlementEngine {
    requests: RequestStoreRef,
    balances: BalanceStoreRef,
    alerts: AlertSinkRef,
    config: EngineConfig,
}

impl SettlementEngine {
    /// Creates a new `SettlementEngine` that escalates through `tracing`.
    ///
    /// # Arguments
    ///
    /// * `requests` - The trade and withdrawal request table.
    /// * `balances` - The per-user balance table.
    pub fn new(requests: RequestStoreRef, balances: BalanceStoreRef) -> Self {
        Self {
            requests,
            balances,
            alerts: Arc::new(TracingAlertSink),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_alert_sink(mut self, alerts: AlertSinkRef) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn requests(&self) -> &RequestStoreRef {
        &self.requests
    }

    pub fn balances(&self) -> &BalanceStoreRef {
        &self.balances
    }

    /// Settles `id` into `target`.
    ///
    /// Validation happens on the caller's task and may be cancelled freely.
    /// From the status swap onward the work runs on its own task, so dropping
    /// the returned future cannot strand a half-applied settlement.
    pub async fn transition(
        &self,
        id: RequestId,
        target: SettlementTarget,
    ) -> Result<SettledRequest> {
        let request = self
            .timed("read request", self.requests.get(id))
            .await?
            .ok_or(SettlementError::RequestNotFound(id))?;

        if request.status.is_terminal() {
            tracing::debug!(
                request = %id,
                status = %request.status,
                "Transition on settled request ignored"
            );
            return Err(SettlementError::AlreadySettled {
                current: Box::new(request),
            });
        }

        if target == SettlementTarget::Approved {
            let owner = self
                .timed("read owner", self.balances.get(request.owner))
                .await?
                .ok_or(SettlementError::OwnerNotFound(request.owner))?;
            if request.kind() == RequestKind::Withdrawal
                && (owner.balance + request.approval_delta()).is_negative()
            {
                tracing::info!(
                    request = %id,
                    owner = %owner.id,
                    balance = %owner.balance,
                    amount = %request.amount,
                    "Withdrawal approval refused: insufficient balance"
                );
                return Err(SettlementError::InsufficientBalance {
                    id,
                    available: owner.balance,
                    required: request.amount,
                });
            }
        }

        let settlement_ref = SettlementRef::new();
        let owner = request.owner;
        let engine = self.clone();
        let commit =
            tokio::spawn(async move { engine.commit(request, target, settlement_ref).await });
        match commit.await {
            Ok(result) => result,
            Err(join) => Err(self.escalate(
                id,
                owner,
                settlement_ref,
                format!("settlement task aborted: {join}"),
            )),
        }
    }

    async fn commit(
        &self,
        request: SettlableRequest,
        target: SettlementTarget,
        settlement_ref: SettlementRef,
    ) -> Result<SettledRequest> {
        let id = request.id;
        let next = RequestStatus::from(target);

        let swap = self
            .timed(
                "status swap",
                self.requests
                    .compare_and_set_status(id, RequestStatus::Pending, next, settlement_ref),
            )
            .await;
        let reserved = match swap {
            Ok(CasOutcome::Swapped(row)) => row,
            Ok(CasOutcome::Mismatch(current)) => return Err(self.lost_race(current)),
            Ok(CasOutcome::Missing) => return Err(SettlementError::RequestNotFound(id)),
            Err(cause) => {
                self.resolve_ambiguous_swap(&request, next, settlement_ref, cause)
                    .await?
            }
        };

        let Some(delta) = request.delta_for(target) else {
            tracing::info!(request = %id, status = %next, "Request settled");
            let owner_balance = self.owner_balance(request.owner).await;
            return Ok(SettledRequest {
                request: reserved,
                owner_balance,
            });
        };

        let adjustment = match request.kind() {
            RequestKind::Trade => Adjustment::credit(settlement_ref, request.owner, delta),
            RequestKind::Withdrawal => Adjustment::debit(settlement_ref, request.owner, delta),
        };
        let outcome = self
            .timed("balance adjustment", self.balances.apply_adjustment(adjustment))
            .await;
        match outcome {
            Ok(AdjustOutcome::Applied(owner)) => {
                tracing::info!(
                    request = %id,
                    kind = %request.kind(),
                    owner = %owner.id,
                    delta = %delta,
                    balance = %owner.balance,
                    "Request settled"
                );
                Ok(SettledRequest {
                    request: reserved,
                    owner_balance: Some(owner.balance),
                })
            }
            Ok(AdjustOutcome::Insufficient { available }) => {
                self.compensate(&reserved, settlement_ref, "balance fell below the withdrawal amount")
                    .await?;
                Err(SettlementError::InsufficientBalance {
                    id,
                    available,
                    required: request.amount,
                })
            }
            Ok(AdjustOutcome::UnknownUser) => {
                self.compensate(&reserved, settlement_ref, "owner disappeared")
                    .await?;
                Err(SettlementError::OwnerNotFound(request.owner))
            }
            Err(cause) => {
                self.resolve_ambiguous_adjustment(reserved, settlement_ref, cause)
                    .await
            }
        }
    }

    /// The status swap failed without a definite answer. Find out whether it
    /// landed before deciding anything else.
    async fn resolve_ambiguous_swap(
        &self,
        request: &SettlableRequest,
        next: RequestStatus,
        settlement_ref: SettlementRef,
        cause: StoreError,
    ) -> Result<SettlableRequest> {
        tracing::warn!(
            request = %request.id,
            settlement_ref = %settlement_ref,
            error = %cause,
            "Status swap outcome unknown, re-reading"
        );
        match self.timed("status re-read", self.requests.get(request.id)).await {
            Ok(Some(row)) if row.settlement_ref == Some(settlement_ref) => Ok(row),
            Ok(Some(row)) if row.status == RequestStatus::Pending => Err(cause.into()),
            Ok(Some(row)) => Err(self.lost_race(row)),
            Ok(None) => Err(SettlementError::RequestNotFound(request.id)),
            Err(reread) if next == RequestStatus::Rejected => {
                // A rejection carries no balance effect, landed or not.
                tracing::warn!(request = %request.id, error = %reread, "Re-read failed");
                Err(cause.into())
            }
            Err(reread) => {
                let mut held = request.clone();
                held.status = next;
                self.compensate(
                    &held,
                    settlement_ref,
                    &format!("status swap unconfirmed: {reread}"),
                )
                .await?;
                Err(cause.into())
            }
        }
    }

    /// The adjustment failed without a definite answer. The ledger entry keyed
    /// by `settlement_ref` tells whether it landed.
    async fn resolve_ambiguous_adjustment(
        &self,
        reserved: SettlableRequest,
        settlement_ref: SettlementRef,
        cause: StoreError,
    ) -> Result<SettledRequest> {
        tracing::warn!(
            request = %reserved.id,
            settlement_ref = %settlement_ref,
            error = %cause,
            "Balance adjustment outcome unknown, checking ledger"
        );
        let lookup = self
            .timed(
                "adjustment lookup",
                self.balances.find_adjustment(reserved.owner, settlement_ref),
            )
            .await;
        match lookup {
            Ok(Some(_)) => {
                let owner_balance = self.owner_balance(reserved.owner).await;
                tracing::info!(request = %reserved.id, "Request settled after ledger check");
                Ok(SettledRequest {
                    request: reserved,
                    owner_balance,
                })
            }
            Ok(None) => {
                self.compensate(&reserved, settlement_ref, &format!("balance adjustment failed: {cause}"))
                    .await?;
                Err(cause.into())
            }
            Err(lookup) => Err(self.escalate(
                reserved.id,
                reserved.owner,
                settlement_ref,
                format!("balance adjustment outcome unknown ({cause}); ledger lookup failed ({lookup})"),
            )),
        }
    }

    /// Reverts a status swap made under `settlement_ref` back to `Pending`.
    async fn compensate(
        &self,
        held: &SettlableRequest,
        settlement_ref: SettlementRef,
        reason: &str,
    ) -> Result<()> {
        let revert = self
            .timed(
                "compensation",
                self.requests.compare_and_set_status(
                    held.id,
                    held.status,
                    RequestStatus::Pending,
                    settlement_ref,
                ),
            )
            .await;
        match revert {
            Ok(CasOutcome::Swapped(_)) => {
                tracing::warn!(
                    request = %held.id,
                    settlement_ref = %settlement_ref,
                    reason,
                    "Settlement compensated, request back to pending"
                );
                Ok(())
            }
            // Our swap never landed, or the row is gone: nothing to undo.
            Ok(CasOutcome::Mismatch(row)) if row.settlement_ref != Some(settlement_ref) => Ok(()),
            Ok(CasOutcome::Missing) => Ok(()),
            Ok(CasOutcome::Mismatch(row)) => Err(self.escalate(
                held.id,
                held.owner,
                settlement_ref,
                format!("compensation refused with status {} ({reason})", row.status),
            )),
            Err(e) => Err(self.escalate(
                held.id,
                held.owner,
                settlement_ref,
                format!("compensation failed: {e} ({reason})"),
            )),
        }
    }

    fn lost_race(&self, current: SettlableRequest) -> SettlementError {
        tracing::warn!(
            request = %current.id,
            status = %current.status,
            "Lost settlement race"
        );
        SettlementError::Conflict(current.id)
    }

    fn escalate(
        &self,
        request: RequestId,
        owner: UserId,
        settlement_ref: SettlementRef,
        detail: String,
    ) -> SettlementError {
        self.alerts.raise(&Alert {
            request,
            owner,
            settlement_ref,
            detail: detail.clone(),
        });
        SettlementError::Inconsistent {
            id: request,
            detail,
        }
    }

    async fn owner_balance(&self, owner: UserId) -> Option<Balance> {
        match self.timed("read owner", self.balances.get(owner)).await {
            Ok(user) => user.map(|u| u.balance),
            Err(e) => {
                tracing::debug!(owner = %owner, error = %e, "Owner balance unavailable");
                None
            }
        }
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{op} timed out after {:?}",
                self.config.store_timeout
            ))),
        }
    }

    /// Reads the current state of a request, for callers reconfirming before
    /// a retry.
    pub async fn request(&self, id: RequestId) -> Result<SettlableRequest> {
        self.timed("read request", self.requests.get(id))
            .await?
            .ok_or(SettlementError::RequestNotFound(id))
    }

    /// Pending requests of `kind`, newest first, with owner display data.
    pub async fn list_pending(&self, kind: RequestKind) -> Result<Vec<PendingEntry>> {
        let pending = self
            .timed("list pending", self.requests.list_pending(kind))
            .await?;
        let mut owners: HashMap<UserId, Option<OwnerSummary>> = HashMap::new();
        let mut entries = Vec::with_capacity(pending.len());
        for request in pending {
            if !owners.contains_key(&request.owner) {
                let owner = self
                    .timed("read owner", self.balances.get(request.owner))
                    .await?
                    .map(OwnerSummary::from);
                owners.insert(request.owner, owner);
            }
            let owner = owners.get(&request.owner).cloned().flatten();
            entries.push(PendingEntry { request, owner });
        }
        Ok(entries)
    }

    /// Overwrites a balance outside the settlement flow.
    ///
    /// Pending withdrawals are not re-validated against the new balance; they
    /// are checked again only when approved.
    pub async fn edit_balance(&self, user: UserId, balance: Balance) -> Result<UserAccount> {
        if balance.is_negative() {
            return Err(SettlementError::Invalid(format!(
                "balance must not be negative, got {balance}"
            )));
        }
        let updated = self
            .timed("set balance", self.balances.set_balance(user, balance))
            .await?
            .ok_or(SettlementError::OwnerNotFound(user))?;

        let pending = self
            .timed(
                "list pending",
                self.requests.list_pending(RequestKind::Withdrawal),
            )
            .await?;
        let outstanding = pending
            .iter()
            .filter(|r| r.owner == user)
            .fold(Balance::ZERO, |acc, r| acc + Balance::from(r.amount));
        if outstanding > balance {
            tracing::warn!(
                user = %user,
                balance = %balance,
                outstanding = %outstanding,
                "Balance edited below pending withdrawals; they will fail on approval"
            );
        } else {
            tracing::info!(user = %user, balance = %balance, "Balance edited directly");
        }
        Ok(updated)
    }
}
