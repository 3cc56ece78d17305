//! Operator-facing boundary of the settlement core.
//!
//! Authentication happens upstream; what arrives here is an
//! [`OperatorSession`] whose role is checked before anything else. Every
//! failure comes back as a [`SettlementError`] and can be rendered as an
//! [`ApiError`] without losing its kind.

use crate::application::engine::{PendingEntry, SettledRequest, SettlementEngine};
use crate::application::relay::{ChangeFeedRelay, ListenerSession};
use crate::domain::events::Snapshot;
use crate::domain::money::Balance;
use crate::domain::request::{RequestId, RequestKind, RequestStatus, SettlableRequest, SettlementTarget};
use crate::domain::user::{UserAccount, UserId};
use crate::error::{ErrorKind, Result, SettlementError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Member,
}

/// An authenticated caller, as vouched for by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSession {
    pub operator: String,
    pub role: Role,
    pub suspended: bool,
}

impl OperatorSession {
    pub fn admin(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            role: Role::Admin,
            suspended: false,
        }
    }

    pub fn member(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            role: Role::Member,
            suspended: false,
        }
    }

    fn authorize(&self) -> Result<()> {
        if self.suspended {
            return Err(SettlementError::Forbidden(format!(
                "operator {} is suspended",
                self.operator
            )));
        }
        if self.role != Role::Admin {
            return Err(SettlementError::Forbidden(format!(
                "operator {} lacks the admin role",
                self.operator
            )));
        }
        Ok(())
    }
}

/// Serializable form of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&SettlementError> for ApiError {
    fn from(e: &SettlementError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

pub struct AdminDesk {
    engine: SettlementEngine,
    relay: ChangeFeedRelay,
}

impl AdminDesk {
    pub fn new(engine: SettlementEngine, relay: ChangeFeedRelay) -> Self {
        Self { engine, relay }
    }

    /// `POST settle(requestId, targetStatus)`.
    pub async fn settle(
        &self,
        session: &OperatorSession,
        id: RequestId,
        target: SettlementTarget,
    ) -> Result<SettledRequest> {
        session.authorize()?;
        let result = self.engine.transition(id, target).await;
        match &result {
            Ok(settled) => tracing::info!(
                operator = %session.operator,
                request = %id,
                status = %settled.request.status,
                "Operator settled request"
            ),
            Err(e) => tracing::info!(
                operator = %session.operator,
                request = %id,
                kind = ?e.kind(),
                "Operator settlement refused: {e}"
            ),
        }
        result
    }

    /// Same as [`AdminDesk::settle`] for callers holding an untyped status,
    /// such as a decoded request body.
    pub async fn settle_status(
        &self,
        session: &OperatorSession,
        id: RequestId,
        status: RequestStatus,
    ) -> Result<SettledRequest> {
        session.authorize()?;
        let target = SettlementTarget::try_from(status)?;
        self.settle(session, id, target).await
    }

    /// `GET listPending(kind)`.
    pub async fn list_pending(
        &self,
        session: &OperatorSession,
        kind: RequestKind,
    ) -> Result<Vec<PendingEntry>> {
        session.authorize()?;
        self.engine.list_pending(kind).await
    }

    /// Re-reads one request, as required before retrying a failed settle.
    pub async fn request(
        &self,
        session: &OperatorSession,
        id: RequestId,
    ) -> Result<SettlableRequest> {
        session.authorize()?;
        self.engine.request(id).await
    }

    /// Opens the session's event stream. Drop it to unsubscribe.
    pub fn subscribe(&self, session: &OperatorSession) -> Result<ListenerSession> {
        session.authorize()?;
        Ok(self.relay.subscribe())
    }

    /// Full state for a session (re)building its view.
    pub async fn snapshot(&self, session: &OperatorSession) -> Result<Snapshot> {
        session.authorize()?;
        Ok(self.relay.snapshot().await?)
    }

    pub async fn edit_balance(
        &self,
        session: &OperatorSession,
        user: UserId,
        balance: Balance,
    ) -> Result<UserAccount> {
        session.authorize()?;
        tracing::info!(operator = %session.operator, user = %user, "Direct balance edit");
        self.engine.edit_balance(user, balance).await
    }

    pub fn listener_count(&self) -> usize {
        self.relay.listener_count()
    }

    pub async fn shutdown(self) {
        self.relay.shutdown().await;
    }
}
