use crate::domain::money::{Amount, Balance};
use crate::domain::request::{RequestId, SettlableRequest};
use crate::domain::user::UserId;
use serde::Serialize;
use thiserror::Error;

/// Failure reported by a store adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transient: timeout, connection loss, lock contention.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("duplicate row: {0}")]
    Duplicate(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(format!("serialization error: {e}"))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Backend(e.into_string())
    }
}

/// Flat classification of [`SettlementError`] for callers across the API
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadySettled,
    InsufficientBalance,
    Conflict,
    Unavailable,
    Inconsistent,
    Forbidden,
    Invalid,
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("request {0} not found")]
    RequestNotFound(RequestId),
    #[error("owner {0} of the request not found")]
    OwnerNotFound(UserId),
    /// Carries the terminal state the request already holds.
    #[error("request {} already settled as {}", .current.id, .current.status)]
    AlreadySettled { current: Box<SettlableRequest> },
    #[error("insufficient balance to settle request {id}: available {available}, required {required}")]
    InsufficientBalance {
        id: RequestId,
        available: Balance,
        required: Amount,
    },
    #[error("request {0} was settled concurrently; re-read before retrying")]
    Conflict(RequestId),
    #[error("store unavailable: {0}; re-read request state before retrying")]
    Unavailable(String),
    /// The status and balance halves disagree and compensation failed.
    #[error("request {id} needs manual reconciliation: {detail}")]
    Inconsistent { id: RequestId, detail: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestNotFound(_) | Self::OwnerNotFound(_) => ErrorKind::NotFound,
            Self::AlreadySettled { .. } => ErrorKind::AlreadySettled,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Inconsistent { .. } => ErrorKind::Inconsistent,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Invalid(_) => ErrorKind::Invalid,
        }
    }

    /// Whether a retry (after re-reading the request) can change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Unavailable)
    }
}

impl From<StoreError> for SettlementError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => Self::Unavailable(msg),
            StoreError::Backend(msg) => Self::Unavailable(msg),
            StoreError::Duplicate(msg) => Self::Invalid(msg),
        }
    }
}

/// Errors of the file-driven front end.
#[derive(Error, Debug)]
pub enum DeskError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = SettlementError> = std::result::Result<T, E>;
