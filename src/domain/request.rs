use super::money::{Amount, Balance};
use super::user::UserId;
use crate::error::SettlementError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of a trade or withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Trade,
    Withdrawal,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trade => f.write_str("trade"),
            Self::Withdrawal => f.write_str("withdrawal"),
        }
    }
}

impl FromStr for RequestKind {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trade" => Ok(Self::Trade),
            "withdrawal" => Ok(Self::Withdrawal),
            other => Err(SettlementError::Invalid(format!(
                "unknown request kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Approved => f.write_str("approved"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// The only statuses an operator may settle a request into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementTarget {
    Approved,
    Rejected,
}

impl From<SettlementTarget> for RequestStatus {
    fn from(target: SettlementTarget) -> Self {
        match target {
            SettlementTarget::Approved => Self::Approved,
            SettlementTarget::Rejected => Self::Rejected,
        }
    }
}

impl TryFrom<RequestStatus> for SettlementTarget {
    type Error = SettlementError;

    fn try_from(status: RequestStatus) -> Result<Self, Self::Error> {
        match status {
            RequestStatus::Approved => Ok(Self::Approved),
            RequestStatus::Rejected => Ok(Self::Rejected),
            RequestStatus::Pending => Err(SettlementError::Invalid(
                "a request cannot be settled into pending".to_string(),
            )),
        }
    }
}

impl FromStr for SettlementTarget {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approved),
            "reject" | "rejected" => Ok(Self::Rejected),
            other => Err(SettlementError::Invalid(format!(
                "unknown settlement target '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SettlementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RequestStatus::from(*self).fmt(f)
    }
}

/// Identifies one commit attempt of the settlement engine.
///
/// Written onto the request row by the status swap and used as the
/// idempotency key of the paired balance adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementRef(pub Uuid);

impl SettlementRef {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SettlementRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SettlementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind-specific display metadata. Never consulted by settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestDetails {
    Trade {
        card_name: Option<String>,
        rate: Option<Decimal>,
    },
    Withdrawal {
        bank_reference: Option<String>,
    },
}

impl RequestDetails {
    pub fn empty(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Trade => Self::Trade {
                card_name: None,
                rate: None,
            },
            RequestKind::Withdrawal => Self::Withdrawal {
                bank_reference: None,
            },
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Trade { .. } => RequestKind::Trade,
            Self::Withdrawal { .. } => RequestKind::Withdrawal,
        }
    }
}

/// A trade or withdrawal awaiting, or having received, an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlableRequest {
    pub id: RequestId,
    /// The user whose balance the request affects. Not owned.
    pub owner: UserId,
    /// Credit for a trade, debit for a withdrawal.
    pub amount: Amount,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub details: RequestDetails,
    /// Set by the commit that moved the request out of `Pending`.
    #[serde(default)]
    pub settlement_ref: Option<SettlementRef>,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl SettlableRequest {
    pub fn new(id: RequestId, kind: RequestKind, owner: UserId, amount: Amount) -> Self {
        Self {
            id,
            owner,
            amount,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            details: RequestDetails::empty(kind),
            settlement_ref: None,
            version: 0,
        }
    }

    pub fn with_details(mut self, details: RequestDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.details.kind()
    }

    /// Signed balance effect of approving this request.
    pub fn approval_delta(&self) -> Balance {
        match self.kind() {
            RequestKind::Trade => Balance::from(self.amount),
            RequestKind::Withdrawal => -Balance::from(self.amount),
        }
    }

    /// Balance effect of settling into `target`, if any.
    pub fn delta_for(&self, target: SettlementTarget) -> Option<Balance> {
        match target {
            SettlementTarget::Approved => Some(self.approval_delta()),
            SettlementTarget::Rejected => None,
        }
    }

    /// Compare-and-swap on the status field.
    ///
    /// Forward swaps leave `Pending` and stamp `settlement_ref`. The only
    /// backward swap is a compensation to `Pending`, and it must present the
    /// same ref that settled the request. Returns whether the swap happened.
    pub fn swap_status(
        &mut self,
        expected: RequestStatus,
        next: RequestStatus,
        settlement_ref: SettlementRef,
    ) -> bool {
        if self.status != expected {
            return false;
        }
        match (expected, next) {
            (RequestStatus::Pending, RequestStatus::Approved | RequestStatus::Rejected) => {
                self.settlement_ref = Some(settlement_ref);
            }
            (RequestStatus::Approved | RequestStatus::Rejected, RequestStatus::Pending)
                if self.settlement_ref == Some(settlement_ref) =>
            {
                self.settlement_ref = None;
            }
            _ => return false,
        }
        self.status = next;
        self.version += 1;
        true
    }
}
