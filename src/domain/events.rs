//! Row-level changes coming out of the stores and the normalized domain
//! events the relay publishes to admin sessions.
//!
//! Every event carries the final state of its entity together with the row
//! version that produced it, so listeners can drop duplicates and stale
//! deliveries by comparing versions.

use super::money::Balance;
use super::request::{RequestId, RequestKind, RequestStatus, SettlableRequest};
use super::user::{UserAccount, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// A raw mutation as emitted by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "lowercase")]
pub enum RowChange {
    Request { op: RowOp, row: SettlableRequest },
    User { op: RowOp, row: UserAccount },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Request(RequestId),
    User(UserId),
}

impl RowChange {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Request { row, .. } => EntityKey::Request(row.id),
            Self::User { row, .. } => EntityKey::User(row.id),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Request { row, .. } => row.version,
            Self::User { row, .. } => row.version,
        }
    }
}

/// Full state used to rebuild a listener after a gap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub requests: Vec<SettlableRequest>,
    pub users: Vec<UserAccount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    RequestCreated {
        request: SettlableRequest,
    },
    RequestSettled {
        id: RequestId,
        kind: RequestKind,
        new_status: RequestStatus,
        version: u64,
    },
    /// A settlement was compensated and the request is actionable again.
    RequestReopened {
        id: RequestId,
        kind: RequestKind,
        version: u64,
    },
    RequestRemoved {
        id: RequestId,
        version: u64,
    },
    BalanceChanged {
        user_id: UserId,
        new_balance: Balance,
        version: u64,
    },
    Resynced(Snapshot),
}

impl ChangeEvent {
    /// Maps a row change onto the domain event it represents.
    ///
    /// User deletions carry nothing an admin session acts on and map to `None`.
    pub fn from_row(change: RowChange) -> Option<Self> {
        match change {
            RowChange::Request {
                op: RowOp::Insert,
                row,
            } => Some(Self::RequestCreated { request: row }),
            RowChange::Request {
                op: RowOp::Update,
                row,
            } => Some(if row.status.is_terminal() {
                Self::RequestSettled {
                    id: row.id,
                    kind: row.kind(),
                    new_status: row.status,
                    version: row.version,
                }
            } else {
                Self::RequestReopened {
                    id: row.id,
                    kind: row.kind(),
                    version: row.version,
                }
            }),
            RowChange::Request {
                op: RowOp::Delete,
                row,
            } => Some(Self::RequestRemoved {
                id: row.id,
                version: row.version,
            }),
            RowChange::User {
                op: RowOp::Insert | RowOp::Update,
                row,
            } => Some(Self::BalanceChanged {
                user_id: row.id,
                new_balance: row.balance,
                version: row.version,
            }),
            RowChange::User {
                op: RowOp::Delete, ..
            } => None,
        }
    }

    pub fn entity(&self) -> Option<(EntityKey, u64)> {
        match self {
            Self::RequestCreated { request } => {
                Some((EntityKey::Request(request.id), request.version))
            }
            Self::RequestSettled { id, version, .. }
            | Self::RequestReopened { id, version, .. }
            | Self::RequestRemoved { id, version } => Some((EntityKey::Request(*id), *version)),
            Self::BalanceChanged {
                user_id, version, ..
            } => Some((EntityKey::User(*user_id), *version)),
            Self::Resynced(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use crate::domain::request::SettlementRef;
    use rust_decimal_macros::dec;

    fn trade() -> SettlableRequest {
        SettlableRequest::new(
            RequestId(3),
            RequestKind::Trade,
            UserId(1),
            Amount::new(dec!(50)).unwrap(),
        )
    }

    #[test]
    fn test_insert_maps_to_created() {
        let event = ChangeEvent::from_row(RowChange::Request {
            op: RowOp::Insert,
            row: trade(),
        });
        assert!(matches!(event, Some(ChangeEvent::RequestCreated { .. })));
    }

    #[test]
    fn test_update_maps_by_status() {
        let mut row = trade();
        let sref = SettlementRef::new();
        row.swap_status(RequestStatus::Pending, RequestStatus::Approved, sref);
        let settled = ChangeEvent::from_row(RowChange::Request {
            op: RowOp::Update,
            row: row.clone(),
        });
        assert_eq!(
            settled,
            Some(ChangeEvent::RequestSettled {
                id: RequestId(3),
                kind: RequestKind::Trade,
                new_status: RequestStatus::Approved,
                version: 1,
            })
        );

        row.swap_status(RequestStatus::Approved, RequestStatus::Pending, sref);
        let reopened = ChangeEvent::from_row(RowChange::Request {
            op: RowOp::Update,
            row,
        });
        assert!(matches!(
            reopened,
            Some(ChangeEvent::RequestReopened { version: 2, .. })
        ));
    }

    #[test]
    fn test_user_rows_map_to_balance_changes() {
        let user = UserAccount::new(UserId(1), "ada", "ada@example.com")
            .with_balance(Balance::new(dec!(10)));
        let event = ChangeEvent::from_row(RowChange::User {
            op: RowOp::Update,
            row: user.clone(),
        })
        .unwrap();
        assert_eq!(event.entity(), Some((EntityKey::User(UserId(1)), 0)));

        assert!(
            ChangeEvent::from_row(RowChange::User {
                op: RowOp::Delete,
                row: user,
            })
            .is_none()
        );
    }
}
