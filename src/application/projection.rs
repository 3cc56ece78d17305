use crate::domain::events::{ChangeEvent, Snapshot};
use crate::domain::money::{Amount, Balance};
use crate::domain::request::{RequestId, RequestKind, RequestStatus};
use crate::domain::user::UserId;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestView {
    pub kind: RequestKind,
    pub status: RequestStatus,
    /// Unknown when the session first heard of the request through a
    /// settlement event rather than its creation.
    pub owner: Option<UserId>,
    pub amount: Option<Amount>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceView {
    pub balance: Balance,
    pub version: u64,
}

fn is_newer(known: Option<u64>, incoming: u64) -> bool {
    known.is_none_or(|v| incoming > v)
}

/// The read-through cache an admin session keeps of the stores.
///
/// Applying an event is idempotent: events carry final state and a row
/// version, and anything not newer than what is held is ignored.
#[derive(Debug, Clone, Default)]
pub struct SessionProjection {
    requests: HashMap<RequestId, RequestView>,
    removed: HashMap<RequestId, u64>,
    balances: HashMap<UserId, BalanceView>,
}

impl SessionProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut projection = Self::new();
        projection.reset(snapshot);
        projection
    }

    /// Applies one event. Returns whether anything changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::RequestCreated { request } => {
                if !self.request_is_newer(request.id, request.version) {
                    return false;
                }
                self.requests.insert(
                    request.id,
                    RequestView {
                        kind: request.kind(),
                        status: request.status,
                        owner: Some(request.owner),
                        amount: Some(request.amount),
                        version: request.version,
                    },
                );
                true
            }
            ChangeEvent::RequestSettled {
                id,
                kind,
                new_status,
                version,
            } => self.set_status(*id, *kind, *new_status, *version),
            ChangeEvent::RequestReopened { id, kind, version } => {
                self.set_status(*id, *kind, RequestStatus::Pending, *version)
            }
            ChangeEvent::RequestRemoved { id, version } => {
                if !self.request_is_newer(*id, *version) {
                    return false;
                }
                self.requests.remove(id);
                self.removed.insert(*id, *version);
                true
            }
            ChangeEvent::BalanceChanged {
                user_id,
                new_balance,
                version,
            } => {
                let known = self.balances.get(user_id).map(|b| b.version);
                if !is_newer(known, *version) {
                    return false;
                }
                self.balances.insert(
                    *user_id,
                    BalanceView {
                        balance: *new_balance,
                        version: *version,
                    },
                );
                true
            }
            ChangeEvent::Resynced(snapshot) => {
                self.reset(snapshot);
                true
            }
        }
    }

    /// Replaces everything held with `snapshot`.
    pub fn reset(&mut self, snapshot: &Snapshot) {
        self.requests = snapshot
            .requests
            .iter()
            .map(|r| {
                (
                    r.id,
                    RequestView {
                        kind: r.kind(),
                        status: r.status,
                        owner: Some(r.owner),
                        amount: Some(r.amount),
                        version: r.version,
                    },
                )
            })
            .collect();
        self.removed.clear();
        self.balances = snapshot
            .users
            .iter()
            .map(|u| {
                (
                    u.id,
                    BalanceView {
                        balance: u.balance,
                        version: u.version,
                    },
                )
            })
            .collect();
    }

    fn request_is_newer(&self, id: RequestId, version: u64) -> bool {
        let known = self
            .requests
            .get(&id)
            .map(|r| r.version)
            .or_else(|| self.removed.get(&id).copied());
        is_newer(known, version)
    }

    fn set_status(
        &mut self,
        id: RequestId,
        kind: RequestKind,
        status: RequestStatus,
        version: u64,
    ) -> bool {
        if !self.request_is_newer(id, version) {
            return false;
        }
        let view = self.requests.entry(id).or_insert(RequestView {
            kind,
            status,
            owner: None,
            amount: None,
            version,
        });
        view.status = status;
        view.version = version;
        true
    }

    pub fn request(&self, id: RequestId) -> Option<&RequestView> {
        self.requests.get(&id)
    }

    pub fn balance(&self, user: UserId) -> Option<Balance> {
        self.balances.get(&user).map(|b| b.balance)
    }

    /// Pending request ids of `kind`, ascending.
    pub fn pending(&self, kind: RequestKind) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .requests
            .iter()
            .filter(|(_, r)| r.kind == kind && r.status == RequestStatus::Pending)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}
