use super::money::Balance;
use super::request::SettlementRef;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user as seen by the back office: display fields plus the one balance
/// settlement mutates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub balance: Balance,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl UserAccount {
    pub fn new(id: UserId, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: email.into(),
            balance: Balance::ZERO,
            version: 0,
        }
    }

    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }

    /// Applies `adjustment` in place if the floor check allows it.
    ///
    /// Returns the balance that blocked the adjustment otherwise.
    pub fn apply(&mut self, adjustment: &Adjustment) -> Result<(), Balance> {
        let next = self.balance + adjustment.delta;
        if adjustment.require_non_negative && next.is_negative() {
            return Err(self.balance);
        }
        self.balance = next;
        self.version += 1;
        Ok(())
    }
}

/// One commutative balance change, keyed by the settlement that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub settlement_ref: SettlementRef,
    pub user: UserId,
    pub delta: Balance,
    /// Refuse the change if it would take the balance below zero.
    pub require_non_negative: bool,
}

impl Adjustment {
    pub fn credit(settlement_ref: SettlementRef, user: UserId, delta: Balance) -> Self {
        Self {
            settlement_ref,
            user,
            delta,
            require_non_negative: false,
        }
    }

    pub fn debit(settlement_ref: SettlementRef, user: UserId, delta: Balance) -> Self {
        Self {
            settlement_ref,
            user,
            delta,
            require_non_negative: true,
        }
    }
}
