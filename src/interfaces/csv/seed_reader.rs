use crate::domain::money::{Amount, Balance};
use crate::domain::request::{RequestDetails, RequestId, RequestKind, SettlableRequest};
use crate::domain::user::{UserAccount, UserId};
use crate::error::{DeskError, SettlementError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

fn csv_reader<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(source)
}

/// One row of a users file: `user, username, email, balance`.
#[derive(Debug, Deserialize)]
struct UserRecord {
    user: u32,
    username: String,
    email: String,
    balance: Decimal,
}

impl TryFrom<UserRecord> for UserAccount {
    type Error = SettlementError;

    fn try_from(record: UserRecord) -> Result<Self, Self::Error> {
        let balance = Balance::new(record.balance);
        if balance.is_negative() {
            return Err(SettlementError::Invalid(format!(
                "user {}: balance must not be negative, got {balance}",
                record.user
            )));
        }
        Ok(UserAccount::new(UserId(record.user), record.username, record.email)
            .with_balance(balance))
    }
}

/// One row of a requests file:
/// `request, kind, user, amount[, created_at, card, rate, bank]`.
#[derive(Debug, Deserialize)]
struct RequestRecord {
    request: u64,
    kind: String,
    user: u32,
    amount: Decimal,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    card: Option<String>,
    #[serde(default)]
    rate: Option<Decimal>,
    #[serde(default)]
    bank: Option<String>,
}

impl TryFrom<RequestRecord> for SettlableRequest {
    type Error = SettlementError;

    fn try_from(record: RequestRecord) -> Result<Self, Self::Error> {
        let kind: RequestKind = record.kind.parse()?;
        let amount = Amount::new(record.amount)?;
        let details = match kind {
            RequestKind::Trade => RequestDetails::Trade {
                card_name: record.card,
                rate: record.rate,
            },
            RequestKind::Withdrawal => RequestDetails::Withdrawal {
                bank_reference: record.bank,
            },
        };
        let mut request =
            SettlableRequest::new(RequestId(record.request), kind, UserId(record.user), amount)
                .with_details(details);
        if let Some(created_at) = record.created_at {
            request = request.with_created_at(created_at);
        }
        Ok(request)
    }
}

/// Reads seed users from a CSV source.
pub struct UserReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> UserReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: csv_reader(source),
        }
    }

    /// Lazily yields users; malformed rows yield an error and do not stop
    /// the stream.
    pub fn users(self) -> impl Iterator<Item = Result<UserAccount, DeskError>> {
        self.reader
            .into_deserialize::<UserRecord>()
            .map(|result| {
                let record = result?;
                Ok(UserAccount::try_from(record)?)
            })
    }
}

/// Reads pending requests from a CSV source. Every request enters as
/// `Pending`.
pub struct RequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RequestReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: csv_reader(source),
        }
    }

    pub fn requests(self) -> impl Iterator<Item = Result<SettlableRequest, DeskError>> {
        self.reader
            .into_deserialize::<RequestRecord>()
            .map(|result| {
                let record = result?;
                Ok(SettlableRequest::try_from(record)?)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::RequestStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn test_user_reader() {
        let data = "user, username, email, balance\n1, ada, ada@example.com, 1000\n2, bo, bo@example.com, 0.5";
        let users: Vec<_> = UserReader::new(data.as_bytes()).users().collect();
        assert_eq!(users.len(), 2);
        let ada = users[0].as_ref().unwrap();
        assert_eq!(ada.id, UserId(1));
        assert_eq!(ada.balance, Balance::new(dec!(1000)));
    }

    #[test]
    fn test_user_reader_refuses_negative_balance() {
        let data = "user, username, email, balance\n1, ada, ada@example.com, -5\n2, bo, bo@example.com, 0";
        let users: Vec<_> = UserReader::new(data.as_bytes()).users().collect();
        assert!(matches!(
            users[0],
            Err(DeskError::Settlement(SettlementError::Invalid(_)))
        ));
        assert_eq!(users[1].as_ref().unwrap().balance, Balance::ZERO);
    }

    #[test]
    fn test_request_reader_with_optional_columns() {
        let data = "request, kind, user, amount, created_at, card, rate, bank\n\
                    10, trade, 1, 5000, 2025-01-02T03:04:05Z, Amazon, 1450,\n\
                    11, withdrawal, 1, 400, , , , GTB-0123";
        let requests: Vec<_> = RequestReader::new(data.as_bytes()).requests().collect();
        assert_eq!(requests.len(), 2);

        let trade = requests[0].as_ref().unwrap();
        assert_eq!(trade.kind(), RequestKind::Trade);
        assert_eq!(trade.status, RequestStatus::Pending);
        assert_eq!(trade.created_at.to_rfc3339(), "2025-01-02T03:04:05+00:00");
        assert_eq!(
            trade.details,
            RequestDetails::Trade {
                card_name: Some("Amazon".to_string()),
                rate: Some(dec!(1450)),
            }
        );

        let withdrawal = requests[1].as_ref().unwrap();
        assert_eq!(withdrawal.kind(), RequestKind::Withdrawal);
        assert_eq!(withdrawal.amount, Amount::new(dec!(400)).unwrap());
    }

    #[test]
    fn test_request_reader_rejects_bad_rows() {
        let data = "request, kind, user, amount\n1, refund, 1, 10\n2, trade, 1, -5\n3, trade, 1, 5";
        let requests: Vec<_> = RequestReader::new(data.as_bytes()).requests().collect();
        assert!(matches!(
            requests[0],
            Err(DeskError::Settlement(SettlementError::Invalid(_)))
        ));
        assert!(requests[1].is_err());
        assert!(requests[2].is_ok());
    }
}
