use crate::domain::request::SettlableRequest;
use crate::domain::user::UserAccount;
use crate::error::DeskError;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct BalanceRow {
    user: u32,
    balance: String,
}

#[derive(Serialize)]
struct RequestRow {
    request: u64,
    kind: String,
    user: u32,
    amount: String,
    status: String,
}

/// Writes `user,balance` rows.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_users(&mut self, users: impl IntoIterator<Item = UserAccount>) -> Result<(), DeskError> {
        for user in users {
            self.writer.serialize(BalanceRow {
                user: user.id.0,
                balance: user.balance.to_string(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes `request,kind,user,amount,status` rows.
pub struct RequestWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> RequestWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_requests(
        &mut self,
        requests: impl IntoIterator<Item = SettlableRequest>,
    ) -> Result<(), DeskError> {
        for request in requests {
            self.writer.serialize(RequestRow {
                request: request.id.0,
                kind: request.kind().to_string(),
                user: request.owner.0,
                amount: request.amount.to_string(),
                status: request.status.to_string(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Balance};
    use crate::domain::request::{RequestId, RequestKind};
    use crate::domain::user::UserId;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_writer_normalizes_decimals() {
        let mut out = Vec::new();
        BalanceWriter::new(&mut out)
            .write_users(vec![
                UserAccount::new(UserId(1), "ada", "a@x").with_balance(Balance::new(dec!(600.00))),
                UserAccount::new(UserId(2), "bo", "b@x").with_balance(Balance::new(dec!(0.50))),
            ])
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "user,balance\n1,600\n2,0.5\n");
    }

    #[test]
    fn test_request_writer() {
        let mut out = Vec::new();
        RequestWriter::new(&mut out)
            .write_requests(vec![SettlableRequest::new(
                RequestId(11),
                RequestKind::Withdrawal,
                UserId(1),
                Amount::new(dec!(400)).unwrap(),
            )])
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "request,kind,user,amount,status\n11,withdrawal,1,400,pending\n"
        );
    }
}
