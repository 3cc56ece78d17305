use crate::domain::request::{RequestId, SettlementTarget};
use crate::error::{DeskError, SettlementError};
use serde::Deserialize;
use std::io::Read;

/// An operator decision to run through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementAction {
    pub request: RequestId,
    pub target: SettlementTarget,
}

#[derive(Debug, Deserialize)]
struct ActionRecord {
    action: String,
    request: u64,
}

impl TryFrom<ActionRecord> for SettlementAction {
    type Error = SettlementError;

    fn try_from(record: ActionRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            request: RequestId(record.request),
            target: record.action.parse()?,
        })
    }
}

/// Reads settlement actions (`action, request`) from a CSV source.
///
/// Wraps `csv::Reader`, trimming whitespace and tolerating ragged rows.
pub struct ActionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ActionReader<R> {
    /// Creates a new `ActionReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and parses actions.
    pub fn actions(self) -> impl Iterator<Item = Result<SettlementAction, DeskError>> {
        self.reader
            .into_deserialize::<ActionRecord>()
            .map(|result| Ok(SettlementAction::try_from(result?)?))
    }
}
