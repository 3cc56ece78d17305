//! Logging setup and the operational alert path.

use crate::domain::request::{RequestId, SettlementRef};
use crate::domain::user::UserId;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this twice is a
/// no-op.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// A partially applied financial mutation that needs a human.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub request: RequestId,
    pub owner: UserId,
    pub settlement_ref: SettlementRef,
    pub detail: String,
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &Alert);
}

pub type AlertSinkRef = Arc<dyn AlertSink>;

/// Default sink: an `error` record on the `settlement::alert` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &Alert) {
        tracing::error!(
            target: "settlement::alert",
            request = %alert.request,
            owner = %alert.owner,
            settlement_ref = %alert.settlement_ref,
            "manual reconciliation required: {}",
            alert.detail
        );
    }
}

/// Keeps every alert in memory. Used by tests and by the CLI summary.
#[derive(Debug, Default, Clone)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: &Alert) {
        TracingAlertSink.raise(alert);
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
    }
}
