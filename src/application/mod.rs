//! Application layer: the settlement engine and the change notification
//! path that keeps admin sessions current.
//!
//! `SettlementEngine` is the only component that moves money. It has no
//! in-process lock; correctness under concurrent operators comes from the
//! stores' conditional writes. `ChangeFeedRelay` runs on its own `tokio` task
//! and fans store changes out to every `ListenerSession`.

pub mod engine;
pub mod projection;
pub mod relay;
