//! Domain types and the ports the settlement core talks through.

pub mod events;
pub mod money;
pub mod ports;
pub mod request;
pub mod user;
