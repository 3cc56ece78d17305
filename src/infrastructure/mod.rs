//! Store adapters implementing the domain ports.

pub mod feed;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
