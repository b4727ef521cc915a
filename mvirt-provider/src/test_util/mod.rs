//! Test utilities for mvirt-provider.
//!
//! Provides an in-memory [`RemoteStore`](crate::client::RemoteStore) that
//! behaves like the cluster API closely enough to exercise the adapter
//! without a server.

pub mod memory_store;

pub use memory_store::{Call, MemoryStore, StoreOp};

use std::time::Duration;

use crate::config::Timeouts;
use crate::schema::ConfigRecord;

/// Poll interval used by adapter tests.
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Short per-operation timeouts for tests.
pub fn test_timeouts() -> Timeouts {
    Timeouts::uniform(Duration::from_secs(5))
}

/// Turn a JSON object literal into a configuration record.
pub fn record(value: serde_json::Value) -> ConfigRecord {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
