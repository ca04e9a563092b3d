//! Flow reconciliation, retention and list persistence

pub mod flow_store;
pub mod list_store;
pub mod log_store;
pub mod retention;

pub use flow_store::{FlowChange, FlowStore, FlowTable, Ingested};
pub use list_store::{JsonFileStore, ListStore, MemoryListStore};
pub use log_store::{LogEntry, LogSource, LogStore};
pub use retention::{CappedRetention, DurableRetention, RetentionStrategy};

use crate::proxy::config::RetentionMode;
use std::path::Path;

/// Seconds since the Unix epoch, the clock flow timestamps use
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Build the flow store for the configured retention mode. Durable retention
/// needs a storage directory; without one the store falls back to the
/// in-memory cap.
pub fn open_flow_store(mode: RetentionMode, storage_dir: Option<&Path>) -> anyhow::Result<FlowStore> {
    let retention: Box<dyn RetentionStrategy> = match (mode, storage_dir) {
        (RetentionMode::InMemory { max_flows }, _) => Box::new(CappedRetention::new(max_flows)),
        (RetentionMode::Durable { horizon_days }, Some(dir)) => {
            Box::new(DurableRetention::open(dir, horizon_days)?)
        }
        (RetentionMode::Durable { .. }, None) => {
            tracing::warn!("Durable retention requested without a storage path; keeping flows in memory");
            Box::new(CappedRetention::default())
        }
    };
    let store = FlowStore::new(retention);
    if let Err(err) = store.prune() {
        tracing::warn!("Initial prune failed: {:#}", err);
    }
    Ok(store)
}
