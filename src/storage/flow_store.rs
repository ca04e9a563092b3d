//! Flow reconciliation store
//!
//! The engine reports each exchange as a series of partial events (request
//! first, response later, breakpoint state changes in between). This store
//! folds them into one [`Flow`] per id and notifies subscribers of every
//! change. How long flows are kept is decided by a [`RetentionStrategy`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::models::Flow;
use crate::proxy::protocol::{EngineEvent, FlowEvent, MessageEvent};
use crate::storage::log_store::{LogEntry, LogSource, LogStore};
use crate::storage::retention::{CappedRetention, RetentionStrategy};

const CHANGE_CHANNEL_CAPACITY: usize = 512;

/// Notification published after every store mutation
#[derive(Debug, Clone, PartialEq)]
pub enum FlowChange {
    /// A flow was inserted or patched
    Upserted(String),
    /// A streamed sub-message was appended to a flow
    Message(String),
    /// Flows dropped by the retention strategy
    Evicted(Vec<String>),
    Cleared,
    Log(LogEntry),
}

/// Outcome of ingesting one engine line
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Flow {
        /// Flow state after the merge
        flow: Flow,
        inserted: bool,
        evicted: Vec<String>,
    },
    Message {
        flow_id: String,
    },
    /// Sub-message for a flow the store does not know
    Dropped,
    Log(LogEntry),
}

struct TableEntry {
    seq: u64,
    flow: Flow,
}

/// In-memory flow table keyed by id, remembering insertion order
#[derive(Default)]
pub struct FlowTable {
    entries: HashMap<String, TableEntry>,
    next_seq: u64,
}

impl FlowTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Flow> {
        self.entries.get(id).map(|entry| &entry.flow)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.entries.values().map(|entry| &entry.flow)
    }

    /// Ascending by timestamp, then insertion. Flows without a timestamp
    /// sort as the newest.
    pub fn oldest_first(&self) -> Vec<&Flow> {
        let mut entries: Vec<&TableEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            let ta = a.flow.timestamp.unwrap_or(f64::INFINITY);
            let tb = b.flow.timestamp.unwrap_or(f64::INFINITY);
            ta.total_cmp(&tb).then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|entry| &entry.flow).collect()
    }

    pub fn newest_first(&self) -> Vec<&Flow> {
        let mut flows = self.oldest_first();
        flows.reverse();
        flows
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Flow> {
        self.entries.get_mut(id).map(|entry| &mut entry.flow)
    }

    fn insert(&mut self, flow: Flow) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(flow.id.clone(), TableEntry { seq, flow });
    }

    fn remove_all(&mut self, ids: &[String]) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct FlowStore {
    table: RwLock<FlowTable>,
    retention: Box<dyn RetentionStrategy>,
    logs: LogStore,
    changes: broadcast::Sender<FlowChange>,
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new(Box::new(CappedRetention::default()))
    }
}

impl FlowStore {
    /// Create a store, seeding it with whatever the strategy restores
    pub fn new(retention: Box<dyn RetentionStrategy>) -> Self {
        let (changes, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let mut table = FlowTable::default();
        match retention.restore() {
            Ok(flows) => {
                if !flows.is_empty() {
                    tracing::info!(
                        "Restored {} flows from {} retention",
                        flows.len(),
                        retention.name()
                    );
                }
                for flow in flows {
                    table.insert(flow);
                }
            }
            Err(err) => tracing::warn!("Failed to restore flows: {:#}", err),
        }

        Self {
            table: RwLock::new(table),
            retention,
            logs: LogStore::default(),
            changes,
        }
    }

    pub fn retention_name(&self) -> &'static str {
        self.retention.name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: FlowChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    /// Apply one line from the engine's stdout
    pub fn ingest(&self, line: &str) -> Ingested {
        match EngineEvent::parse(line) {
            EngineEvent::Flow(event) => self.apply_flow_event(event),
            EngineEvent::Message(event) => self.append_message(event),
            EngineEvent::Log(text) => Ingested::Log(self.push_log(LogSource::Stdout, text)),
        }
    }

    /// Record a log line that did not come through `ingest` (e.g. stderr)
    pub fn push_log(&self, source: LogSource, line: impl Into<String>) -> LogEntry {
        let entry = self.logs.push(source, line);
        self.notify(FlowChange::Log(entry.clone()));
        entry
    }

    pub fn apply_flow_event(&self, event: FlowEvent) -> Ingested {
        let id = event.id.clone();
        let (flow, inserted, evicted) = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let inserted = match table.get_mut(&id) {
                Some(existing) => {
                    merge_event(existing, event);
                    false
                }
                None => {
                    table.insert(flow_from_event(event));
                    true
                }
            };
            let flow = table.get(&id).cloned();
            let evicted = self.retention.evict_after_ingest(&table);
            table.remove_all(&evicted);
            (flow, inserted, evicted)
        };

        let Some(flow) = flow else {
            return Ingested::Dropped;
        };

        if let Err(err) = self.retention.record(&flow) {
            tracing::warn!("Failed to persist flow {}: {:#}", flow.id, err);
        }
        self.notify(FlowChange::Upserted(flow.id.clone()));
        self.finish_eviction(&evicted);

        Ingested::Flow {
            flow,
            inserted,
            evicted,
        }
    }

    fn append_message(&self, event: MessageEvent) -> Ingested {
        let MessageEvent { id, message } = event;
        let updated = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            match table.get_mut(&id) {
                Some(flow) => {
                    flow.messages.push(message);
                    Some(flow.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(flow) => {
                if let Err(err) = self.retention.record(&flow) {
                    tracing::warn!("Failed to persist flow {}: {:#}", flow.id, err);
                }
                self.notify(FlowChange::Message(id.clone()));
                Ingested::Message { flow_id: id }
            }
            None => {
                tracing::debug!("Dropping message for unknown flow {}", id);
                Ingested::Dropped
            }
        }
    }

    fn finish_eviction(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        tracing::info!(
            "Evicted {} flows ({} retention)",
            evicted.len(),
            self.retention.name()
        );
        if let Err(err) = self.retention.forget(evicted) {
            tracing::warn!("Failed to forget evicted flows: {:#}", err);
        }
        self.notify(FlowChange::Evicted(evicted.to_vec()));
    }

    /// All flows, newest first. Equal timestamps list the most recently
    /// inserted flow first.
    pub fn flows(&self) -> Vec<Flow> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .newest_first()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Flow> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.entries()
    }

    pub fn clear_logs(&self) {
        self.logs.clear();
    }

    /// Drop every flow from memory and from the retention backend
    pub fn clear(&self) -> anyhow::Result<()> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notify(FlowChange::Cleared);
        self.retention.clear()
    }

    /// Apply the strategy's age-based pruning. Returns flows removed from memory.
    pub fn prune(&self) -> anyhow::Result<usize> {
        self.prune_at(crate::storage::now_seconds())
    }

    pub fn prune_at(&self, now: f64) -> anyhow::Result<usize> {
        let evicted = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let evicted = self.retention.evict_on_prune(&table, now);
            table.remove_all(&evicted);
            evicted
        };
        self.finish_eviction(&evicted);
        let purged = self.retention.prune_storage(now)?;
        if purged > 0 {
            tracing::info!("Pruned {} stored flows", purged);
        }
        Ok(evicted.len())
    }
}

fn flow_from_event(event: FlowEvent) -> Flow {
    Flow {
        id: event.id,
        event: event.event,
        timestamp: event.timestamp,
        request: event.request,
        response: event.response,
        client: event.client,
        breakpoint: event.breakpoint,
        messages: Vec::new(),
    }
}

/// Patch `flow` with the fields the event carries. Absent payloads never
/// clear populated ones; breakpoint metadata is the exception and follows
/// the latest event.
fn merge_event(flow: &mut Flow, event: FlowEvent) {
    let FlowEvent {
        event: tag,
        timestamp,
        client,
        request,
        response,
        breakpoint,
        ..
    } = event;

    let (take_request, take_response) = match tag.as_str() {
        "request" => (true, false),
        "response" => (false, true),
        _ => (true, true),
    };
    if take_request {
        if let Some(request) = request {
            flow.request = Some(request);
        }
    }
    if take_response {
        if let Some(response) = response {
            flow.response = Some(response);
        }
    }
    if flow.client.is_none() {
        flow.client = client;
    }
    if flow.timestamp.is_none() {
        flow.timestamp = timestamp;
    }
    flow.breakpoint = breakpoint;
    flow.event = tag;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;
    use crate::storage::retention::DurableRetention;
    use serde_json::json;
    use tempfile::tempdir;

    fn request_line(id: &str, url: &str, ts: f64) -> String {
        json!({
            "event": "request",
            "id": id,
            "timestamp": ts,
            "client": {"ip": "10.0.0.2", "port": 50000},
            "request": {"method": "GET", "url": url, "headers": {}, "body": ""},
            "response": null,
        })
        .to_string()
    }

    fn response_line(id: &str, status: u16) -> String {
        json!({
            "event": "response",
            "id": id,
            "timestamp": 1.0,
            "request": null,
            "response": {"status": status, "headers": {"Content-Type": "text/plain"}, "body": "ok"},
        })
        .to_string()
    }

    #[test]
    fn response_patches_existing_flow() {
        let store = FlowStore::default();
        let first = store.ingest(&request_line("f1", "https://a.com/x", 100.0));
        assert!(matches!(first, Ingested::Flow { inserted: true, .. }));

        let second = store.ingest(&response_line("f1", 201));
        assert!(matches!(second, Ingested::Flow { inserted: false, .. }));

        let flow = store.get("f1").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(flow.event, "response");
        assert_eq!(flow.method(), "GET");
        assert_eq!(flow.status(), Some(201));
        assert_eq!(flow.timestamp, Some(100.0));
        assert_eq!(flow.client.unwrap().ip, "10.0.0.2");
    }

    #[test]
    fn request_event_does_not_touch_response() {
        let store = FlowStore::default();
        store.ingest(&request_line("f1", "https://a.com/x", 100.0));
        store.ingest(&response_line("f1", 200));

        let line = json!({
            "event": "request",
            "id": "f1",
            "request": {"method": "POST", "url": "https://a.com/y"},
            "response": {"status": 500},
        })
        .to_string();
        store.ingest(&line);

        let flow = store.get("f1").unwrap();
        assert_eq!(flow.method(), "POST");
        assert_eq!(flow.status(), Some(200));
    }

    #[test]
    fn breakpoint_metadata_follows_latest_event() {
        let store = FlowStore::default();
        let paused = json!({
            "event": "request",
            "id": "f1",
            "timestamp": 5.0,
            "request": {"method": "GET", "url": "https://a.com/x"},
            "breakpoint": {"phase": "request", "state": "waiting", "key": "a.com/x"},
        })
        .to_string();
        store.ingest(&paused);
        assert!(store.get("f1").unwrap().is_waiting_at(Phase::Request));

        let released = json!({
            "event": "update",
            "id": "f1",
            "request": null,
        })
        .to_string();
        store.ingest(&released);

        let flow = store.get("f1").unwrap();
        assert!(flow.breakpoint.is_none());
        assert_eq!(flow.url(), "https://a.com/x");
    }

    #[test]
    fn messages_append_to_parent_or_drop() {
        let store = FlowStore::default();
        store.ingest(&request_line("ws", "wss://a.com/socket", 1.0));

        let msg = json!({
            "event": "websocket_message",
            "id": "ws",
            "message": {"direction": "client_to_server", "content": "ping"},
        })
        .to_string();
        assert_eq!(
            store.ingest(&msg),
            Ingested::Message {
                flow_id: "ws".into()
            }
        );

        let orphan = msg.replace("\"ws\"", "\"ghost\"");
        assert_eq!(store.ingest(&orphan), Ingested::Dropped);

        let flow = store.get("ws").unwrap();
        assert_eq!(flow.messages.len(), 1);
        assert_eq!(flow.messages[0].content, "ping");
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn non_json_lines_become_logs() {
        let store = FlowStore::default();
        let result = store.ingest("[DEBUG] comando ricevuto");
        match result {
            Ingested::Log(entry) => assert_eq!(entry.line, "[DEBUG] comando ricevuto"),
            other => panic!("expected log, got {other:?}"),
        }
        assert!(store.is_empty());
        assert_eq!(store.logs().len(), 1);
    }

    #[test]
    fn truncated_json_leaves_flow_untouched() {
        let store = FlowStore::default();
        store.ingest(&request_line("f1", "https://a.com/x", 100.0));
        let before = store.get("f1").unwrap();

        let truncated = r#"{"event":"response","id":"f1","#;
        assert!(matches!(store.ingest(truncated), Ingested::Log(_)));

        assert_eq!(store.get("f1").unwrap(), before);
        assert_eq!(store.len(), 1);
        assert_eq!(store.logs().last().unwrap().line, truncated);
    }

    #[test]
    fn capped_retention_keeps_paused_flows() {
        let store = FlowStore::new(Box::new(CappedRetention::new(2)));
        let paused = json!({
            "event": "request",
            "id": "paused",
            "timestamp": 1.0,
            "request": {"method": "GET", "url": "https://a.com/p"},
            "breakpoint": {"phase": "request", "state": "waiting", "key": "a.com/p"},
        })
        .to_string();
        store.ingest(&paused);
        store.ingest(&request_line("n1", "https://a.com/1", 2.0));
        store.ingest(&request_line("n2", "https://a.com/2", 3.0));

        assert!(store.get("paused").is_some());
        assert!(store.get("n1").is_none());
        assert!(store.get("n2").is_some());
    }

    #[test]
    fn flows_are_listed_newest_first() {
        let store = FlowStore::default();
        store.ingest(&request_line("old", "https://a.com/1", 10.0));
        store.ingest(&request_line("new", "https://a.com/2", 30.0));
        store.ingest(&request_line("tie-a", "https://a.com/3", 20.0));
        store.ingest(&request_line("tie-b", "https://a.com/4", 20.0));

        let ids: Vec<_> = store.flows().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["new", "tie-b", "tie-a", "old"]);
    }

    #[test]
    fn capped_retention_evicts_oldest_by_timestamp() {
        let store = FlowStore::new(Box::new(CappedRetention::new(2)));
        let mut rx = store.subscribe();

        store.ingest(&request_line("b", "https://a.com/b", 20.0));
        store.ingest(&request_line("a", "https://a.com/a", 10.0));
        let third = store.ingest(&request_line("c", "https://a.com/c", 30.0));

        match third {
            Ingested::Flow { evicted, .. } => assert_eq!(evicted, vec!["a".to_string()]),
            other => panic!("expected flow, got {other:?}"),
        }
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());

        let mut saw_eviction = false;
        while let Ok(change) = rx.try_recv() {
            if change == FlowChange::Evicted(vec!["a".into()]) {
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }

    #[test]
    fn durable_retention_survives_reopen_and_prunes() {
        let dir = tempdir().expect("temp dir");
        let now = crate::storage::now_seconds();
        {
            let retention = DurableRetention::open(dir.path(), 7).unwrap();
            let store = FlowStore::new(Box::new(retention));
            store.ingest(&request_line("fresh", "https://a.com/1", now - 60.0));
            store.ingest(&response_line("fresh", 204));
            store.ingest(&request_line("stale", "https://a.com/2", now - 8.0 * 86_400.0));
        }

        let retention = DurableRetention::open(dir.path(), 7).unwrap();
        let store = FlowStore::new(Box::new(retention));
        // Stale rows are not restored
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("fresh").unwrap().status(), Some(204));

        let removed = store.prune_at(now + 8.0 * 86_400.0).unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());

        let reopened = DurableRetention::open(dir.path(), 7).unwrap();
        assert_eq!(reopened.count().unwrap(), 0);
    }

    #[test]
    fn clear_empties_memory_and_disk() {
        let dir = tempdir().expect("temp dir");
        let store = FlowStore::new(Box::new(DurableRetention::open(dir.path(), 7).unwrap()));
        store.ingest(&request_line("f1", "https://a.com/1", crate::storage::now_seconds()));
        store.clear().unwrap();
        assert!(store.is_empty());

        let reopened = DurableRetention::open(dir.path(), 7).unwrap();
        assert_eq!(reopened.count().unwrap(), 0);
    }
}
