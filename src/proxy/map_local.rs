//! Map-local rule engine
//!
//! Owns the persistent host+path substitution rules, named collections of
//! rules, and the recorder that captures rules created during a session into
//! a new collection. Every rule mutation is mirrored to the engine through
//! the [`CommandSink`].

use anyhow::Context;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::models::map_local::{normalize_host, normalize_path};
use crate::models::{Flow, Headers, MapCollection, MapRule};
use crate::proxy::protocol::EngineCommand;
use crate::proxy::supervisor::CommandSink;
use crate::storage::list_store::{load_or_empty, save_logged, write_atomically, ListStore};

/// Headers describing the upstream encoding of a body; they no longer apply
/// once the body is served locally.
const TRANSPORT_HEADERS: [&str; 3] = ["content-length", "content-encoding", "transfer-encoding"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapLocalError {
    #[error("host must not be empty")]
    InvalidHost,
    #[error("no map-local rule for {0}")]
    UnknownRule(String),
    #[error("no collection with id {0}")]
    UnknownCollection(String),
    #[error("a recording session is already active")]
    RecordingActive,
}

/// Editable fields of a map-local rule
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEdit {
    pub body: String,
    pub status: u16,
    pub headers: Headers,
    pub is_enabled: bool,
}

impl From<&MapRule> for RuleEdit {
    fn from(rule: &MapRule) -> Self {
        Self {
            body: rule.body.clone(),
            status: rule.status,
            headers: rule.headers.clone(),
            is_enabled: rule.is_enabled,
        }
    }
}

#[derive(Default)]
struct MapLocalState {
    rules: Vec<MapRule>,
    collections: Vec<MapCollection>,
    /// Rules captured by the active recording session
    recording: Option<MapCollection>,
}

impl MapLocalState {
    fn rule_mut(&mut self, key: &str) -> Option<&mut MapRule> {
        self.rules.iter_mut().find(|r| r.key == key)
    }

    fn collection_mut(&mut self, id: &str) -> Result<&mut MapCollection, MapLocalError> {
        self.collections
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| MapLocalError::UnknownCollection(id.to_string()))
    }

    fn record(&mut self, rule: &MapRule) {
        if let Some(session) = self.recording.as_mut() {
            session.upsert_rule(rule.clone());
        }
    }
}

pub struct MapLocalManager {
    state: Mutex<MapLocalState>,
    rule_store: Box<dyn ListStore<MapRule>>,
    collection_store: Box<dyn ListStore<MapCollection>>,
    sink: Arc<dyn CommandSink>,
}

impl MapLocalManager {
    /// Load persisted rules and collections. Load failures start empty.
    pub fn new(
        rule_store: Box<dyn ListStore<MapRule>>,
        collection_store: Box<dyn ListStore<MapCollection>>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        let rules = load_or_empty(rule_store.as_ref(), "map-local rules");
        let collections = load_or_empty(collection_store.as_ref(), "map-local collections");
        tracing::debug!(
            "Loaded {} map-local rules and {} collections",
            rules.len(),
            collections.len()
        );

        Self {
            state: Mutex::new(MapLocalState {
                rules,
                collections,
                recording: None,
            }),
            rule_store,
            collection_store,
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MapLocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_rules(&self, state: &MapLocalState) {
        save_logged(self.rule_store.as_ref(), &state.rules, "map-local rules");
    }

    fn persist_collections(&self, state: &MapLocalState) {
        save_logged(
            self.collection_store.as_ref(),
            &state.collections,
            "map-local collections",
        );
    }

    fn push_rule(&self, rule: &MapRule) {
        self.sink.send_command(&EngineCommand::mock_rule(rule));
    }

    // ---- rules ----

    pub fn rules(&self) -> Vec<MapRule> {
        self.lock().rules.clone()
    }

    pub fn rule(&self, key: &str) -> Option<MapRule> {
        self.lock().rules.iter().find(|r| r.key == key).cloned()
    }

    /// Create an empty rule for `host + path`. An existing rule with the same
    /// key is returned untouched. `None` when the host is empty.
    pub fn create_rule(&self, host: &str, path: &str) -> Option<MapRule> {
        let rule = MapRule::new(host, path)?;
        let mut state = self.lock();
        if let Some(existing) = state.rules.iter().find(|r| r.key == rule.key) {
            return Some(existing.clone());
        }

        state.rules.push(rule.clone());
        state.record(&rule);
        self.persist_rules(&state);
        self.push_rule(&rule);
        tracing::info!("Created map-local rule {}", rule.key);
        Some(rule)
    }

    /// Create (or overwrite) a rule answering the flow's host+path with the
    /// flow's captured response
    pub fn map_flow(&self, flow: &Flow) -> Option<MapRule> {
        let request = flow.request.as_ref()?;
        let parts = request.url_parts();
        let mut rule = MapRule::new(&parts.host, &parts.path)?;
        rule.scheme = parts.scheme;

        if let Some(response) = &flow.response {
            rule.status = response.status.unwrap_or(rule.status);
            rule.body = response.body.clone().unwrap_or_default();
            rule.headers = response
                .headers
                .iter()
                .flatten()
                .filter(|(name, _)| {
                    !TRANSPORT_HEADERS
                        .iter()
                        .any(|h| name.eq_ignore_ascii_case(h))
                })
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
        }

        let mut state = self.lock();
        match state.rule_mut(&rule.key) {
            Some(existing) => *existing = rule.clone(),
            None => state.rules.push(rule.clone()),
        }
        state.record(&rule);
        self.persist_rules(&state);
        self.push_rule(&rule);
        tracing::info!("Mapped flow {} to local rule {}", flow.id, rule.key);
        Some(rule)
    }

    pub fn update_rule(&self, key: &str, edit: RuleEdit) -> Result<MapRule, MapLocalError> {
        let mut state = self.lock();
        let rule = state
            .rule_mut(key)
            .ok_or_else(|| MapLocalError::UnknownRule(key.to_string()))?;
        rule.body = edit.body;
        rule.status = edit.status;
        rule.headers = edit.headers;
        rule.is_enabled = edit.is_enabled;
        let rule = rule.clone();

        state.record(&rule);
        self.persist_rules(&state);
        self.push_rule(&rule);
        Ok(rule)
    }

    /// Move a rule to a new host+path. The old key is deleted on the engine.
    pub fn rekey_rule(&self, key: &str, host: &str, path: &str) -> Result<MapRule, MapLocalError> {
        let host = normalize_host(host).ok_or(MapLocalError::InvalidHost)?;
        let path = normalize_path(path);
        let new_key = format!("{host}{path}");

        let mut state = self.lock();
        let index = state
            .rules
            .iter()
            .position(|r| r.key == key)
            .ok_or_else(|| MapLocalError::UnknownRule(key.to_string()))?;

        let mut rule = state.rules[index].clone();
        rule.key = new_key.clone();
        rule.host = host;
        rule.path = path;

        // Replacing onto an existing key merges the two rules
        state.rules.retain(|r| r.key != new_key || r.key == key);
        if let Some(slot) = state.rules.iter_mut().find(|r| r.key == key) {
            *slot = rule.clone();
        }
        state.record(&rule);
        self.persist_rules(&state);

        if key != new_key {
            self.sink.send_command(&EngineCommand::DeleteRule {
                key: key.to_string(),
            });
        }
        self.push_rule(&rule);
        Ok(rule)
    }

    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<MapRule, MapLocalError> {
        let mut state = self.lock();
        let rule = state
            .rule_mut(key)
            .ok_or_else(|| MapLocalError::UnknownRule(key.to_string()))?;
        rule.is_enabled = enabled;
        let rule = rule.clone();
        state.record(&rule);

        self.persist_rules(&state);
        self.push_rule(&rule);
        Ok(rule)
    }

    pub fn delete_rule(&self, key: &str) -> Result<MapRule, MapLocalError> {
        let mut state = self.lock();
        let index = state
            .rules
            .iter()
            .position(|r| r.key == key)
            .ok_or_else(|| MapLocalError::UnknownRule(key.to_string()))?;
        let removed = state.rules.remove(index);

        self.persist_rules(&state);
        self.sink.send_command(&EngineCommand::DeleteRule {
            key: removed.key.clone(),
        });
        tracing::info!("Deleted map-local rule {}", removed.key);
        Ok(removed)
    }

    /// Send every standalone rule to the engine, e.g. after it (re)started.
    /// Returns the number of commands sent.
    pub fn push_rules(&self) -> usize {
        let state = self.lock();
        for rule in &state.rules {
            self.push_rule(rule);
        }
        state.rules.len()
    }

    // ---- collections ----

    pub fn collections(&self) -> Vec<MapCollection> {
        self.lock().collections.clone()
    }

    pub fn collection(&self, id: &str) -> Option<MapCollection> {
        self.lock().collections.iter().find(|c| c.id == id).cloned()
    }

    pub fn create_collection(&self, name: &str, rules: Vec<MapRule>) -> MapCollection {
        let collection = MapCollection::new(name.trim(), rules);
        let mut state = self.lock();
        state.collections.push(collection.clone());
        self.persist_collections(&state);
        collection
    }

    pub fn rename_collection(&self, id: &str, name: &str) -> Result<MapCollection, MapLocalError> {
        let mut state = self.lock();
        let collection = state.collection_mut(id)?;
        collection.name = name.trim().to_string();
        let collection = collection.clone();
        self.persist_collections(&state);
        Ok(collection)
    }

    /// Remove a collection. Member rules already pushed to the engine stay
    /// there until the caller disables and pushes the collection.
    pub fn delete_collection(&self, id: &str) -> Result<MapCollection, MapLocalError> {
        let mut state = self.lock();
        let index = state
            .collections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| MapLocalError::UnknownCollection(id.to_string()))?;
        let removed = state.collections.remove(index);
        self.persist_collections(&state);
        Ok(removed)
    }

    /// Flip a collection and return its members. Nothing is sent to the
    /// engine; follow up with [`MapLocalManager::push_collection`].
    pub fn set_collection_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Vec<MapRule>, MapLocalError> {
        let mut state = self.lock();
        let collection = state.collection_mut(id)?;
        collection.set_enabled(enabled);
        let members = collection.rules.clone();
        self.persist_collections(&state);
        Ok(members)
    }

    /// Send `mock_rule` for every member with the collection's state. A
    /// member is only live when both it and the collection are enabled.
    pub fn push_collection(&self, id: &str) -> Result<usize, MapLocalError> {
        let state = self.lock();
        let collection = state
            .collections
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| MapLocalError::UnknownCollection(id.to_string()))?;
        for rule in &collection.rules {
            let live = collection.is_enabled && rule.is_enabled;
            self.sink
                .send_command(&EngineCommand::mock_rule_with_state(rule, live));
        }
        Ok(collection.rules.len())
    }

    pub fn update_collection_rule(
        &self,
        id: &str,
        rule: MapRule,
    ) -> Result<MapCollection, MapLocalError> {
        let rule = renormalize(rule).ok_or(MapLocalError::InvalidHost)?;
        let mut state = self.lock();
        let collection = state.collection_mut(id)?;
        collection.upsert_rule(rule);
        let collection = collection.clone();
        self.persist_collections(&state);
        Ok(collection)
    }

    pub fn remove_rule_from_collection(&self, id: &str, key: &str) -> Result<bool, MapLocalError> {
        let mut state = self.lock();
        let removed = state.collection_mut(id)?.remove_rule(key);
        if removed {
            self.persist_collections(&state);
        }
        Ok(removed)
    }

    // ---- recording ----

    pub fn is_recording(&self) -> bool {
        self.lock().recording.is_some()
    }

    pub fn start_recording(&self, name: &str) -> Result<(), MapLocalError> {
        let mut state = self.lock();
        if state.recording.is_some() {
            return Err(MapLocalError::RecordingActive);
        }
        state.recording = Some(MapCollection::new(name.trim(), Vec::new()));
        tracing::info!("Started recording map-local collection {:?}", name.trim());
        Ok(())
    }

    /// Capture a rule into the active session; ignored when not recording
    pub fn record_during_session(&self, rule: &MapRule) {
        self.lock().record(rule);
    }

    /// End the session. With `save` the captured rules become a new
    /// (disabled) collection; an empty session saves nothing.
    pub fn stop_recording(&self, save: bool) -> Option<MapCollection> {
        let mut state = self.lock();
        let session = state.recording.take()?;
        if !save {
            tracing::info!("Discarded recording {:?}", session.name);
            return None;
        }
        if session.rules.is_empty() {
            tracing::info!("Recording {:?} captured no rules", session.name);
            return None;
        }

        let mut collection = session;
        collection.created_at = Utc::now();
        state.collections.push(collection.clone());
        self.persist_collections(&state);
        tracing::info!(
            "Saved recording {:?} with {} rules",
            collection.name,
            collection.rules.len()
        );
        Some(collection)
    }

    // ---- import / export ----

    /// Write a collection as pretty JSON
    pub fn export_collection(&self, id: &str, path: &Path) -> anyhow::Result<()> {
        let collection = self
            .collection(id)
            .ok_or_else(|| MapLocalError::UnknownCollection(id.to_string()))?;
        let json = serde_json::to_string_pretty(&collection)?;
        write_atomically(path, json.as_bytes())
            .with_context(|| format!("exporting collection to {:?}", path))
    }

    /// Read a collection written by [`MapLocalManager::export_collection`].
    /// The import gets a fresh id and starts disabled.
    pub fn import_collection(&self, path: &Path) -> anyhow::Result<MapCollection> {
        let data = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let imported: MapCollection =
            serde_json::from_str(&data).with_context(|| format!("decoding {:?}", path))?;

        let rules: Vec<MapRule> = imported.rules.into_iter().filter_map(renormalize).collect();
        let collection = MapCollection::new(imported.name, rules);

        let mut state = self.lock();
        state.collections.push(collection.clone());
        self.persist_collections(&state);
        tracing::info!(
            "Imported collection {:?} ({} rules)",
            collection.name,
            collection.rules.len()
        );
        Ok(collection)
    }
}

/// Recompute host, path and key of a rule coming from outside the manager
fn renormalize(mut rule: MapRule) -> Option<MapRule> {
    rule.host = normalize_host(&rule.host)?;
    rule.path = normalize_path(&rule.path);
    rule.key = format!("{}{}", rule.host, rule.path);
    Some(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Request, Response};
    use crate::proxy::test_support::RecordingSink;
    use crate::storage::list_store::{JsonFileStore, ListStore, MemoryListStore};
    use tempfile::tempdir;

    fn manager() -> (MapLocalManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let manager = MapLocalManager::new(
            Box::new(MemoryListStore::default()),
            Box::new(MemoryListStore::default()),
            sink.clone(),
        );
        (manager, sink)
    }

    #[test]
    fn create_normalizes_and_pushes() {
        let (manager, sink) = manager();
        let rule = manager.create_rule(" API.Example.com ", "users").unwrap();
        assert_eq!(rule.key, "api.example.com/users");

        let again = manager.create_rule("api.example.com", "/users").unwrap();
        assert_eq!(again, rule);
        assert_eq!(manager.rules().len(), 1);

        assert_eq!(sink.kinds(), vec!["mock_rule"]);
        assert!(manager.create_rule("  ", "/x").is_none());
    }

    #[test]
    fn update_and_delete_send_commands() {
        let (manager, sink) = manager();
        manager.create_rule("a.com", "/x").unwrap();

        let updated = manager
            .update_rule(
                "a.com/x",
                RuleEdit {
                    body: "{\"ok\":true}".into(),
                    status: 418,
                    headers: Headers::new(),
                    is_enabled: false,
                },
            )
            .unwrap();
        assert_eq!(updated.status, 418);

        match sink.commands().last().unwrap() {
            EngineCommand::MockRule {
                key,
                status,
                enabled,
                ..
            } => {
                assert_eq!(key, "a.com/x");
                assert_eq!(*status, 418);
                assert!(!enabled);
            }
            other => panic!("unexpected command {other:?}"),
        }

        manager.delete_rule("a.com/x").unwrap();
        assert_eq!(
            sink.commands().last().unwrap(),
            &EngineCommand::DeleteRule {
                key: "a.com/x".into()
            }
        );
        assert_eq!(
            manager.delete_rule("a.com/x"),
            Err(MapLocalError::UnknownRule("a.com/x".into()))
        );
    }

    #[test]
    fn rekey_moves_rule_and_deletes_old_key() {
        let (manager, sink) = manager();
        manager.create_rule("a.com", "/x").unwrap();

        let moved = manager.rekey_rule("a.com/x", "B.com", "y").unwrap();
        assert_eq!(moved.key, "b.com/y");
        assert!(manager.rule("a.com/x").is_none());
        assert_eq!(sink.kinds(), vec!["mock_rule", "delete_rule", "mock_rule"]);
        assert_eq!(
            manager.rekey_rule("b.com/y", "", "/z"),
            Err(MapLocalError::InvalidHost)
        );
    }

    #[test]
    fn map_flow_copies_response() {
        let (manager, _sink) = manager();
        let mut flow = Flow::new("f1", "response");
        flow.request = Some(Request {
            method: "GET".into(),
            url: "http://api.example.com/items?page=1".into(),
            ..Default::default()
        });
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), "application/json".into());
        headers.insert("Content-Length".into(), "2".into());
        flow.response = Some(Response {
            status: Some(404),
            headers: Some(headers),
            body: Some("[]".into()),
        });

        let rule = manager.map_flow(&flow).unwrap();
        assert_eq!(rule.key, "api.example.com/items");
        assert_eq!(rule.scheme, "http");
        assert_eq!(rule.status, 404);
        assert_eq!(rule.body, "[]");
        assert!(rule.headers.contains_key("Content-Type"));
        assert!(!rule.headers.contains_key("Content-Length"));
    }

    #[test]
    fn collection_toggle_sends_nothing_until_pushed() {
        let (manager, sink) = manager();
        let a = MapRule::new("a.com", "/1").unwrap();
        let mut b = MapRule::new("b.com", "/2").unwrap();
        b.is_enabled = false;
        let collection = manager.create_collection("demo", vec![a, b]);

        let members = manager.set_collection_enabled(&collection.id, true).unwrap();
        assert_eq!(members.len(), 2);
        assert!(sink.commands().is_empty());

        assert_eq!(manager.push_collection(&collection.id).unwrap(), 2);
        let states: Vec<bool> = sink
            .commands()
            .iter()
            .filter_map(|c| match c {
                EngineCommand::MockRule { enabled, .. } => Some(*enabled),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![true, false]);

        manager.set_collection_enabled(&collection.id, false).unwrap();
        sink.clear();
        manager.push_collection(&collection.id).unwrap();
        assert!(sink.commands().iter().all(|c| matches!(
            c,
            EngineCommand::MockRule { enabled: false, .. }
        )));
    }

    #[test]
    fn collection_crud() {
        let (manager, _sink) = manager();
        let collection = manager.create_collection("first", Vec::new());

        let renamed = manager.rename_collection(&collection.id, " second ").unwrap();
        assert_eq!(renamed.name, "second");

        let mut rule = MapRule::new("a.com", "/x").unwrap();
        rule.host = "A.COM".into();
        let updated = manager.update_collection_rule(&collection.id, rule).unwrap();
        assert_eq!(updated.rules[0].key, "a.com/x");

        assert!(manager
            .remove_rule_from_collection(&collection.id, "a.com/x")
            .unwrap());
        assert!(!manager
            .remove_rule_from_collection(&collection.id, "a.com/x")
            .unwrap());

        manager.delete_collection(&collection.id).unwrap();
        assert_eq!(
            manager.set_collection_enabled(&collection.id, true),
            Err(MapLocalError::UnknownCollection(collection.id.clone()))
        );
    }

    #[test]
    fn recording_captures_last_write_per_key() {
        let (manager, _sink) = manager();
        manager.start_recording("session").unwrap();
        assert_eq!(
            manager.start_recording("again"),
            Err(MapLocalError::RecordingActive)
        );

        manager.create_rule("a.com", "/x").unwrap();
        let mut edit = RuleEdit::from(&manager.rule("a.com/x").unwrap());
        edit.body = "final".into();
        manager.update_rule("a.com/x", edit).unwrap();
        manager.create_rule("b.com", "/y").unwrap();
        manager.set_enabled("b.com/y", false).unwrap();

        let saved = manager.stop_recording(true).unwrap();
        assert!(!manager.is_recording());
        assert_eq!(saved.name, "session");
        assert_eq!(saved.rules.len(), 2);
        assert_eq!(saved.rule("a.com/x").unwrap().body, "final");
        assert!(!saved.rule("b.com/y").unwrap().is_enabled);
        assert_eq!(manager.collections().len(), 1);
    }

    #[test]
    fn discarded_recording_saves_nothing() {
        let dir = tempdir().expect("temp dir");
        let rules_path = dir.path().join("map_rules.json");
        let collections_path = dir.path().join("map_collections.json");
        let manager = MapLocalManager::new(
            Box::new(JsonFileStore::<MapRule>::new(&rules_path)),
            Box::new(JsonFileStore::<MapCollection>::new(&collections_path)),
            Arc::new(RecordingSink::default()),
        );
        let kept = manager.create_rule("keep.com", "/k").unwrap();

        manager.start_recording("tmp").unwrap();
        manager.create_rule("a.com", "/x").unwrap();
        assert!(manager.stop_recording(false).is_none());
        assert!(manager.collections().is_empty());
        assert!(manager.stop_recording(true).is_none());

        assert_eq!(manager.rule("keep.com/k"), Some(kept));
        let on_disk = JsonFileStore::<MapRule>::new(&rules_path).load_all().unwrap();
        assert_eq!(on_disk, manager.rules());
        let saved_collections = JsonFileStore::<MapCollection>::new(&collections_path)
            .load_all()
            .unwrap();
        assert!(saved_collections.is_empty());
    }

    #[test]
    fn rules_and_collections_persist_across_managers() {
        let dir = tempdir().expect("temp dir");
        let rules_path = dir.path().join("map_rules.json");
        let collections_path = dir.path().join("map_collections.json");
        let open = || {
            MapLocalManager::new(
                Box::new(JsonFileStore::<MapRule>::new(&rules_path)),
                Box::new(JsonFileStore::<MapCollection>::new(&collections_path)),
                Arc::new(RecordingSink::default()),
            )
        };

        {
            let manager = open();
            manager.create_rule("a.com", "/x").unwrap();
            manager.create_collection("kept", vec![MapRule::new("b.com", "/").unwrap()]);
        }

        let reopened = open();
        assert!(reopened.rule("a.com/x").is_some());
        assert_eq!(reopened.collections()[0].name, "kept");
        assert_eq!(reopened.push_rules(), 1);
    }

    #[test]
    fn export_then_import_gets_fresh_identity() {
        let dir = tempdir().expect("temp dir");
        let (manager, _sink) = manager();
        let original = manager.create_collection("shared", vec![MapRule::new("a.com", "/x").unwrap()]);
        manager.set_collection_enabled(&original.id, true).unwrap();

        let path = dir.path().join("shared.json");
        manager.export_collection(&original.id, &path).unwrap();
        let imported = manager.import_collection(&path).unwrap();

        assert_ne!(imported.id, original.id);
        assert_eq!(imported.name, "shared");
        assert!(!imported.is_enabled);
        assert_eq!(imported.rules[0].key, "a.com/x");
        assert!(manager.export_collection("missing", &path).is_err());
    }
}
