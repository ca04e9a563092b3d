use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::map_local::normalize_key;
use crate::models::{
    BreakpointEdit, BreakpointHit, BreakpointRule, Flow, Phase, RequestPayload, ResponsePayload,
};
use crate::proxy::protocol::EngineCommand;
use crate::proxy::supervisor::CommandSink;
use crate::storage::list_store::{load_or_empty, save_logged, ListStore};
use crate::storage::FlowStore;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Rule keys share the map-local canonical form so typed keys match the
/// ones the engine reports
fn canonical_key(key: &str) -> String {
    normalize_key(key).unwrap_or_else(|| key.trim().to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("no breakpoint is waiting for a decision")]
    NoActiveHit,
    #[error("active breakpoint is paused at the {active} phase, edit targets {edit}")]
    PhaseMismatch { active: Phase, edit: Phase },
    #[error("breakpoint {0} has no phase to intercept")]
    NoPhase(String),
    #[error("no breakpoint rule for {0}")]
    UnknownRule(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointEvent {
    Hit(BreakpointHit),
    Resumed(BreakpointHit),
    Skipped(BreakpointHit),
    /// The engine stopped reporting the flow as waiting
    Cleared(BreakpointHit),
}

pub struct BreakpointManager {
    rules: RwLock<Vec<BreakpointRule>>,
    /// FIFO of distinct (flow, phase) hits; the front is the active one
    queue: Mutex<VecDeque<BreakpointHit>>,
    store: Box<dyn ListStore<BreakpointRule>>,
    sink: Arc<dyn CommandSink>,
    events: broadcast::Sender<BreakpointEvent>,
}

impl BreakpointManager {
    pub fn new(store: Box<dyn ListStore<BreakpointRule>>, sink: Arc<dyn CommandSink>) -> Self {
        let mut rules = load_or_empty(store.as_ref(), "breakpoint rules");
        // Persisted files may predate the enabled-implies-phase rule
        for rule in &mut rules {
            rule.key = canonical_key(&rule.key);
            rule.normalize();
        }
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            rules: RwLock::new(rules),
            queue: Mutex::new(VecDeque::new()),
            store,
            sink,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakpointEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BreakpointEvent) {
        let _ = self.events.send(event);
    }

    fn queue_guard(&self) -> MutexGuard<'_, VecDeque<BreakpointHit>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rules(&self) -> Vec<BreakpointRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rule(&self, key: &str) -> Option<BreakpointRule> {
        let key = canonical_key(key);
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.key == key)
            .cloned()
    }

    fn push_rule(&self, rule: &BreakpointRule) {
        let (request, response) = rule.effective_flags();
        self.sink.send_command(&EngineCommand::BreakpointRule {
            key: rule.key.clone(),
            request,
            response,
        });
    }

    /// Apply `update` to the rule for `key` (creating it when missing),
    /// then persist and push it.
    fn mutate_rule<F>(&self, key: &str, update: F) -> BreakpointRule
    where
        F: FnOnce(&mut BreakpointRule),
    {
        let key = canonical_key(key);
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let index = match rules.iter().position(|r| r.key == key) {
            Some(index) => index,
            None => {
                rules.push(BreakpointRule::new(key, false, false));
                rules.len() - 1
            }
        };
        update(&mut rules[index]);
        rules[index].normalize();
        let rule = rules[index].clone();

        save_logged(self.store.as_ref(), &rules, "breakpoint rules");
        self.push_rule(&rule);
        rule
    }

    /// Create or replace the rule for `key`. The rule is enabled when at
    /// least one phase is intercepted.
    pub fn set_rule(&self, key: &str, request: bool, response: bool) -> BreakpointRule {
        let rule = self.mutate_rule(key, |rule| {
            *rule = BreakpointRule::new(rule.key.clone(), request, response);
        });
        tracing::info!(
            "Breakpoint {} request={} response={}",
            rule.key,
            rule.intercept_request,
            rule.intercept_response
        );
        rule
    }

    pub fn toggle_request(&self, key: &str) -> BreakpointRule {
        self.mutate_rule(key, |rule| rule.toggle(Phase::Request))
    }

    pub fn toggle_response(&self, key: &str) -> BreakpointRule {
        self.mutate_rule(key, |rule| rule.toggle(Phase::Response))
    }

    /// Enabling requires an intercepted phase. Disabling a rule that
    /// intercepts nothing changes nothing and sends nothing.
    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<BreakpointRule, BreakpointError> {
        let current = self
            .rule(key)
            .ok_or_else(|| BreakpointError::UnknownRule(key.to_string()))?;
        if !current.has_active_phase() {
            if enabled {
                return Err(BreakpointError::NoPhase(key.to_string()));
            }
            return Ok(current);
        }
        Ok(self.mutate_rule(key, |rule| rule.is_enabled = enabled))
    }

    pub fn remove_rule(&self, key: &str) -> Result<BreakpointRule, BreakpointError> {
        let canonical = canonical_key(key);
        let removed = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            let index = rules
                .iter()
                .position(|r| r.key == canonical)
                .ok_or_else(|| BreakpointError::UnknownRule(key.to_string()))?;
            let removed = rules.remove(index);
            save_logged(self.store.as_ref(), &rules, "breakpoint rules");
            removed
        };
        self.sink.send_command(&EngineCommand::BreakpointRule {
            key: removed.key.clone(),
            request: false,
            response: false,
        });
        tracing::info!("Removed breakpoint {}", removed.key);
        Ok(removed)
    }

    /// Send every rule to the engine, e.g. after it (re)started
    pub fn push_rules(&self) -> usize {
        let rules = self.rules();
        for rule in &rules {
            self.push_rule(rule);
        }
        rules.len()
    }

    fn intercepts(rules: &[BreakpointRule], key: &str, phase: Phase) -> bool {
        rules.iter().any(|r| r.key == key && r.intercepts(phase))
    }

    /// Reconcile the hit queue with the latest state of `flow`. Returns the
    /// events emitted.
    pub fn observe(&self, flow: &Flow) -> Vec<BreakpointEvent> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let mut queue = self.queue_guard();
        let mut events = Vec::new();

        for phase in Phase::ALL {
            let queued = queue.iter().position(|hit| hit.is_same(&flow.id, phase));
            let waiting = flow.is_waiting_at(phase);

            match (waiting, queued) {
                (true, None) => {
                    let reported = flow
                        .breakpoint
                        .as_ref()
                        .map(|bp| canonical_key(&bp.key))
                        .unwrap_or_default();
                    let fallback = flow.rule_key();
                    let key = if Self::intercepts(&rules, &reported, phase) {
                        reported
                    } else if Self::intercepts(&rules, &fallback, phase) {
                        fallback
                    } else {
                        tracing::debug!(
                            "Flow {} waiting at {} without a matching rule",
                            flow.id,
                            phase
                        );
                        continue;
                    };
                    let hit = BreakpointHit {
                        flow_id: flow.id.clone(),
                        phase,
                        key,
                        timestamp: crate::storage::now_seconds(),
                    };
                    tracing::info!("Breakpoint hit {} ({})", hit.key, phase);
                    queue.push_back(hit.clone());
                    events.push(BreakpointEvent::Hit(hit));
                }
                (false, Some(index)) => {
                    if let Some(hit) = queue.remove(index) {
                        tracing::debug!("Breakpoint {} released by the engine", hit.id());
                        events.push(BreakpointEvent::Cleared(hit));
                    }
                }
                _ => {}
            }
        }

        drop(queue);
        drop(rules);
        for event in &events {
            self.emit(event.clone());
        }
        events
    }

    /// Drop hits for flows the store no longer holds
    pub fn discard_flows(&self, flow_ids: &[String]) {
        if flow_ids.is_empty() {
            return;
        }
        let removed: Vec<BreakpointHit> = {
            let mut queue = self.queue_guard();
            let (gone, kept): (Vec<_>, Vec<_>) = queue
                .drain(..)
                .partition(|hit| flow_ids.contains(&hit.flow_id));
            queue.extend(kept);
            gone
        };
        for hit in removed {
            self.emit(BreakpointEvent::Cleared(hit));
        }
    }

    pub fn queue(&self) -> Vec<BreakpointHit> {
        self.queue_guard().iter().cloned().collect()
    }

    pub fn active_hit(&self) -> Option<BreakpointHit> {
        self.queue_guard().front().cloned()
    }

    /// Release the active hit with the user's edits
    pub fn resume(&self, edit: BreakpointEdit) -> Result<BreakpointHit, BreakpointError> {
        let mut queue = self.queue_guard();
        let active = queue.front().ok_or(BreakpointError::NoActiveHit)?;
        if active.phase != edit.phase() {
            return Err(BreakpointError::PhaseMismatch {
                active: active.phase,
                edit: edit.phase(),
            });
        }

        let (request, response) = match edit {
            BreakpointEdit::Request(payload) => (Some(payload), None),
            BreakpointEdit::Response(payload) => (None, Some(payload)),
        };
        self.sink.send_command(&EngineCommand::BreakpointContinue {
            id: active.flow_id.clone(),
            phase: active.phase,
            request,
            response,
        });

        let hit = queue.pop_front().ok_or(BreakpointError::NoActiveHit)?;
        drop(queue);
        tracing::info!("Resumed breakpoint {} ({})", hit.key, hit.phase);
        self.emit(BreakpointEvent::Resumed(hit.clone()));
        Ok(hit)
    }

    /// Release the active hit unchanged, replaying the flow's stored data.
    /// When the store no longer has the flow the engine's own copy is used.
    pub fn skip(&self, flows: &FlowStore) -> Result<BreakpointHit, BreakpointError> {
        let mut queue = self.queue_guard();
        let active = queue.front().ok_or(BreakpointError::NoActiveHit)?;

        let flow = flows.get(&active.flow_id);
        if flow.is_none() {
            tracing::debug!("Skipping {} without a stored flow", active.id());
        }
        let (request, response) = match active.phase {
            Phase::Request => (flow.as_ref().and_then(stored_request), None),
            Phase::Response => (None, flow.as_ref().and_then(stored_response)),
        };
        self.sink.send_command(&EngineCommand::BreakpointContinue {
            id: active.flow_id.clone(),
            phase: active.phase,
            request,
            response,
        });

        let hit = queue.pop_front().ok_or(BreakpointError::NoActiveHit)?;
        drop(queue);
        tracing::info!("Skipped breakpoint {} ({})", hit.key, hit.phase);
        self.emit(BreakpointEvent::Skipped(hit.clone()));
        Ok(hit)
    }
}

fn stored_request(flow: &Flow) -> Option<RequestPayload> {
    let request = flow.request.as_ref()?;
    Some(RequestPayload {
        method: request.method.clone(),
        url: request.url.clone(),
        headers: request.headers.clone(),
        body: request.body.clone().unwrap_or_default(),
    })
}

fn stored_response(flow: &Flow) -> Option<ResponsePayload> {
    let response = flow.response.as_ref()?;
    Some(ResponsePayload {
        status: response.status?,
        headers: response.headers.clone().unwrap_or_default(),
        body: response.body.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Headers;
    use crate::proxy::test_support::RecordingSink;
    use crate::storage::list_store::MemoryListStore;
    use serde_json::json;

    fn manager() -> (BreakpointManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let manager = BreakpointManager::new(Box::new(MemoryListStore::default()), sink.clone());
        (manager, sink)
    }

    fn paused_line(id: &str, phase: &str, state: &str) -> String {
        let response = if phase == "response" {
            json!({"status": 200, "headers": {"X": "1"}, "body": "orig"})
        } else {
            serde_json::Value::Null
        };
        json!({
            "event": phase,
            "id": id,
            "timestamp": 1.0,
            "request": {"method": "GET", "url": "https://api.example.com/items", "headers": {}, "body": "q"},
            "response": response,
            "breakpoint": {"phase": phase, "state": state, "key": "api.example.com/items"},
        })
        .to_string()
    }

    fn observe_line(manager: &BreakpointManager, store: &FlowStore, line: &str) {
        store.ingest(line);
        let id = serde_json::from_str::<serde_json::Value>(line).unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();
        manager.observe(&store.get(&id).unwrap());
    }

    #[test]
    fn enabling_requires_a_phase() {
        let (manager, sink) = manager();
        let rule = manager.set_rule("api.example.com/items", false, false);
        assert!(!rule.is_enabled);

        assert_eq!(
            manager.set_enabled("api.example.com/items", true),
            Err(BreakpointError::NoPhase("api.example.com/items".into()))
        );

        let sent_before = sink.commands().len();
        let unchanged = manager.set_enabled("api.example.com/items", false).unwrap();
        assert!(!unchanged.is_enabled);
        assert_eq!(sink.commands().len(), sent_before);

        assert_eq!(
            manager.set_enabled("missing", true),
            Err(BreakpointError::UnknownRule("missing".into()))
        );
    }

    #[test]
    fn mutations_push_rule_state() {
        let (manager, sink) = manager();
        manager.toggle_request("a.com/x");
        manager.toggle_response("a.com/x");
        manager.set_enabled("a.com/x", false).unwrap();
        manager.remove_rule("a.com/x").unwrap();

        let flags: Vec<(bool, bool)> = sink
            .commands()
            .iter()
            .map(|c| match c {
                EngineCommand::BreakpointRule {
                    request, response, ..
                } => (*request, *response),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            flags,
            vec![(true, false), (true, true), (false, false), (false, false)]
        );
        assert!(manager.rules().is_empty());
    }

    #[test]
    fn typed_keys_match_engine_reported_keys() {
        let (manager, sink) = manager();
        let store = FlowStore::default();
        let rule = manager.set_rule(" API.Example.com/items ", true, false);
        assert_eq!(rule.key, "api.example.com/items");
        assert!(manager.rule("Api.example.com/items").is_some());
        assert_eq!(
            sink.commands().last(),
            Some(&EngineCommand::BreakpointRule {
                key: "api.example.com/items".into(),
                request: true,
                response: false,
            })
        );

        observe_line(&manager, &store, &paused_line("f1", "request", "waiting"));
        assert_eq!(manager.queue().len(), 1);

        manager.remove_rule("API.EXAMPLE.COM/items").unwrap();
        assert!(manager.rules().is_empty());
    }

    #[test]
    fn hits_queue_fifo_and_resume_in_order() {
        let (manager, sink) = manager();
        let store = FlowStore::default();
        manager.set_rule("api.example.com/items", true, true);

        observe_line(&manager, &store, &paused_line("f1", "request", "waiting"));
        observe_line(&manager, &store, &paused_line("f2", "request", "waiting"));
        // Duplicate report does not queue twice
        observe_line(&manager, &store, &paused_line("f1", "request", "waiting"));
        assert_eq!(manager.queue().len(), 2);
        assert_eq!(manager.active_hit().unwrap().flow_id, "f1");

        let edit = BreakpointEdit::Request(RequestPayload {
            method: "POST".into(),
            url: "https://api.example.com/items".into(),
            headers: Headers::new(),
            body: "edited".into(),
        });
        let resumed = manager.resume(edit).unwrap();
        assert_eq!(resumed.flow_id, "f1");
        assert_eq!(manager.active_hit().unwrap().flow_id, "f2");

        match sink.commands().last().unwrap() {
            EngineCommand::BreakpointContinue {
                id,
                phase,
                request,
                response,
            } => {
                assert_eq!(id, "f1");
                assert_eq!(*phase, Phase::Request);
                assert_eq!(request.as_ref().unwrap().body, "edited");
                assert!(response.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resume_rejects_wrong_phase() {
        let (manager, _sink) = manager();
        let store = FlowStore::default();
        manager.set_rule("api.example.com/items", false, true);
        observe_line(&manager, &store, &paused_line("f1", "response", "waiting"));

        let err = manager
            .resume(BreakpointEdit::Request(RequestPayload::default()))
            .unwrap_err();
        assert_eq!(
            err,
            BreakpointError::PhaseMismatch {
                active: Phase::Response,
                edit: Phase::Request
            }
        );
        assert_eq!(manager.queue().len(), 1);
    }

    #[test]
    fn skip_replays_stored_response() {
        let (manager, sink) = manager();
        let store = FlowStore::default();
        manager.set_rule("api.example.com/items", false, true);
        observe_line(&manager, &store, &paused_line("f1", "response", "waiting"));

        let hit = manager.skip(&store).unwrap();
        assert_eq!(hit.phase, Phase::Response);
        assert!(manager.active_hit().is_none());

        match sink.commands().last().unwrap() {
            EngineCommand::BreakpointContinue { response, .. } => {
                let response = response.as_ref().unwrap();
                assert_eq!(response.status, 200);
                assert_eq!(response.body, "orig");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.skip(&store), Err(BreakpointError::NoActiveHit));
    }

    #[test]
    fn released_flows_leave_the_queue() {
        let (manager, _sink) = manager();
        let store = FlowStore::default();
        let mut events = manager.subscribe();
        manager.set_rule("api.example.com/items", true, false);

        observe_line(&manager, &store, &paused_line("f1", "request", "waiting"));
        observe_line(&manager, &store, &paused_line("f1", "request", "released"));
        assert!(manager.queue().is_empty());

        assert!(matches!(events.try_recv(), Ok(BreakpointEvent::Hit(_))));
        assert!(matches!(events.try_recv(), Ok(BreakpointEvent::Cleared(_))));
    }

    #[test]
    fn waiting_without_enabled_rule_is_ignored() {
        let (manager, _sink) = manager();
        let store = FlowStore::default();
        manager.set_rule("api.example.com/items", false, true);
        observe_line(&manager, &store, &paused_line("f1", "request", "waiting"));
        assert!(manager.queue().is_empty());
    }

    #[test]
    fn evicted_flows_drop_their_hits() {
        let (manager, _sink) = manager();
        let store = FlowStore::default();
        manager.set_rule("api.example.com/items", true, false);
        observe_line(&manager, &store, &paused_line("f1", "request", "waiting"));
        observe_line(&manager, &store, &paused_line("f2", "request", "waiting"));

        manager.discard_flows(&["f1".to_string()]);
        let ids: Vec<_> = manager.queue().into_iter().map(|h| h.flow_id).collect();
        assert_eq!(ids, vec!["f2"]);
    }
}
