//! Control plane facade
//!
//! Wires the engine supervisor, the flow store and the two rule engines
//! together and exposes the operations a UI or CLI drives: start/stop,
//! mocking, retries, traffic shaping, breakpoints and search.

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{
    BreakpointEdit, BreakpointHit, BreakpointRule, Flow, Headers, MapCollection, MapRule,
    RequestPayload, TrafficProfile,
};
use crate::proxy::breakpoints::{BreakpointError, BreakpointManager};
use crate::proxy::config::{ProxySettings, SettingsUpdate};
use crate::proxy::map_local::{MapLocalError, MapLocalManager};
use crate::proxy::protocol::EngineCommand;
use crate::proxy::supervisor::{CommandSink, EngineError, EngineLine, EngineSupervisor};
use crate::query::FlowQuery;
use crate::storage::list_store::{write_atomically, JsonFileStore, ListStore, MemoryListStore};
use crate::storage::{open_flow_store, FlowStore, Ingested, LogSource};

const SETTINGS_FILE: &str = "settings.json";
const MAP_RULES_FILE: &str = "map_rules.json";
const MAP_COLLECTIONS_FILE: &str = "map_collections.json";
const BREAKPOINT_RULES_FILE: &str = "breakpoint_rules.json";
/// How often the ingestion thread applies age-based pruning
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown flow {0}")]
    UnknownFlow(String),
    #[error("flow {0} has no request to work with")]
    MissingRequest(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    MapLocal(#[from] MapLocalError),
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

/// Default storage directory under the platform data dir
pub fn default_storage_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("frtmproxy"))
}

pub struct ControlPlane {
    storage_dir: Option<PathBuf>,
    settings: RwLock<ProxySettings>,
    traffic: RwLock<TrafficProfile>,
    supervisor: Arc<EngineSupervisor>,
    flows: Arc<FlowStore>,
    map_local: MapLocalManager,
    breakpoints: Arc<BreakpointManager>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    /// Open the control plane. With a storage directory, settings, rules
    /// and (for durable retention) flows persist there; without one
    /// everything lives in memory.
    pub fn open(storage_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(dir) = &storage_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating storage directory {:?}", dir))?;
        }

        let settings = storage_dir
            .as_deref()
            .map(load_settings)
            .unwrap_or_default();
        let flows = Arc::new(open_flow_store(settings.retention, storage_dir.as_deref())?);

        let (supervisor, lines) = EngineSupervisor::new();
        let supervisor = Arc::new(supervisor);
        let sink: Arc<dyn CommandSink> = supervisor.clone();

        let map_local = MapLocalManager::new(
            open_list(storage_dir.as_deref(), MAP_RULES_FILE),
            open_list(storage_dir.as_deref(), MAP_COLLECTIONS_FILE),
            Arc::clone(&sink),
        );
        let breakpoints = Arc::new(BreakpointManager::new(
            open_list::<BreakpointRule>(storage_dir.as_deref(), BREAKPOINT_RULES_FILE),
            sink,
        ));

        let pump = {
            let flows = Arc::clone(&flows);
            let breakpoints = Arc::clone(&breakpoints);
            std::thread::Builder::new()
                .name("frtm-ingest".into())
                .spawn(move || {
                    ingest_lines(lines, &flows, &breakpoints, PruneSchedule::new(PRUNE_INTERVAL))
                })
                .context("spawning ingestion thread")?
        };

        tracing::info!(
            "Control plane ready (storage={:?}, retention={})",
            storage_dir,
            flows.retention_name()
        );

        Ok(Self {
            storage_dir,
            settings: RwLock::new(settings),
            traffic: RwLock::new(TrafficProfile::disabled()),
            supervisor,
            flows,
            map_local,
            breakpoints,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    pub fn flows(&self) -> &FlowStore {
        &self.flows
    }

    pub fn map_local(&self) -> &MapLocalManager {
        &self.map_local
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    pub fn supervisor(&self) -> &EngineSupervisor {
        &self.supervisor
    }

    // ---- engine lifecycle ----

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Launch the engine with the current settings and replay rule state
    /// into it
    pub async fn start_proxy(&self) -> Result<(), ControlError> {
        let config = self.settings().engine_config();
        let was_running = self.supervisor.is_running();
        self.supervisor.start(&config).await?;
        if !was_running {
            self.resync_engine();
        }
        Ok(())
    }

    pub fn stop_proxy(&self) {
        self.supervisor.stop();
    }

    /// Push rules, enabled collections, breakpoints and the traffic profile
    fn resync_engine(&self) {
        let rules = self.map_local.push_rules();
        let mut collections = 0;
        for collection in self.map_local.collections() {
            if collection.is_enabled && self.map_local.push_collection(&collection.id).is_ok() {
                collections += 1;
            }
        }
        let breakpoints = self.breakpoints.push_rules();

        let profile = self.traffic_profile();
        if !profile.is_disabled() {
            self.supervisor
                .send_command(&EngineCommand::TrafficProfile { profile });
        }
        tracing::info!(
            "Synced {} map rules, {} collections and {} breakpoints to the engine",
            rules,
            collections,
            breakpoints
        );
    }

    /// Stop the engine, end ingestion and wait for the ingestion thread
    pub fn shutdown(&self) {
        self.supervisor.close();
        let handle = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Ingestion thread panicked");
            }
        }
    }

    // ---- settings ----

    pub fn settings(&self) -> ProxySettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store new settings. A running engine keeps its launch parameters;
    /// the result says whether a restart is needed to pick them up.
    pub fn apply_settings(&self, next: ProxySettings) -> Result<SettingsUpdate, ControlError> {
        let requires_restart = {
            let mut current = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            let requires_restart = self.is_running() && current.requires_restart(&next);
            if current.retention != next.retention {
                tracing::info!("Retention change applies the next time the store is opened");
            }
            *current = next.clone();
            requires_restart
        };

        if let Some(dir) = &self.storage_dir {
            let json = serde_json::to_string_pretty(&next).context("encoding settings")?;
            write_atomically(&dir.join(SETTINGS_FILE), json.as_bytes())?;
        }
        if requires_restart {
            tracing::info!("Settings saved; restart the proxy to apply them");
        }
        Ok(SettingsUpdate { requires_restart })
    }

    // ---- flow actions ----

    pub fn search(&self, text: &str) -> Vec<Flow> {
        let flows = self.flows.flows();
        FlowQuery::parse(text)
            .filter(&flows)
            .into_iter()
            .cloned()
            .collect()
    }

    fn flow(&self, flow_id: &str) -> Result<Flow, ControlError> {
        self.flows
            .get(flow_id)
            .ok_or_else(|| ControlError::UnknownFlow(flow_id.to_string()))
    }

    /// Answer a captured flow with a local response
    pub fn mock_response(
        &self,
        flow_id: &str,
        body: String,
        status: Option<u16>,
        headers: Option<Headers>,
    ) -> Result<(), ControlError> {
        self.flow(flow_id)?;
        self.supervisor.send_command(&EngineCommand::MockResponse {
            id: flow_id.to_string(),
            body,
            status,
            headers,
        });
        Ok(())
    }

    pub fn mock_request(
        &self,
        flow_id: &str,
        body: String,
        headers: Option<Headers>,
    ) -> Result<(), ControlError> {
        self.flow(flow_id)?;
        self.supervisor.send_command(&EngineCommand::MockRequest {
            id: flow_id.to_string(),
            body,
            headers,
        });
        Ok(())
    }

    /// Resend a captured request, optionally edited
    pub fn retry_flow(
        &self,
        flow_id: &str,
        edit: Option<RequestPayload>,
    ) -> Result<(), ControlError> {
        let flow = self.flow(flow_id)?;
        let payload = match edit {
            Some(payload) => payload,
            None => {
                let request = flow
                    .request
                    .ok_or_else(|| ControlError::MissingRequest(flow_id.to_string()))?;
                RequestPayload {
                    method: request.method,
                    url: request.url,
                    headers: request.headers,
                    body: request.body.unwrap_or_default(),
                }
            }
        };
        self.supervisor.send_command(&EngineCommand::RetryFlow {
            id: flow_id.to_string(),
            method: payload.method.to_uppercase(),
            url: payload.url,
            body: payload.body,
            headers: payload.headers,
        });
        Ok(())
    }

    /// Create a map-local rule from a captured flow
    pub fn map_flow(&self, flow_id: &str) -> Result<MapRule, ControlError> {
        let flow = self.flow(flow_id)?;
        self.map_local
            .map_flow(&flow)
            .ok_or_else(|| ControlError::MissingRequest(flow_id.to_string()))
    }

    /// Enable or disable a collection and push its members to the engine
    pub fn toggle_collection(&self, id: &str, enabled: bool) -> Result<MapCollection, ControlError> {
        self.map_local.set_collection_enabled(id, enabled)?;
        self.map_local.push_collection(id)?;
        self.map_local
            .collection(id)
            .ok_or_else(|| MapLocalError::UnknownCollection(id.to_string()).into())
    }

    pub fn clear_flows(&self) -> Result<(), ControlError> {
        self.flows.clear()?;
        Ok(())
    }

    // ---- traffic shaping ----

    pub fn traffic_profile(&self) -> TrafficProfile {
        self.traffic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn apply_traffic_profile(&self, profile: TrafficProfile) -> TrafficProfile {
        let profile = profile.sanitized();
        *self.traffic.write().unwrap_or_else(PoisonError::into_inner) = profile.clone();
        tracing::info!("Applying traffic profile {:?}", profile.name);
        self.supervisor.send_command(&EngineCommand::TrafficProfile {
            profile: profile.clone(),
        });
        profile
    }

    // ---- breakpoints ----

    pub fn resume_breakpoint(&self, edit: BreakpointEdit) -> Result<BreakpointHit, ControlError> {
        Ok(self.breakpoints.resume(edit)?)
    }

    pub fn skip_breakpoint(&self) -> Result<BreakpointHit, ControlError> {
        Ok(self.breakpoints.skip(&self.flows)?)
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        // Ends the ingestion thread once the engine pipes close
        self.supervisor.close();
    }
}

/// Throttles pruning to once per interval
struct PruneSchedule {
    every: Duration,
    last: Instant,
}

impl PruneSchedule {
    fn new(every: Duration) -> Self {
        Self {
            every,
            last: Instant::now(),
        }
    }

    fn due(&mut self) -> bool {
        if self.last.elapsed() < self.every {
            return false;
        }
        self.last = Instant::now();
        true
    }
}

/// Drain engine lines on a dedicated thread. All flow mutations and
/// breakpoint observation happen here, one line at a time. Age-based
/// pruning runs here too, so a long session stays within the horizon.
fn ingest_lines(
    mut lines: mpsc::UnboundedReceiver<EngineLine>,
    flows: &FlowStore,
    breakpoints: &BreakpointManager,
    mut prune: PruneSchedule,
) {
    while let Some(line) = lines.blocking_recv() {
        match line {
            EngineLine::Stdout(line) => {
                if let Ingested::Flow { flow, evicted, .. } = flows.ingest(&line) {
                    // Paused flows are never evicted, so this only drops
                    // hits the engine already released
                    breakpoints.discard_flows(&evicted);
                    breakpoints.observe(&flow);
                }
                if prune.due() {
                    if let Err(err) = flows.prune() {
                        tracing::warn!("Periodic prune failed: {:#}", err);
                    }
                }
            }
            EngineLine::Stderr(line) => {
                flows.push_log(LogSource::Stderr, line);
            }
        }
    }
    tracing::debug!("Engine line stream closed");
}

fn open_list<T>(dir: Option<&Path>, file: &str) -> Box<dyn ListStore<T>>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + 'static,
{
    match dir {
        Some(dir) => Box::new(JsonFileStore::new(dir.join(file))),
        None => Box::new(MemoryListStore::default()),
    }
}

fn load_settings(dir: &Path) -> ProxySettings {
    let path = dir.join(SETTINGS_FILE);
    if !path.exists() {
        return ProxySettings::default();
    }
    let loaded = fs::read_to_string(&path)
        .with_context(|| format!("reading {:?}", path))
        .and_then(|data| {
            serde_json::from_str(&data).with_context(|| format!("decoding {:?}", path))
        });
    match loaded {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!("Failed to load settings: {:#}; using defaults", err);
            ProxySettings::default()
        }
    }
}

/// Initialize the core library (call once at startup)
/// `storage_path` is used to store log files in release mode
#[allow(unused_variables)]
pub fn init_core(storage_path: Option<String>) -> Result<bool, String> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        // Debug mode: log to console (stderr)
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        // Release mode: log to a daily rolling file
        let log_dir = storage_path
            .as_ref()
            .map(|p| PathBuf::from(p).join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"));

        fs::create_dir_all(&log_dir).map_err(|e| {
            format!(
                "Failed to create log directory {}: {}",
                log_dir.display(),
                e
            )
        })?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "frtmproxy_core");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Logging lasts until process exit
        std::mem::forget(guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("FRTM Proxy core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(true)
}

/// Map `RUST_LOG` to a level; anything unrecognized means info
pub fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            "off" => LevelFilter::OFF,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}
