//! Engine launch configuration and user-facing proxy settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the engine executable
pub const ENGINE_PATH_ENV: &str = "FRTM_ENGINE_PATH";
/// Executable looked up on `PATH` when nothing else is configured
pub const DEFAULT_ENGINE_EXECUTABLE: &str = "mitmdump";
pub const DEFAULT_PORT: u16 = 8080;
/// Allow-list pattern that matches no real host
pub const DENY_ALL_PATTERN: &str = "^$";

/// How captured flows are retained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetentionMode {
    /// Session-scoped, bounded by count
    InMemory { max_flows: usize },
    /// Written through to SQLite and pruned by age
    Durable { horizon_days: u32 },
}

impl Default for RetentionMode {
    fn default() -> Self {
        RetentionMode::InMemory { max_flows: 500 }
    }
}

/// Persisted settings driving how the engine is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub port: u16,
    pub auto_start: bool,
    /// Hosts the engine is allowed to intercept when `restrict_to_pinned_hosts` is set
    pub pinned_hosts: Vec<String>,
    pub restrict_to_pinned_hosts: bool,
    pub retention: RetentionMode,
    /// Explicit engine executable; falls back to `FRTM_ENGINE_PATH`, then `PATH`
    pub engine_path: Option<PathBuf>,
    /// Addon script loaded by the engine (`-s`)
    pub addon_script: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auto_start: false,
            pinned_hosts: Vec::new(),
            restrict_to_pinned_hosts: false,
            retention: RetentionMode::default(),
            engine_path: None,
            addon_script: None,
            extra_args: Vec::new(),
        }
    }
}

impl ProxySettings {
    /// Build the launch configuration for the current settings
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            executable: resolve_engine_path(self.engine_path.as_ref()),
            port: self.port,
            restrict_to_hosts: self.restrict_to_pinned_hosts,
            hosts: self.pinned_hosts.clone(),
            addon_script: self.addon_script.clone(),
            extra_args: self.extra_args.clone(),
        }
    }

    /// Whether switching from `self` to `next` changes how the engine is
    /// launched (and so only applies after a restart)
    pub fn requires_restart(&self, next: &ProxySettings) -> bool {
        self.engine_config() != next.engine_config()
    }
}

/// Result of applying new settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsUpdate {
    /// The engine is running with launch parameters that no longer match
    pub requires_restart: bool,
}

/// Everything needed to launch one engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub executable: PathBuf,
    pub port: u16,
    pub restrict_to_hosts: bool,
    pub hosts: Vec<String>,
    pub addon_script: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl EngineConfig {
    pub fn new(executable: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            executable: executable.into(),
            port,
            restrict_to_hosts: false,
            hosts: Vec::new(),
            addon_script: None,
            extra_args: Vec::new(),
        }
    }

    /// Process arguments for the engine
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--listen-port".to_string(),
            self.port.to_string(),
            "--set".to_string(),
            "connection_strategy=lazy".to_string(),
            "--ssl-insecure".to_string(),
        ];

        if let Some(script) = &self.addon_script {
            args.push("-s".to_string());
            args.push(script.to_string_lossy().into_owned());
        }

        if self.restrict_to_hosts {
            for pattern in self.allow_host_patterns() {
                args.push("--allow-hosts".to_string());
                args.push(pattern);
            }
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Anchored subdomain patterns for the pinned hosts, or a single
    /// deny-all pattern when the list is empty
    pub fn allow_host_patterns(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .hosts
            .iter()
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        hosts.sort();
        hosts.dedup();

        if hosts.is_empty() {
            return vec![DENY_ALL_PATTERN.to_string()];
        }
        hosts
            .iter()
            .map(|host| format!(r"(^|\.){}$", regex::escape(host)))
            .collect()
    }

    /// File name used to find stale instances of the engine
    pub fn process_name(&self) -> Option<String> {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Resolve the engine executable: explicit path, then the environment
/// override, then a `PATH` lookup, then the bare executable name.
pub fn resolve_engine_path(explicit: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path.clone();
    }
    if let Some(path) = std::env::var_os(ENGINE_PATH_ENV) {
        return PathBuf::from(path);
    }
    find_on_path(DEFAULT_ENGINE_EXECUTABLE)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_EXECUTABLE))
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
