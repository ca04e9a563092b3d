//! Map-local rules and rule collections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::flow::Headers;

pub const DEFAULT_SCHEME: &str = "https";
pub const DEFAULT_STATUS: u16 = 200;

/// Lower-case and trim a host. Returns `None` for an empty host.
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim().to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Force a leading `/`; an empty path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Canonical `host + path` rule key, or `None` when the host is empty
pub fn rule_key(host: &str, path: &str) -> Option<String> {
    let host = normalize_host(host)?;
    Some(format!("{}{}", host, normalize_path(path)))
}

/// Canonicalize a key typed as one `host/path` string. The host part is
/// lower-cased, the path keeps its case and gains a leading `/`.
pub fn normalize_key(key: &str) -> Option<String> {
    let key = key.trim();
    let (host, path) = match key.find('/') {
        Some(slash) => key.split_at(slash),
        None => (key, ""),
    };
    rule_key(host, path)
}

/// A persisted substitution: requests to `host + path` are answered locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRule {
    pub key: String,
    pub host: String,
    pub path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_status() -> u16 {
    DEFAULT_STATUS
}

fn default_enabled() -> bool {
    true
}

impl MapRule {
    /// Build an empty rule for `host + path`; `None` when the host is empty.
    pub fn new(host: &str, path: &str) -> Option<Self> {
        let host = normalize_host(host)?;
        let path = normalize_path(path);
        Some(Self {
            key: format!("{host}{path}"),
            host,
            path,
            scheme: default_scheme(),
            body: String::new(),
            status: DEFAULT_STATUS,
            headers: Headers::new(),
            is_enabled: true,
        })
    }
}

/// Named bundle of rules that is enabled or disabled as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapCollection {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub is_enabled: bool,
    #[serde(default)]
    pub enabled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rules: Vec<MapRule>,
}

impl MapCollection {
    pub fn new(name: impl Into<String>, rules: impl IntoIterator<Item = MapRule>) -> Self {
        let mut collection = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now(),
            is_enabled: false,
            enabled_at: None,
            rules: Vec::new(),
        };
        for rule in rules {
            collection.upsert_rule(rule);
        }
        collection
    }

    /// Insert or replace by key, keeping the original position on replace
    pub fn upsert_rule(&mut self, rule: MapRule) {
        match self.rules.iter_mut().find(|r| r.key == rule.key) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn rule(&self, key: &str) -> Option<&MapRule> {
        self.rules.iter().find(|r| r.key == key)
    }

    pub fn remove_rule(&mut self, key: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.key != key);
        before != self.rules.len()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.is_enabled = enabled;
        self.enabled_at = if enabled { Some(Utc::now()) } else { None };
    }
}
