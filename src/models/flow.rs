//! Flow model
//!
//! Represents a single network exchange reported by the interception engine.
//! Requests and responses arrive as separate partial events and are merged
//! into one `Flow` by the reconciliation store.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::breakpoint::Phase;

/// Header map as reported by the engine. Lookups should go through
/// [`header_value`] which ignores case.
pub type Headers = BTreeMap<String, String>;

/// Case-insensitive header lookup
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Outgoing request as seen by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Request {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Scheme, host, port and path split out of the request URL
    pub fn url_parts(&self) -> UrlParts {
        UrlParts::parse(&self.url)
    }
}

/// Upstream (or mocked) response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Response {
    /// Absent while the engine is still waiting on a decision
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Option<Headers>,
    #[serde(default)]
    pub body: Option<String>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|headers| header_value(headers, name))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Raw body bytes. Image bodies travel as `data:<mime>;base64,...` URLs and
    /// are decoded here; anything else is returned as its UTF-8 bytes.
    pub fn decoded_body(&self) -> Option<Vec<u8>> {
        let body = self.body.as_ref()?;
        match decode_data_url(body) {
            Some((_, data)) => Some(data),
            None => Some(body.as_bytes().to_vec()),
        }
    }
}

/// Decode a base64 `data:` URL into its mime type and payload.
pub fn decode_data_url(payload: &str) -> Option<(String, Vec<u8>)> {
    let rest = payload.strip_prefix("data:")?;
    let (meta, encoded) = rest.split_once(',')?;
    if !meta.contains(";base64") {
        return None;
    }
    let mime = meta.split(';').next().unwrap_or_default().trim();
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    let data = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    Some((mime.to_string(), data))
}

/// Address of the device that issued the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip: String,
    pub port: u16,
}

/// Breakpoint metadata attached by the engine while an exchange is paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointMeta {
    pub phase: Phase,
    /// "waiting" while paused, "released" once the engine resumed it
    pub state: String,
    pub key: String,
}

impl BreakpointMeta {
    pub const WAITING: &'static str = "waiting";

    pub fn is_waiting(&self) -> bool {
        self.state.eq_ignore_ascii_case(Self::WAITING)
    }
}

/// Direction of a streamed sub-message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    ClientToServer,
    ServerToClient,
}

/// A streamed sub-message (e.g. a WebSocket frame) belonging to a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMessage {
    pub direction: MessageDirection,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// One captured network exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Engine-assigned identifier, stable for the capture session
    pub id: String,

    /// Lifecycle tag of the last event applied ("request", "response", ...)
    pub event: String,

    /// Seconds since epoch of the first event seen for this flow
    #[serde(default)]
    pub timestamp: Option<f64>,

    #[serde(default)]
    pub request: Option<Request>,

    #[serde(default)]
    pub response: Option<Response>,

    #[serde(default)]
    pub client: Option<ClientInfo>,

    #[serde(default)]
    pub breakpoint: Option<BreakpointMeta>,

    /// Streamed sub-messages, in arrival order
    #[serde(default)]
    pub messages: Vec<FlowMessage>,
}

impl Flow {
    pub fn new(id: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event: event.into(),
            timestamp: None,
            request: None,
            response: None,
            client: None,
            breakpoint: None,
            messages: Vec::new(),
        }
    }

    /// Lower-cased host of the request URL, empty when unknown
    pub fn host(&self) -> String {
        self.request
            .as_ref()
            .map(|req| req.url_parts().host)
            .unwrap_or_default()
    }

    /// Request path without the query string
    pub fn path(&self) -> String {
        self.request
            .as_ref()
            .map(|req| req.url_parts().path)
            .unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.request
            .as_ref()
            .map(|req| req.url.as_str())
            .unwrap_or_default()
    }

    pub fn method(&self) -> &str {
        self.request
            .as_ref()
            .map(|req| req.method.as_str())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().and_then(|resp| resp.status)
    }

    /// `host + path`, the identity shared by map-local and breakpoint rules
    pub fn rule_key(&self) -> String {
        format!("{}{}", self.host(), self.path())
    }

    /// Paused at a breakpoint in either phase. The engine holds such a flow
    /// until it gets a decision, so retention must keep it.
    pub fn is_paused(&self) -> bool {
        self.breakpoint.as_ref().is_some_and(BreakpointMeta::is_waiting)
    }

    /// Whether the engine reports this flow paused for `phase`
    pub fn is_waiting_at(&self, phase: Phase) -> bool {
        self.breakpoint
            .as_ref()
            .is_some_and(|bp| bp.phase == phase && bp.is_waiting())
    }
}

/// Components of a request URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path without query, always starts with `/`
    pub path: String,
    pub query: Option<String>,
}

impl UrlParts {
    pub fn parse(url: &str) -> Self {
        let (scheme, remainder) = match url.find("://") {
            Some(pos) => (url[..pos].to_ascii_lowercase(), &url[pos + 3..]),
            None => ("http".to_string(), url),
        };

        let (authority, path_and_query) = match remainder.find(['/', '?', '#']) {
            Some(pos) => (&remainder[..pos], &remainder[pos..]),
            None => (remainder, ""),
        };
        // Drop userinfo if present
        let authority = authority.rsplit('@').next().unwrap_or(authority);

        let (host, port) = split_host_port(authority, &scheme);
        let without_fragment = path_and_query.split('#').next().unwrap_or_default();
        let (path, query) = match without_fragment.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (without_fragment, None),
        };
        let path = if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };

        Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path,
            query,
        }
    }
}

fn split_host_port(authority: &str, scheme: &str) -> (String, u16) {
    if authority.starts_with('[') {
        if let Some(end) = authority.find(']') {
            let host = authority[..=end].to_string();
            let port = authority[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or_else(|| default_port(scheme));
            return (host, port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port(scheme)),
        },
        None => (authority.to_string(), default_port(scheme)),
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}
