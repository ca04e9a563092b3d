//! Line protocol spoken with the interception engine.
//!
//! Every message is one JSON object per line. Commands flow from the control
//! plane to the engine and are discriminated by `type`; events flow back and
//! are either flow records, streamed sub-messages, or free-form log text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    ClientInfo, BreakpointMeta, FlowMessage, Headers, MapRule, Phase, Request, RequestPayload,
    Response, ResponsePayload, TrafficProfile,
};

/// Control plane -> engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineCommand {
    /// Inject a local response for a captured flow
    MockResponse {
        id: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
    },
    /// Replace the request body (and optionally headers) of a captured flow
    MockRequest {
        id: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
    },
    /// Upsert a persistent host+path mapping
    MockRule {
        key: String,
        body: String,
        status: u16,
        headers: Headers,
        enabled: bool,
    },
    DeleteRule {
        key: String,
    },
    TrafficProfile {
        profile: TrafficProfile,
    },
    /// Resend a (possibly modified) request
    RetryFlow {
        id: String,
        method: String,
        url: String,
        body: String,
        headers: Headers,
    },
    BreakpointRule {
        key: String,
        request: bool,
        response: bool,
    },
    BreakpointContinue {
        id: String,
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        request: Option<RequestPayload>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponsePayload>,
    },
}

impl EngineCommand {
    pub fn mock_rule(rule: &MapRule) -> Self {
        Self::mock_rule_with_state(rule, rule.is_enabled)
    }

    pub fn mock_rule_with_state(rule: &MapRule, enabled: bool) -> Self {
        EngineCommand::MockRule {
            key: rule.key.clone(),
            body: rule.body.clone(),
            status: rule.status,
            headers: rule.headers.clone(),
            enabled,
        }
    }

    /// Wire name of the command, as found in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            EngineCommand::MockResponse { .. } => "mock_response",
            EngineCommand::MockRequest { .. } => "mock_request",
            EngineCommand::MockRule { .. } => "mock_rule",
            EngineCommand::DeleteRule { .. } => "delete_rule",
            EngineCommand::TrafficProfile { .. } => "traffic_profile",
            EngineCommand::RetryFlow { .. } => "retry_flow",
            EngineCommand::BreakpointRule { .. } => "breakpoint_rule",
            EngineCommand::BreakpointContinue { .. } => "breakpoint_continue",
        }
    }

    /// Single-line JSON, without the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A full or partial flow record
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlowEvent {
    pub id: String,
    pub event: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub client: Option<ClientInfo>,
    #[serde(default)]
    pub request: Option<Request>,
    #[serde(default)]
    pub response: Option<Response>,
    #[serde(default)]
    pub breakpoint: Option<BreakpointMeta>,
}

/// A streamed sub-message for an existing flow
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageEvent {
    /// Id of the parent flow
    pub id: String,
    pub message: FlowMessage,
}

/// Engine -> control plane
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Flow(FlowEvent),
    Message(MessageEvent),
    /// Anything that is not a recognized JSON shape
    Log(String),
}

const MESSAGE_TAGS: [&str; 2] = ["message", "websocket_message"];

impl EngineEvent {
    /// Classify one line from the engine's stdout. Never fails: unknown or
    /// malformed input becomes [`EngineEvent::Log`].
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let value = match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ Value::Object(_)) => value,
            _ => return EngineEvent::Log(line.to_string()),
        };

        let tag = value.get("event").and_then(Value::as_str);
        let has_id = value.get("id").is_some_and(Value::is_string);

        match tag {
            Some(tag) if has_id && MESSAGE_TAGS.contains(&tag) => {
                match serde_json::from_value::<MessageEvent>(value) {
                    Ok(event) => EngineEvent::Message(event),
                    Err(err) => {
                        tracing::debug!("Unrecognized message event ({err}), treating as log");
                        EngineEvent::Log(line.to_string())
                    }
                }
            }
            Some(_) if has_id => match serde_json::from_value::<FlowEvent>(value) {
                Ok(event) => EngineEvent::Flow(event),
                Err(err) => {
                    tracing::debug!("Unrecognized flow event ({err}), treating as log");
                    EngineEvent::Log(line.to_string())
                }
            },
            _ => EngineEvent::Log(line.to_string()),
        }
    }
}
