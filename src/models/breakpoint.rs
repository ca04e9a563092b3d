//! Models related to breakpoints and paused-exchange editing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::flow::Headers;

/// Which half of an exchange a breakpoint pauses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Request,
    Response,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Request, Phase::Response];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breakpoint rule keyed by `host + path`.
///
/// `is_enabled` can only be true while at least one intercept flag is set;
/// the mutators below keep that true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRule {
    pub key: String,
    pub intercept_request: bool,
    pub intercept_response: bool,
    pub is_enabled: bool,
}

impl BreakpointRule {
    pub fn new(key: impl Into<String>, intercept_request: bool, intercept_response: bool) -> Self {
        let mut rule = Self {
            key: key.into(),
            intercept_request,
            intercept_response,
            is_enabled: intercept_request || intercept_response,
        };
        rule.normalize();
        rule
    }

    pub fn has_active_phase(&self) -> bool {
        self.intercept_request || self.intercept_response
    }

    pub fn intercepts(&self, phase: Phase) -> bool {
        self.is_enabled
            && match phase {
                Phase::Request => self.intercept_request,
                Phase::Response => self.intercept_response,
            }
    }

    /// Flip one phase. Turning a phase on also enables the rule.
    pub fn toggle(&mut self, phase: Phase) {
        let flag = match phase {
            Phase::Request => &mut self.intercept_request,
            Phase::Response => &mut self.intercept_response,
        };
        *flag = !*flag;
        if *flag {
            self.is_enabled = true;
        }
        self.normalize();
    }

    /// Re-establish `is_enabled => (intercept_request || intercept_response)`
    pub fn normalize(&mut self) {
        if !self.has_active_phase() {
            self.is_enabled = false;
        }
    }

    /// Flags pushed to the engine; a disabled rule is sent as false/false.
    pub fn effective_flags(&self) -> (bool, bool) {
        if self.is_enabled {
            (self.intercept_request, self.intercept_response)
        } else {
            (false, false)
        }
    }
}

/// A paused exchange waiting for a decision. Identity is `flow_id + phase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointHit {
    pub flow_id: String,
    pub phase: Phase,
    pub key: String,
    /// Seconds since epoch when the hit was queued
    pub timestamp: f64,
}

impl BreakpointHit {
    pub fn id(&self) -> String {
        format!("{}{}", self.flow_id, self.phase)
    }

    pub fn is_same(&self, flow_id: &str, phase: Phase) -> bool {
        self.flow_id == flow_id && self.phase == phase
    }
}

/// Request fields sent back when resuming a request-phase breakpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequestPayload {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: String,
}

/// Response fields sent back when resuming a response-phase breakpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// User edits applied when resuming the active breakpoint
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointEdit {
    Request(RequestPayload),
    Response(ResponsePayload),
}

impl BreakpointEdit {
    pub fn phase(&self) -> Phase {
        match self {
            BreakpointEdit::Request(_) => Phase::Request,
            BreakpointEdit::Response(_) => Phase::Response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_without_phases_is_never_enabled() {
        let mut rule = BreakpointRule::new("api.example.com/x", false, false);
        assert!(!rule.is_enabled);

        rule.is_enabled = true;
        rule.normalize();
        assert!(!rule.is_enabled);
    }

    #[test]
    fn toggling_a_phase_on_enables_the_rule() {
        let mut rule = BreakpointRule::new("k", false, false);
        rule.toggle(Phase::Response);
        assert!(rule.is_enabled);
        assert!(rule.intercepts(Phase::Response));
        assert!(!rule.intercepts(Phase::Request));

        rule.toggle(Phase::Response);
        assert!(!rule.is_enabled);
        assert_eq!(rule.effective_flags(), (false, false));
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Request).unwrap(), "\"request\"");
        let phase: Phase = serde_json::from_str("\"response\"").unwrap();
        assert_eq!(phase, Phase::Response);
    }
}
