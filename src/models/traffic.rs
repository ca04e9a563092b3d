//! Link-shaping profiles applied by the engine.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static PRESETS: Lazy<Vec<TrafficProfile>> = Lazy::new(|| {
    vec![
        TrafficProfile::disabled(),
        TrafficProfile::preset("edge", "Edge", "2G EDGE network", 400, 80, 240, 200, 0.0),
        TrafficProfile::preset("3g", "3G", "Average 3G network", 200, 40, 780, 330, 0.0),
        TrafficProfile::preset("lte", "LTE", "Good 4G/LTE network", 50, 10, 12_000, 5_000, 0.0),
        TrafficProfile::preset(
            "lossy-wifi",
            "Lossy Wi-Fi",
            "Congested Wi-Fi with packet loss",
            30,
            25,
            8_000,
            4_000,
            0.05,
        ),
    ]
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub downstream_kbps: u32,
    pub upstream_kbps: u32,
    /// Fraction of packets dropped, 0..=1
    pub packet_loss: f64,
}

impl TrafficProfile {
    pub const DISABLED_ID: &'static str = "disabled";

    /// Sentinel profile meaning "no shaping"
    pub fn disabled() -> Self {
        Self {
            id: Self::DISABLED_ID.to_string(),
            name: "Disabled".to_string(),
            description: "No traffic shaping".to_string(),
            latency_ms: 0,
            jitter_ms: 0,
            downstream_kbps: 0,
            upstream_kbps: 0,
            packet_loss: 0.0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.latency_ms == 0
            && self.jitter_ms == 0
            && self.downstream_kbps == 0
            && self.upstream_kbps == 0
            && self.packet_loss == 0.0
    }

    /// Clamp packet loss into 0..=1; NaN becomes 0.
    pub fn sanitized(mut self) -> Self {
        self.packet_loss = if self.packet_loss.is_nan() {
            0.0
        } else {
            self.packet_loss.clamp(0.0, 1.0)
        };
        self
    }

    /// Built-in profiles, the disabled sentinel first
    pub fn presets() -> &'static [TrafficProfile] {
        &PRESETS
    }

    /// Built-in profile by id, case-insensitive
    pub fn preset_by_id(id: &str) -> Option<TrafficProfile> {
        PRESETS
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(id.trim()))
            .cloned()
    }

    #[allow(clippy::too_many_arguments)]
    fn preset(
        id: &str,
        name: &str,
        description: &str,
        latency_ms: u32,
        jitter_ms: u32,
        downstream_kbps: u32,
        upstream_kbps: u32,
        packet_loss: f64,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            latency_ms,
            jitter_ms,
            downstream_kbps,
            upstream_kbps,
            packet_loss,
        }
    }
}

impl Default for TrafficProfile {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sentinel_is_all_zero() {
        let profile = TrafficProfile::disabled();
        assert!(profile.is_disabled());
        assert_eq!(TrafficProfile::presets()[0], profile);
        assert!(TrafficProfile::presets()[1..].iter().all(|p| !p.is_disabled()));
    }

    #[test]
    fn packet_loss_is_clamped() {
        let mut profile = TrafficProfile::disabled();
        profile.packet_loss = 3.0;
        assert_eq!(profile.clone().sanitized().packet_loss, 1.0);
        profile.packet_loss = f64::NAN;
        assert_eq!(profile.sanitized().packet_loss, 0.0);
    }

    #[test]
    fn presets_are_found_by_id() {
        assert_eq!(TrafficProfile::preset_by_id(" LTE ").unwrap().latency_ms, 50);
        assert!(TrafficProfile::preset_by_id("5g").is_none());
    }
}
