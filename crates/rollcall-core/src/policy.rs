//! Tunable cutoffs for the verification pipeline.
//!
//! Every threshold lives here so the whole decision policy can be inspected
//! (and exported to clients) in one place. The policy is built once at
//! process start and is read-only afterwards — nothing mutates it
//! mid-decision.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error(
        "confidence tiers must be strictly decreasing (reject < low < medium < high), \
         got reject={reject}, low={low}, medium={medium}, high={high}"
    )]
    TiersNotDecreasing {
        high: f64,
        medium: f64,
        low: f64,
        reject: f64,
    },
    #[error("confidence tier out of range [0, 100]: {0}")]
    TierOutOfRange(f64),
    #[error(
        "fallback tier {tier} must lie within [reject={reject}, high={high}]"
    )]
    FallbackTierOutOfBounds { tier: f64, reject: f64, high: f64 },
    #[error("required_consistent_frames must be at least 1")]
    ZeroRequiredFrames,
    #[error("risk tiers must be strictly ascending (medium < high < critical), got {0}, {1}, {2}")]
    RiskTiersNotAscending(f64, f64, f64),
}

/// Confidence classification, total-ordered by severity.
///
/// Every confidence value maps to exactly one label (descending `>=` checks
/// against the four tiers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
    Rejected,
}

impl std::fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfidenceLabel::High => "HIGH",
            ConfidenceLabel::Medium => "MEDIUM",
            ConfidenceLabel::Low => "LOW",
            ConfidenceLabel::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Per-check caps for the anomaly risk score. Each sub-check can contribute
/// at most its own weight; the summed total is capped at 100.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskWeights {
    pub location: f64,
    pub time: f64,
    pub travel: f64,
    pub failed_attempts: f64,
    pub device: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            location: 30.0,
            time: 20.0,
            travel: 40.0,
            failed_attempts: 25.0,
            device: 15.0,
        }
    }
}

/// Ascending cutoffs for the risk-level step function. Scores below
/// `medium` are LOW.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskTiers {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskTiers {
    fn default() -> Self {
        // high sits at the travel weight so that impossible travel alone
        // escalates to HIGH
        Self {
            medium: 25.0,
            high: 40.0,
            critical: 70.0,
        }
    }
}

/// Immutable threshold configuration for the verification pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdPolicy {
    // Confidence tiers (percent, strictly decreasing)
    pub confidence_high: f64,
    pub confidence_medium: f64,
    pub confidence_low: f64,
    pub confidence_reject: f64,
    /// Face-alone accept bar. Confidence in `[reject, this)` requires a
    /// secondary factor rather than failing closed.
    pub require_fallback_tier: f64,

    // Temporal multi-frame verification
    pub required_consistent_frames: usize,
    /// Matched frames allowed to disagree with the majority identity before
    /// the sequence is treated as an identity switch.
    pub max_identity_switches: usize,

    // Duplicate prevention
    pub duplicate_window_seconds: i64,

    // Geofence
    pub campus_lat: f64,
    pub campus_lon: f64,
    pub geofence_radius_meters: f64,

    // Impossible travel
    pub impossible_speed_mps: f64,
    pub rapid_movement_meters: f64,
    pub rapid_movement_window_seconds: i64,

    // Session timing grace periods
    pub late_grace_seconds: i64,
    pub early_grace_seconds: i64,

    // Brute-force detection
    pub max_failed_attempts: u32,
    pub failed_attempts_window_seconds: i64,

    // Device fan-out
    pub device_fanout_count: u32,
    pub device_window_seconds: i64,

    // Liveness (forwarded to the detector oracle)
    pub ear_blink_threshold: f64,
    pub min_blink_frames: u32,

    pub risk_weights: RiskWeights,
    pub risk_tiers: RiskTiers,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            confidence_high: 80.0,
            confidence_medium: 65.0,
            confidence_low: 50.0,
            confidence_reject: 40.0,
            require_fallback_tier: 60.0,
            required_consistent_frames: 3,
            max_identity_switches: 0,
            duplicate_window_seconds: 300,
            campus_lat: 12.9716,
            campus_lon: 77.5946,
            geofence_radius_meters: 500.0,
            impossible_speed_mps: 42.0,
            rapid_movement_meters: 1000.0,
            rapid_movement_window_seconds: 60,
            late_grace_seconds: 3600,
            early_grace_seconds: 1800,
            max_failed_attempts: 5,
            failed_attempts_window_seconds: 300,
            device_fanout_count: 3,
            device_window_seconds: 3600,
            ear_blink_threshold: 0.21,
            min_blink_frames: 2,
            risk_weights: RiskWeights::default(),
            risk_tiers: RiskTiers::default(),
        }
    }
}

impl ThresholdPolicy {
    /// Validate the policy, failing fast on a misconfiguration.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for tier in [
            self.confidence_high,
            self.confidence_medium,
            self.confidence_low,
            self.confidence_reject,
        ] {
            if !(0.0..=100.0).contains(&tier) {
                return Err(PolicyError::TierOutOfRange(tier));
            }
        }
        if !(self.confidence_reject < self.confidence_low
            && self.confidence_low < self.confidence_medium
            && self.confidence_medium < self.confidence_high)
        {
            return Err(PolicyError::TiersNotDecreasing {
                high: self.confidence_high,
                medium: self.confidence_medium,
                low: self.confidence_low,
                reject: self.confidence_reject,
            });
        }
        if self.require_fallback_tier < self.confidence_reject
            || self.require_fallback_tier > self.confidence_high
        {
            return Err(PolicyError::FallbackTierOutOfBounds {
                tier: self.require_fallback_tier,
                reject: self.confidence_reject,
                high: self.confidence_high,
            });
        }
        if self.required_consistent_frames < 1 {
            return Err(PolicyError::ZeroRequiredFrames);
        }
        let t = self.risk_tiers;
        if !(t.medium < t.high && t.high < t.critical) {
            return Err(PolicyError::RiskTiersNotAscending(
                t.medium, t.high, t.critical,
            ));
        }
        Ok(())
    }

    /// Classify a confidence percentage against the four tiers.
    pub fn label(&self, confidence: f64) -> ConfidenceLabel {
        if confidence >= self.confidence_high {
            ConfidenceLabel::High
        } else if confidence >= self.confidence_medium {
            ConfidenceLabel::Medium
        } else if confidence >= self.confidence_low {
            ConfidenceLabel::Low
        } else {
            ConfidenceLabel::Rejected
        }
    }

    /// Read-only threshold export for client transparency.
    pub fn as_map(&self) -> serde_json::Value {
        serde_json::json!({
            "confidence": {
                "high": self.confidence_high,
                "medium": self.confidence_medium,
                "low": self.confidence_low,
                "reject": self.confidence_reject,
                "require_fallback": self.require_fallback_tier,
            },
            "temporal": {
                "required_frames": self.required_consistent_frames,
                "max_identity_switches": self.max_identity_switches,
            },
            "deduplication": {
                "window_seconds": self.duplicate_window_seconds,
            },
            "geofence": {
                "campus_lat": self.campus_lat,
                "campus_lon": self.campus_lon,
                "radius_meters": self.geofence_radius_meters,
            },
            "travel": {
                "impossible_speed_mps": self.impossible_speed_mps,
                "rapid_movement_meters": self.rapid_movement_meters,
                "rapid_movement_window_seconds": self.rapid_movement_window_seconds,
            },
            "timing": {
                "late_grace_seconds": self.late_grace_seconds,
                "early_grace_seconds": self.early_grace_seconds,
            },
            "failed_attempts": {
                "max": self.max_failed_attempts,
                "window_seconds": self.failed_attempts_window_seconds,
            },
            "device": {
                "fanout_count": self.device_fanout_count,
                "window_seconds": self.device_window_seconds,
            },
            "liveness": {
                "ear_blink_threshold": self.ear_blink_threshold,
                "min_blink_frames": self.min_blink_frames,
            },
            "risk": {
                "weights": self.risk_weights,
                "tiers": self.risk_tiers,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_validates() {
        ThresholdPolicy::default().validate().unwrap();
    }

    #[test]
    fn label_partitions_every_confidence() {
        let p = ThresholdPolicy::default();
        assert_eq!(p.label(95.0), ConfidenceLabel::High);
        assert_eq!(p.label(80.0), ConfidenceLabel::High);
        assert_eq!(p.label(70.0), ConfidenceLabel::Medium);
        assert_eq!(p.label(55.0), ConfidenceLabel::Low);
        assert_eq!(p.label(30.0), ConfidenceLabel::Rejected);
        assert_eq!(p.label(0.0), ConfidenceLabel::Rejected);
        assert_eq!(p.label(-5.0), ConfidenceLabel::Rejected);
        assert_eq!(p.label(150.0), ConfidenceLabel::High);
    }

    #[test]
    fn label_serializes_as_its_display_form() {
        for (label, expected) in [
            (ConfidenceLabel::High, "HIGH"),
            (ConfidenceLabel::Medium, "MEDIUM"),
            (ConfidenceLabel::Low, "LOW"),
            (ConfidenceLabel::Rejected, "REJECTED"),
        ] {
            assert_eq!(
                serde_json::to_value(label).unwrap(),
                serde_json::Value::String(expected.to_string())
            );
            assert_eq!(label.to_string(), expected);
        }
    }

    #[test]
    fn label_severity_monotone_in_confidence() {
        let p = ThresholdPolicy::default();
        fn rank(l: ConfidenceLabel) -> u8 {
            match l {
                ConfidenceLabel::High => 3,
                ConfidenceLabel::Medium => 2,
                ConfidenceLabel::Low => 1,
                ConfidenceLabel::Rejected => 0,
            }
        }
        let mut prev = rank(p.label(0.0));
        for c in 1..=100 {
            let cur = rank(p.label(c as f64));
            assert!(cur >= prev, "label rank decreased at confidence {c}");
            prev = cur;
        }
    }

    #[test]
    fn non_decreasing_tiers_rejected() {
        let p = ThresholdPolicy {
            confidence_medium: 85.0, // above high
            ..ThresholdPolicy::default()
        };
        assert!(matches!(
            p.validate(),
            Err(PolicyError::TiersNotDecreasing { .. })
        ));
    }

    #[test]
    fn fallback_tier_must_sit_between_reject_and_high() {
        let p = ThresholdPolicy {
            require_fallback_tier: 20.0,
            ..ThresholdPolicy::default()
        };
        assert!(matches!(
            p.validate(),
            Err(PolicyError::FallbackTierOutOfBounds { .. })
        ));
    }

    #[test]
    fn zero_required_frames_rejected() {
        let p = ThresholdPolicy {
            required_consistent_frames: 0,
            ..ThresholdPolicy::default()
        };
        assert!(matches!(p.validate(), Err(PolicyError::ZeroRequiredFrames)));
    }

    #[test]
    fn as_map_exports_all_sections() {
        let map = ThresholdPolicy::default().as_map();
        for key in [
            "confidence",
            "temporal",
            "deduplication",
            "geofence",
            "travel",
            "timing",
            "failed_attempts",
            "device",
            "liveness",
            "risk",
        ] {
            assert!(map.get(key).is_some(), "missing section {key}");
        }
        assert_eq!(map["confidence"]["reject"], 40.0);
    }
}
