//! Post-decision anomaly risk scoring.
//!
//! Five independent sub-checks (location, timing, travel, failed attempts,
//! device fan-out), each capped at its configured weight, summed and capped
//! at 100. An anomaly never changes the identity decision — it is an
//! additive flag for downstream review.
//!
//! Each sub-check is pure given the current claim and its fetched history,
//! and a failing check contributes zero instead of suppressing the others.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::policy::ThresholdPolicy;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{AttendanceClaim, AttendanceDecision, GeoPoint, LogRecord, SessionContext};

/// Severity tier, a step function of the summed risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    /// 0-100, one decimal place.
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
    pub recommendations: Vec<String>,
}

impl AnomalyResult {
    pub fn none() -> Self {
        Self {
            is_anomaly: false,
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            reasons: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// Great-circle distance between two points in meters (haversine).
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Privacy-preserving device fingerprint: sha-256 of `ip:user_agent`,
/// truncated to 16 hex chars. Raw IPs are still stored for windowed
/// queries; the fingerprint keys the audit surface.
pub fn device_fingerprint(ip: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{ip}:{user_agent}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Output of one sub-check: zero or more reasons plus a score already
/// capped at the check's weight.
type CheckResult = (Vec<String>, f64);

pub struct AnomalyRiskEngine {
    policy: Arc<ThresholdPolicy>,
    store: Arc<dyn AttendanceStore>,
}

impl AnomalyRiskEngine {
    pub fn new(policy: Arc<ThresholdPolicy>, store: Arc<dyn AttendanceStore>) -> Self {
        Self { policy, store }
    }

    /// Score a claim after the identity decision. `now` is the claim
    /// timestamp (injected for testability).
    pub async fn score(
        &self,
        decision: &AttendanceDecision,
        claim: &AttendanceClaim,
        session: Option<&SessionContext>,
        now: DateTime<Utc>,
    ) -> AnomalyResult {
        let mut reasons = Vec::new();
        let mut recommendations = Vec::new();
        let mut total = 0.0;

        let student_id = decision.identity.as_ref().map(|i| i.student_id.as_str());

        let (r, s) = self.check_location(claim.location);
        if !r.is_empty() {
            recommendations.push("verify student is physically present on campus".to_string());
        }
        reasons.extend(r);
        total += s;

        let (r, s) = self.check_timing(session, now);
        if !r.is_empty() {
            recommendations.push("cross-check with session attendance records".to_string());
        }
        reasons.extend(r);
        total += s;

        let (r, s) = self
            .check_travel(student_id, claim.location, now)
            .await
            .unwrap_or_else(|e| self.failed_check("travel", e));
        if !r.is_empty() {
            recommendations.push("investigate possible credential sharing".to_string());
        }
        reasons.extend(r);
        total += s;

        let (r, s) = self
            .check_failed_attempts(student_id, claim.source_ip.as_deref())
            .await
            .unwrap_or_else(|e| self.failed_check("failed_attempts", e));
        if !r.is_empty() {
            recommendations.push("consider temporary account lockout".to_string());
        }
        reasons.extend(r);
        total += s;

        let (r, s) = self
            .check_device_fanout(student_id, claim.source_ip.as_deref())
            .await
            .unwrap_or_else(|e| self.failed_check("device", e));
        if !r.is_empty() {
            recommendations.push("review device access patterns".to_string());
        }
        reasons.extend(r);
        total += s;

        let risk_score = (total.min(100.0) * 10.0).round() / 10.0;
        AnomalyResult {
            is_anomaly: !reasons.is_empty(),
            risk_score,
            risk_level: self.risk_level(risk_score),
            reasons,
            recommendations,
        }
    }

    fn failed_check(&self, name: &str, err: StoreError) -> CheckResult {
        // One failing check must not suppress the others
        tracing::warn!(check = name, error = %err, "anomaly sub-check failed, scoring zero");
        (Vec::new(), 0.0)
    }

    fn risk_level(&self, score: f64) -> RiskLevel {
        let tiers = self.policy.risk_tiers;
        if score >= tiers.critical {
            RiskLevel::Critical
        } else if score >= tiers.high {
            RiskLevel::High
        } else if score >= tiers.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Geofence: score scales linearly with distance beyond the radius,
    /// capped at the location weight.
    fn check_location(&self, location: Option<GeoPoint>) -> CheckResult {
        let Some(loc) = location else {
            return (Vec::new(), 0.0);
        };
        let campus = GeoPoint {
            lat: self.policy.campus_lat,
            lon: self.policy.campus_lon,
        };
        let dist = haversine_meters(campus, loc);
        if dist <= self.policy.geofence_radius_meters {
            return (Vec::new(), 0.0);
        }
        let weight = self.policy.risk_weights.location;
        let score = (weight * (dist / 5000.0)).min(weight);
        (
            vec![format!("off-campus location ({}m from campus)", dist as i64)],
            score,
        )
    }

    /// Session timing: submissions past the grace period after the session
    /// ended, or before it started.
    fn check_timing(&self, session: Option<&SessionContext>, now: DateTime<Utc>) -> CheckResult {
        let Some(session) = session else {
            return (Vec::new(), 0.0);
        };
        let weight = self.policy.risk_weights.time;
        let mut reasons = Vec::new();
        let mut score = 0.0;

        if let Some(ended_at) = session.ended_at {
            let late = (now - ended_at).num_seconds();
            if late > self.policy.late_grace_seconds {
                reasons.push(format!(
                    "late submission ({}min after session ended)",
                    late / 60
                ));
                score = weight;
            }
        }
        if let Some(started_at) = session.started_at {
            let early = (started_at - now).num_seconds();
            if early > self.policy.early_grace_seconds {
                reasons.push(format!(
                    "early submission ({}min before session start)",
                    early / 60
                ));
                score = f64::max(score, weight * 0.5);
            }
        }
        (reasons, score)
    }

    /// Impossible travel: implied speed from the previous located log.
    async fn check_travel(
        &self,
        student_id: Option<&str>,
        location: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> Result<CheckResult, StoreError> {
        let (Some(student_id), Some(loc)) = (student_id, location) else {
            return Ok((Vec::new(), 0.0));
        };
        let Some(last) = self.store.last_located_log(student_id).await? else {
            return Ok((Vec::new(), 0.0));
        };
        let Some(last_loc) = last.location else {
            return Ok((Vec::new(), 0.0));
        };

        // Floor at 1s to avoid divide-by-zero on same-second submissions
        let elapsed = (now - last.timestamp).num_seconds().abs().max(1);
        let dist = haversine_meters(last_loc, loc);
        let speed_mps = dist / elapsed as f64;
        let weight = self.policy.risk_weights.travel;

        if speed_mps > self.policy.impossible_speed_mps {
            let kmh = (speed_mps * 3.6) as i64;
            return Ok((
                vec![format!(
                    "impossible travel ({}m in {}s = {}km/h)",
                    dist as i64, elapsed, kmh
                )],
                weight,
            ));
        }
        if elapsed < self.policy.rapid_movement_window_seconds
            && dist > self.policy.rapid_movement_meters
        {
            return Ok((
                vec![format!(
                    "suspicious rapid movement ({}m in {}s)",
                    dist as i64, elapsed
                )],
                weight * 0.6,
            ));
        }
        Ok((Vec::new(), 0.0))
    }

    /// Brute force: rejected/failed attempt velocity per student and per
    /// source IP, with moderate and severe tiers.
    async fn check_failed_attempts(
        &self,
        student_id: Option<&str>,
        source_ip: Option<&str>,
    ) -> Result<CheckResult, StoreError> {
        let window = self.policy.failed_attempts_window_seconds;
        let max = self.policy.max_failed_attempts;
        let mut reasons = Vec::new();
        let mut score = 0.0;

        if let Some(student_id) = student_id {
            let failed = self.store.failed_count_for_student(student_id, window).await?;
            let weight = self.policy.risk_weights.failed_attempts;
            if failed >= max {
                reasons.push(format!(
                    "repeated failures ({failed} failed attempts in {}min)",
                    window / 60
                ));
                score = weight;
            } else if failed >= max.div_ceil(2) {
                reasons.push(format!(
                    "multiple failures ({failed} failed attempts in {}min)",
                    window / 60
                ));
                score = weight * 0.5;
            }
        }

        if let Some(ip) = source_ip {
            let ip_failed = self.store.failed_count_for_ip(ip, window).await?;
            if ip_failed >= max * 2 {
                reasons.push(format!("device abuse ({ip_failed} failures from same device)"));
                score = f64::max(score, self.policy.risk_weights.device);
            }
        }
        Ok((reasons, score))
    }

    /// Device fan-out: distinct source IPs for one identity within the
    /// rolling window.
    async fn check_device_fanout(
        &self,
        student_id: Option<&str>,
        source_ip: Option<&str>,
    ) -> Result<CheckResult, StoreError> {
        let (Some(student_id), Some(_)) = (student_id, source_ip) else {
            return Ok((Vec::new(), 0.0));
        };
        let unique_ips = self
            .store
            .distinct_ips_for_student(student_id, self.policy.device_window_seconds)
            .await?;
        if unique_ips >= self.policy.device_fanout_count {
            return Ok((
                vec![format!(
                    "multi-device activity ({unique_ips} devices in {}h)",
                    self.policy.device_window_seconds / 3600
                )],
                self.policy.risk_weights.device,
            ));
        }
        Ok((Vec::new(), 0.0))
    }
}
