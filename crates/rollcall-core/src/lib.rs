//! Rollcall core — multi-factor attendance verification and anomaly risk
//! scoring.
//!
//! The pipeline takes an [`AttendanceClaim`] (camera frames plus optional
//! fallback tokens and location) and produces an [`AttendanceDecision`]:
//! accept, reject, request a secondary factor, or flag a probable proxy
//! attempt. A separate [`AnomalyRiskEngine`] scores the claim for human
//! review after the identity decision is made.
//!
//! The face identification model and the liveness detector are oracles
//! behind the [`BiometricMatcher`] and [`LivenessDetector`] traits; this
//! crate contains no pixel or ML processing.

pub mod aggregate;
pub mod anomaly;
pub mod confidence;
pub mod duplicate;
pub mod fallback;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod policy;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use aggregate::{AggregatedClaim, Aggregation, FrameConsistencyAggregator};
pub use anomaly::{device_fingerprint, AnomalyResult, AnomalyRiskEngine, RiskLevel};
pub use confidence::{ConfidencePolicyEngine, TierDecision};
pub use duplicate::DuplicateGuard;
pub use fallback::{FallbackAuthenticator, FallbackOutcome};
pub use liveness::{LivenessDetector, LivenessError, LivenessParams, LivenessVerdict};
pub use matcher::{BiometricMatcher, BoundingBox, FrameResult, MatcherError, MatcherHandle};
pub use orchestrator::{VerificationOrchestrator, VerifyError};
pub use policy::{ConfidenceLabel, PolicyError, RiskTiers, RiskWeights, ThresholdPolicy};
pub use store::{AttendanceStore, NewLogEntry, StoreError};
pub use types::{
    method_string, AttendanceClaim, AttendanceDecision, Factor, GeoPoint, Identity, LogRecord,
    Outcome, ProxyReason, RejectReason, SessionContext, SessionStatus, Student,
};
