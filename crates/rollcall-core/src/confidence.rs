//! Confidence-to-decision policy.
//!
//! A three-way split rather than accept/reject: an ambiguous face signal
//! fails open to a secondary factor instead of failing closed, which keeps
//! legitimate students under poor lighting out of the rejection path while
//! still demanding proof for borderline matches.

use std::sync::Arc;

use crate::policy::ThresholdPolicy;

/// Decision tier for an aggregated confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    /// Below the reject cutoff; terminal rejection.
    AutoReject,
    /// Plausible but not trusted alone; a fallback factor is required.
    RequireFallback,
    /// Trusted on the face signal alone.
    Accept,
}

pub struct ConfidencePolicyEngine {
    policy: Arc<ThresholdPolicy>,
}

impl ConfidencePolicyEngine {
    pub fn new(policy: Arc<ThresholdPolicy>) -> Self {
        Self { policy }
    }

    /// Map an averaged confidence to a tier. A session-specific minimum
    /// raises the accept bar but never lowers it below the policy's.
    pub fn evaluate(&self, avg_confidence: f64, session_min_confidence: Option<f64>) -> TierDecision {
        if avg_confidence < self.policy.confidence_reject {
            return TierDecision::AutoReject;
        }
        let accept_bar = session_min_confidence
            .map(|m| m.max(self.policy.require_fallback_tier))
            .unwrap_or(self.policy.require_fallback_tier);
        if avg_confidence < accept_bar {
            TierDecision::RequireFallback
        } else {
            TierDecision::Accept
        }
    }
}
