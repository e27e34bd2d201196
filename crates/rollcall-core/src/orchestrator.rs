//! The top-level verification state machine.
//!
//! Sequence: session check, frame aggregation, confidence policy, fallback
//! (when required), claim consistency, duplicate check, liveness, decision.
//! Every stage emits an explicit outcome variant; the orchestrator composes
//! them rather than catching exceptions.
//!
//! Only oracle and store failures surface as [`VerifyError`] — everything
//! else is an ordinary [`AttendanceDecision`].

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::aggregate::{AggregatedClaim, Aggregation, FrameConsistencyAggregator};
use crate::anomaly::{AnomalyResult, AnomalyRiskEngine};
use crate::confidence::{ConfidencePolicyEngine, TierDecision};
use crate::duplicate::DuplicateGuard;
use crate::fallback::{FallbackAuthenticator, FallbackOutcome};
use crate::liveness::{LivenessDetector, LivenessError, LivenessParams};
use crate::matcher::{MatcherError, MatcherHandle};
use crate::policy::ThresholdPolicy;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{
    AttendanceClaim, AttendanceDecision, Factor, Identity, Outcome, ProxyReason, RejectReason,
    SessionContext, SessionStatus, Student,
};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no frames supplied with the claim")]
    NoFrames,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {id} is not active (status: {status})")]
    SessionNotActive { id: String, status: String },
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the primary (face) factor established, before policy is applied.
enum FaceSignal {
    /// One consistent identity with an averaged confidence.
    Resolved(AggregatedClaim),
    /// A proxy flag raised purely by face ambiguity. A successful fallback
    /// match downgrades it to a note; a claim mismatch later never is.
    Ambiguous {
        reason: ProxyReason,
        frames_matched: usize,
        total: usize,
    },
    /// No usable face signal at all.
    Inconclusive {
        note: String,
        frames_matched: usize,
        total: usize,
    },
}

/// Sequences the pipeline stages into one `AttendanceDecision`.
pub struct VerificationOrchestrator {
    policy: Arc<ThresholdPolicy>,
    matcher: Arc<MatcherHandle>,
    liveness: Arc<dyn LivenessDetector>,
    store: Arc<dyn AttendanceStore>,
    aggregator: FrameConsistencyAggregator,
    confidence: ConfidencePolicyEngine,
    fallback: FallbackAuthenticator,
    duplicates: DuplicateGuard,
    anomaly: AnomalyRiskEngine,
}

impl VerificationOrchestrator {
    pub fn new(
        policy: Arc<ThresholdPolicy>,
        matcher: Arc<MatcherHandle>,
        liveness: Arc<dyn LivenessDetector>,
        store: Arc<dyn AttendanceStore>,
    ) -> Self {
        Self {
            aggregator: FrameConsistencyAggregator::new(policy.clone()),
            confidence: ConfidencePolicyEngine::new(policy.clone()),
            fallback: FallbackAuthenticator::new(store.clone()),
            duplicates: DuplicateGuard::new(policy.clone(), store.clone()),
            anomaly: AnomalyRiskEngine::new(policy.clone(), store.clone()),
            policy,
            matcher,
            liveness,
            store,
        }
    }

    /// Run one claim to a terminal decision.
    pub async fn decide(&self, claim: &AttendanceClaim) -> Result<AttendanceDecision, VerifyError> {
        let session = match &claim.session_id {
            Some(id) => Some(self.require_active_session(id).await?),
            None => None,
        };

        if claim.frames.is_empty() {
            return Err(VerifyError::NoFrames);
        }

        // Snapshot the matcher once so a concurrent re-enrollment swap
        // cannot change models mid-decision.
        let matcher = self.matcher.load();
        let mut frame_results = Vec::with_capacity(claim.frames.len());
        for frame in &claim.frames {
            let result = matcher.identify(frame).await?;
            tracing::debug!(?result, "frame identified");
            frame_results.push(result);
        }

        let mut notes = Vec::new();
        let mut factors = vec![Factor::Face];

        let signal = match self.aggregator.aggregate(&frame_results) {
            Aggregation::Consistent(agg) => FaceSignal::Resolved(agg),
            Aggregation::MultipleFaces { frames, total } => FaceSignal::Ambiguous {
                reason: ProxyReason::MultipleFaces { frames, total },
                frames_matched: 0,
                total,
            },
            Aggregation::IdentitySwitch {
                identities,
                frames_matched,
                total,
            } => {
                notes.push(format!("identities seen: {}", identities.join(", ")));
                FaceSignal::Ambiguous {
                    reason: ProxyReason::IdentitySwitch,
                    frames_matched,
                    total,
                }
            }
            Aggregation::NoFace { total } => FaceSignal::Inconclusive {
                note: "no face detected in any frame".to_string(),
                frames_matched: 0,
                total,
            },
            Aggregation::InsufficientFrames {
                matched,
                required,
                total,
            } => FaceSignal::Inconclusive {
                note: format!("insufficient consistent frames ({matched}/{required} required)"),
                frames_matched: matched,
                total,
            },
        };

        // Resolve the face signal into an identity (possibly via fallback)
        // or a terminal outcome.
        let total_frames = claim.frames.len();
        let (identity, confidence, frames_matched) = match signal {
            FaceSignal::Resolved(agg) => {
                let session_min = session.as_ref().map(|s| s.min_confidence);
                match self.confidence.evaluate(agg.avg_confidence, session_min) {
                    TierDecision::AutoReject => {
                        tracing::warn!(
                            student = %agg.identity.roll_number,
                            confidence = agg.avg_confidence,
                            "auto-reject: confidence below floor"
                        );
                        notes.push(format!(
                            "confidence {:.1}% below threshold {:.1}%",
                            agg.avg_confidence, self.policy.confidence_reject
                        ));
                        return Ok(self.decision(
                            claim,
                            Outcome::Rejected {
                                reason: RejectReason::LowConfidence {
                                    confidence: agg.avg_confidence,
                                    cutoff: self.policy.confidence_reject,
                                },
                            },
                            Some(agg.identity),
                            agg.avg_confidence,
                            factors,
                            agg.frames_matched,
                            total_frames,
                            None,
                            notes,
                        ));
                    }
                    TierDecision::Accept => {
                        (agg.identity, agg.avg_confidence, agg.frames_matched)
                    }
                    TierDecision::RequireFallback => {
                        if !claim.has_fallback_token() {
                            notes.push(format!(
                                "face confidence {:.1}% needs a secondary factor",
                                agg.avg_confidence
                            ));
                            return Ok(self.decision(
                                claim,
                                Outcome::BiometricRequired,
                                Some(agg.identity),
                                agg.avg_confidence,
                                factors,
                                agg.frames_matched,
                                total_frames,
                                None,
                                notes,
                            ));
                        }
                        match self.fallback.authenticate(claim).await? {
                            FallbackOutcome::Matched { student, factor } => {
                                factors.push(factor);
                                if student.id != agg.identity.student_id {
                                    // The secondary factor names someone else
                                    notes.push(format!(
                                        "face recognized {} but {} token belongs to {}",
                                        agg.identity.name, factor, student.name
                                    ));
                                    let reason = match factor {
                                        Factor::Fingerprint => ProxyReason::FingerprintMismatch,
                                        _ => ProxyReason::IdCardMismatch,
                                    };
                                    return Ok(self.decision(
                                        claim,
                                        Outcome::ProxySuspected { reason },
                                        Some(agg.identity),
                                        agg.avg_confidence,
                                        factors,
                                        agg.frames_matched,
                                        total_frames,
                                        None,
                                        notes,
                                    ));
                                }
                                notes.push(format!(
                                    "face confidence {:.1}% confirmed by {}",
                                    agg.avg_confidence, factor
                                ));
                                (agg.identity, 100.0, agg.frames_matched)
                            }
                            FallbackOutcome::NotFound { factor } => {
                                return Ok(self.fallback_not_found(
                                    claim,
                                    factor,
                                    factors,
                                    agg.frames_matched,
                                    total_frames,
                                    notes,
                                ));
                            }
                            FallbackOutcome::NoTokenSupplied => unreachable!(),
                        }
                    }
                }
            }
            FaceSignal::Ambiguous {
                reason,
                frames_matched,
                total,
            } => {
                if !claim.has_fallback_token() {
                    return Ok(self.decision(
                        claim,
                        Outcome::ProxySuspected { reason },
                        None,
                        0.0,
                        factors,
                        frames_matched,
                        total,
                        None,
                        notes,
                    ));
                }
                match self.fallback.authenticate(claim).await? {
                    FallbackOutcome::Matched { student, factor } => {
                        // Proxy flag raised solely by face ambiguity is
                        // downgraded to a note on fallback success.
                        factors.push(factor);
                        notes.push(format!("face ambiguity downgraded ({reason}); {factor} matched"));
                        tracing::info!(
                            student = %student.roll_number,
                            %factor,
                            "face ambiguity resolved by fallback factor"
                        );
                        (identity_of(&student), 100.0, frames_matched)
                    }
                    FallbackOutcome::NotFound { factor } => {
                        // The original face-ambiguity flag stands
                        factors.push(factor);
                        notes.push(format!("{factor} token matched no student"));
                        return Ok(self.decision(
                            claim,
                            Outcome::ProxySuspected { reason },
                            None,
                            0.0,
                            factors,
                            frames_matched,
                            total,
                            None,
                            notes,
                        ));
                    }
                    FallbackOutcome::NoTokenSupplied => unreachable!(),
                }
            }
            FaceSignal::Inconclusive {
                note,
                frames_matched,
                total,
            } => {
                notes.push(note);
                if !claim.has_fallback_token() {
                    return Ok(self.decision(
                        claim,
                        Outcome::BiometricRequired,
                        None,
                        0.0,
                        factors,
                        frames_matched,
                        total,
                        None,
                        notes,
                    ));
                }
                match self.fallback.authenticate(claim).await? {
                    FallbackOutcome::Matched { student, factor } => {
                        factors.push(factor);
                        (identity_of(&student), 100.0, frames_matched)
                    }
                    FallbackOutcome::NotFound { factor } => {
                        return Ok(self.fallback_not_found(
                            claim,
                            factor,
                            factors,
                            frames_matched,
                            total,
                            notes,
                        ));
                    }
                    FallbackOutcome::NoTokenSupplied => unreachable!(),
                }
            }
        };

        // Claim consistency: the asserted identity must be the resolved one.
        if let Some(claimed) = &claim.claimed_identity {
            if !identity.matches_claim(claimed) {
                tracing::warn!(
                    claimed,
                    recognized = %identity.name,
                    "claimed identity mismatch"
                );
                notes.push(format!("claimed '{claimed}' but recognized {}", identity.name));
                return Ok(self.decision(
                    claim,
                    Outcome::ProxySuspected {
                        reason: ProxyReason::IdMismatch,
                    },
                    Some(identity),
                    confidence,
                    factors,
                    frames_matched,
                    total_frames,
                    None,
                    notes,
                ));
            }
        }

        // Supplementary tokens alongside the resolving factor must belong to
        // the same student. Every factor checked is recorded either way.
        if let Some(mismatch) = self
            .cross_check_tokens(claim, &identity, &mut factors, &mut notes)
            .await?
        {
            return Ok(self.decision(
                claim,
                Outcome::ProxySuspected { reason: mismatch },
                Some(identity),
                confidence,
                factors,
                frames_matched,
                total_frames,
                None,
                notes,
            ));
        }

        // Duplicate guard, before any write. The store's uniqueness
        // constraint closes the remaining race at append time.
        let existing = self
            .duplicates
            .existing_mark(&identity.student_id, claim.session_id.as_deref())
            .await?;
        if let Some(existing) = existing {
            notes.push(format!("attendance already marked at {}", existing.timestamp));
            return Ok(self.decision(
                claim,
                Outcome::AlreadyMarked {
                    marked_at: existing.timestamp,
                },
                Some(identity),
                confidence,
                factors,
                frames_matched,
                total_frames,
                None,
                notes,
            ));
        }

        // Liveness gates only a would-be-verified outcome.
        let liveness_required =
            claim.require_liveness || session.as_ref().is_some_and(|s| s.require_liveness);
        let mut liveness_passed = None;
        if liveness_required {
            let params = LivenessParams {
                ear_blink_threshold: self.policy.ear_blink_threshold,
                min_blink_frames: self.policy.min_blink_frames,
            };
            let verdict = self.liveness.check(&claim.frames, params).await?;
            liveness_passed = Some(verdict.passed);
            if !verdict.passed {
                tracing::warn!(
                    student = %identity.roll_number,
                    message = %verdict.message,
                    "liveness check failed"
                );
                // Keep identity and confidence for the audit trail
                return Ok(self.decision(
                    claim,
                    Outcome::Rejected {
                        reason: RejectReason::LivenessFailed {
                            message: verdict.message,
                        },
                    },
                    Some(identity),
                    confidence,
                    factors,
                    frames_matched,
                    total_frames,
                    liveness_passed,
                    notes,
                ));
            }
        }

        if self.policy.label(confidence) == crate::policy::ConfidenceLabel::Low {
            notes.push("low confidence - consider re-verification".to_string());
        }

        tracing::info!(
            student = %identity.roll_number,
            confidence,
            method = %crate::types::method_string(&factors),
            "verified"
        );
        Ok(self.decision(
            claim,
            Outcome::Verified,
            Some(identity),
            confidence,
            factors,
            frames_matched,
            total_frames,
            liveness_passed,
            notes,
        ))
    }

    /// Score a claim for anomalies after a non-rejecting decision. Never
    /// alters the decision; oracle/store failures inside sub-checks score
    /// zero.
    pub async fn score_anomaly(
        &self,
        decision: &AttendanceDecision,
        claim: &AttendanceClaim,
    ) -> AnomalyResult {
        let session = match &claim.session_id {
            Some(id) => self.store.find_session(id).await.ok().flatten(),
            None => None,
        };
        self.anomaly
            .score(decision, claim, session.as_ref(), Utc::now())
            .await
    }

    async fn require_active_session(&self, id: &str) -> Result<SessionContext, VerifyError> {
        let session = self
            .store
            .find_session(id)
            .await?
            .ok_or_else(|| VerifyError::SessionNotFound(id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(VerifyError::SessionNotActive {
                id: id.to_string(),
                status: session.status.as_str().to_string(),
            });
        }
        Ok(session)
    }

    /// Check supplied tokens that were not the resolving factor against the
    /// resolved student's stored tokens.
    async fn cross_check_tokens(
        &self,
        claim: &AttendanceClaim,
        identity: &Identity,
        factors: &mut Vec<Factor>,
        notes: &mut Vec<String>,
    ) -> Result<Option<ProxyReason>, StoreError> {
        if !claim.has_fallback_token() {
            return Ok(None);
        }
        let Some(student) = self.store.find_student(&identity.student_id).await? else {
            // Matcher knows an identity the store does not; surface it for
            // the audit trail rather than guessing.
            notes.push(format!("student record not found for {}", identity.student_id));
            return Ok(None);
        };

        let mut mismatch = None;
        if let Some(token) = &claim.fingerprint_token {
            if !factors.contains(&Factor::Fingerprint) {
                factors.push(Factor::Fingerprint);
                if student.fingerprint_token.as_deref() != Some(token.as_str()) {
                    notes.push(format!(
                        "supplied fingerprint does not belong to {}",
                        student.name
                    ));
                    mismatch = Some(ProxyReason::FingerprintMismatch);
                }
            }
        }
        if let Some(token) = &claim.id_card_token {
            if !factors.contains(&Factor::IdCard) {
                factors.push(Factor::IdCard);
                if mismatch.is_none()
                    && student.id_card_token.as_deref() != Some(token.as_str())
                {
                    notes.push(format!("supplied ID card does not belong to {}", student.name));
                    mismatch = Some(ProxyReason::IdCardMismatch);
                }
            }
        }
        Ok(mismatch)
    }

    fn fallback_not_found(
        &self,
        claim: &AttendanceClaim,
        factor: Factor,
        mut factors: Vec<Factor>,
        frames_matched: usize,
        total_frames: usize,
        notes: Vec<String>,
    ) -> AttendanceDecision {
        factors.push(factor);
        let reason = match factor {
            Factor::Fingerprint => RejectReason::FingerprintNotFound,
            _ => RejectReason::IdCardNotFound,
        };
        self.decision(
            claim,
            Outcome::Rejected { reason },
            None,
            0.0,
            factors,
            frames_matched,
            total_frames,
            None,
            notes,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        claim: &AttendanceClaim,
        outcome: Outcome,
        identity: Option<Identity>,
        confidence: f64,
        factors: Vec<Factor>,
        frames_matched: usize,
        total_frames: usize,
        liveness_passed: Option<bool>,
        notes: Vec<String>,
    ) -> AttendanceDecision {
        AttendanceDecision {
            confidence_label: self.policy.label(confidence),
            outcome,
            identity,
            confidence,
            verification_method: factors,
            frames_matched,
            total_frames,
            liveness_passed,
            session_id: claim.session_id.clone(),
            notes,
        }
    }
}

fn identity_of(student: &Student) -> Identity {
    Identity {
        student_id: student.id.clone(),
        name: student.name.clone(),
        roll_number: student.roll_number.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessVerdict;
    use crate::matcher::{BiometricMatcher, FrameResult};
    use crate::testutil::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    fn ident(id: &str) -> Identity {
        Identity {
            student_id: id.to_string(),
            name: id.to_uppercase(),
            roll_number: format!("R-{id}"),
        }
    }

    fn student(id: &str) -> Student {
        Student {
            id: id.to_string(),
            name: id.to_uppercase(),
            roll_number: format!("R-{id}"),
            fingerprint_token: Some(format!("fp-{id}")),
            id_card_token: Some(format!("card-{id}")),
        }
    }

    /// Matcher that replays a scripted verdict per frame, in order.
    struct ScriptedMatcher {
        script: Mutex<std::collections::VecDeque<FrameResult>>,
    }

    impl ScriptedMatcher {
        fn new(results: Vec<FrameResult>) -> Arc<MatcherHandle> {
            Arc::new(MatcherHandle::new(Arc::new(Self {
                script: Mutex::new(results.into()),
            })))
        }
    }

    #[async_trait]
    impl BiometricMatcher for ScriptedMatcher {
        async fn identify(&self, _frame: &[u8]) -> Result<FrameResult, MatcherError> {
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(FrameResult::NoFace))
        }
    }

    /// Matcher whose oracle never answers in time.
    struct TimedOutMatcher;

    #[async_trait]
    impl BiometricMatcher for TimedOutMatcher {
        async fn identify(&self, _frame: &[u8]) -> Result<FrameResult, MatcherError> {
            Err(MatcherError::Timeout(10))
        }
    }

    struct FixedLiveness {
        passed: bool,
        calls: Mutex<u32>,
    }

    impl FixedLiveness {
        fn new(passed: bool) -> Arc<Self> {
            Arc::new(Self {
                passed,
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl LivenessDetector for FixedLiveness {
        async fn check(
            &self,
            _frames: &[Vec<u8>],
            _params: LivenessParams,
        ) -> Result<LivenessVerdict, LivenessError> {
            *self.calls.lock().unwrap() += 1;
            Ok(LivenessVerdict {
                passed: self.passed,
                message: if self.passed {
                    "blink detected".to_string()
                } else {
                    "no blink detected".to_string()
                },
            })
        }
    }

    fn matched(id: &str, confidence: f64) -> FrameResult {
        FrameResult::Matched {
            identity: ident(id),
            confidence,
            bbox: None,
        }
    }

    fn frames(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 4]).collect()
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        script: Vec<FrameResult>,
    ) -> VerificationOrchestrator {
        VerificationOrchestrator::new(
            Arc::new(ThresholdPolicy::default()),
            ScriptedMatcher::new(script),
            FixedLiveness::new(true),
            store,
        )
    }

    #[tokio::test]
    async fn high_confidence_face_alone_verifies() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store.clone(),
            vec![matched("ash", 95.0), matched("ash", 95.0), matched("ash", 95.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);
        assert_eq!(decision.method_string(), "Face");
        assert_eq!(decision.confidence, 95.0);
        assert_eq!(decision.identity.unwrap().student_id, "ash");
        assert!(decision.liveness_passed.is_none());
    }

    #[tokio::test]
    async fn midband_confidence_without_token_requires_biometric() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![matched("ash", 45.0), matched("ash", 45.0), matched("ash", 45.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::BiometricRequired);
        // Identity is retained for diagnostics even though nothing is written
        assert!(decision.identity.is_some());
    }

    #[tokio::test]
    async fn midband_confidence_with_fingerprint_verifies_at_full_confidence() {
        let store = Arc::new(MemoryStore::default());
        store.add_student(student("ash"));
        let orch = orchestrator(
            store,
            vec![matched("ash", 45.0), matched("ash", 45.0), matched("ash", 45.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            fingerprint_token: Some("fp-ash".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);
        assert_eq!(decision.confidence, 100.0);
        assert_eq!(decision.method_string(), "Face+Fingerprint");
    }

    #[tokio::test]
    async fn midband_fingerprint_of_someone_else_is_proxy() {
        let store = Arc::new(MemoryStore::default());
        store.add_student(student("ash"));
        store.add_student(student("kai"));
        let orch = orchestrator(
            store,
            vec![matched("ash", 45.0), matched("ash", 45.0), matched("ash", 45.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            fingerprint_token: Some("fp-kai".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(
            decision.outcome,
            Outcome::ProxySuspected {
                reason: ProxyReason::FingerprintMismatch
            }
        );
        assert_eq!(decision.method_string(), "Face+Fingerprint");
    }

    #[tokio::test]
    async fn below_reject_floor_is_terminal_rejection() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![matched("ash", 20.0), matched("ash", 20.0), matched("ash", 20.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            // A token never rescues an auto-reject
            fingerprint_token: Some("fp-ash".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert!(matches!(
            decision.outcome,
            Outcome::Rejected {
                reason: RejectReason::LowConfidence { .. }
            }
        ));
    }

    #[tokio::test]
    async fn multi_face_in_one_frame_dominates() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![
                matched("ash", 99.0),
                FrameResult::MultipleFaces { count: 2 },
                matched("ash", 99.0),
            ],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert!(matches!(
            decision.outcome,
            Outcome::ProxySuspected {
                reason: ProxyReason::MultipleFaces { .. }
            }
        ));
    }

    #[tokio::test]
    async fn multi_face_downgraded_by_matching_fingerprint() {
        let store = Arc::new(MemoryStore::default());
        store.add_student(student("ash"));
        let orch = orchestrator(
            store,
            vec![
                FrameResult::MultipleFaces { count: 2 },
                matched("ash", 99.0),
                matched("ash", 99.0),
            ],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            fingerprint_token: Some("fp-ash".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);
        assert!(decision.notes.iter().any(|n| n.contains("downgraded")));
        assert_eq!(decision.method_string(), "Face+Fingerprint");
    }

    #[tokio::test]
    async fn identity_switch_is_proxy_even_when_confident() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![
                matched("ash", 95.0),
                matched("ash", 95.0),
                matched("kai", 96.0),
                matched("kai", 96.0),
            ],
        );
        let claim = AttendanceClaim {
            frames: frames(4),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(
            decision.outcome,
            Outcome::ProxySuspected {
                reason: ProxyReason::IdentitySwitch
            }
        );
    }

    #[tokio::test]
    async fn insufficient_frames_never_silently_accepts() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![
                matched("ash", 95.0),
                FrameResult::NoFace,
                matched("ash", 95.0),
                FrameResult::NoFace,
                FrameResult::NoFace,
            ],
        );
        let claim = AttendanceClaim {
            frames: frames(5),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::BiometricRequired);
        assert!(decision
            .notes
            .iter()
            .any(|n| n.contains("insufficient consistent frames")));
    }

    #[tokio::test]
    async fn no_face_with_fingerprint_verifies_by_fallback_alone() {
        let store = Arc::new(MemoryStore::default());
        store.add_student(student("ash"));
        let orch = orchestrator(
            store,
            vec![FrameResult::NoFace, FrameResult::NoFace, FrameResult::NoFace],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            fingerprint_token: Some("fp-ash".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);
        assert_eq!(decision.confidence, 100.0);
    }

    #[tokio::test]
    async fn unknown_fingerprint_rejects_with_specific_reason() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![FrameResult::NoFace, FrameResult::NoFace, FrameResult::NoFace],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            fingerprint_token: Some("fp-nobody".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(
            decision.outcome,
            Outcome::Rejected {
                reason: RejectReason::FingerprintNotFound
            }
        );
    }

    #[tokio::test]
    async fn claimed_identity_mismatch_is_proxy() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![matched("ash", 95.0), matched("ash", 95.0), matched("ash", 95.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            claimed_identity: Some("R-kai".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(
            decision.outcome,
            Outcome::ProxySuspected {
                reason: ProxyReason::IdMismatch
            }
        );
        // Identity and confidence kept for the audit trail
        assert_eq!(decision.identity.unwrap().student_id, "ash");
        assert_eq!(decision.confidence, 95.0);
    }

    #[tokio::test]
    async fn claimed_roll_number_match_passes() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![matched("ash", 95.0), matched("ash", 95.0), matched("ash", 95.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            claimed_identity: Some("r-ash".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);
    }

    #[tokio::test]
    async fn supplementary_id_card_alongside_face_is_cross_checked() {
        let store = Arc::new(MemoryStore::default());
        store.add_student(student("ash"));
        store.add_student(student("kai"));
        let orch = orchestrator(
            store,
            vec![matched("ash", 95.0), matched("ash", 95.0), matched("ash", 95.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            id_card_token: Some("card-kai".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(
            decision.outcome,
            Outcome::ProxySuspected {
                reason: ProxyReason::IdCardMismatch
            }
        );
        assert_eq!(decision.method_string(), "Face+IDCard");
    }

    #[tokio::test]
    async fn second_submission_in_session_returns_original_timestamp() {
        let store = Arc::new(MemoryStore::default());
        let marked_at = Utc::now() - Duration::minutes(10);
        store.add_accepted_log("ash", Some("sess-1"), marked_at);
        store.add_session(SessionContext {
            id: "sess-1".to_string(),
            name: "Morning".to_string(),
            status: SessionStatus::Active,
            require_liveness: false,
            min_confidence: 60.0,
            started_at: Some(marked_at),
            ended_at: None,
        });
        let orch = orchestrator(
            store,
            vec![matched("ash", 95.0), matched("ash", 95.0), matched("ash", 95.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            session_id: Some("sess-1".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::AlreadyMarked { marked_at });
    }

    #[tokio::test]
    async fn inactive_session_is_an_error_not_a_decision() {
        let store = Arc::new(MemoryStore::default());
        store.add_session(SessionContext {
            id: "sess-1".to_string(),
            name: "Morning".to_string(),
            status: SessionStatus::Ended,
            require_liveness: false,
            min_confidence: 60.0,
            started_at: None,
            ended_at: Some(Utc::now()),
        });
        let orch = orchestrator(store, vec![]);
        let claim = AttendanceClaim {
            frames: frames(3),
            session_id: Some("sess-1".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            orch.decide(&claim).await,
            Err(VerifyError::SessionNotActive { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let orch = orchestrator(Arc::new(MemoryStore::default()), vec![]);
        let claim = AttendanceClaim {
            frames: frames(3),
            session_id: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            orch.decide(&claim).await,
            Err(VerifyError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_claim_is_an_error() {
        let orch = orchestrator(Arc::new(MemoryStore::default()), vec![]);
        assert!(matches!(
            orch.decide(&AttendanceClaim::default()).await,
            Err(VerifyError::NoFrames)
        ));
    }

    #[tokio::test]
    async fn liveness_failure_downgrades_but_keeps_identity() {
        let store = Arc::new(MemoryStore::default());
        let orch = VerificationOrchestrator::new(
            Arc::new(ThresholdPolicy::default()),
            ScriptedMatcher::new(vec![
                matched("ash", 95.0),
                matched("ash", 95.0),
                matched("ash", 95.0),
            ]),
            FixedLiveness::new(false),
            store,
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            require_liveness: true,
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert!(matches!(
            decision.outcome,
            Outcome::Rejected {
                reason: RejectReason::LivenessFailed { .. }
            }
        ));
        assert_eq!(decision.identity.unwrap().student_id, "ash");
        assert_eq!(decision.confidence, 95.0);
        assert_eq!(decision.liveness_passed, Some(false));
    }

    #[tokio::test]
    async fn liveness_skipped_when_not_requested() {
        let store = Arc::new(MemoryStore::default());
        let liveness = FixedLiveness::new(false);
        let orch = VerificationOrchestrator::new(
            Arc::new(ThresholdPolicy::default()),
            ScriptedMatcher::new(vec![
                matched("ash", 95.0),
                matched("ash", 95.0),
                matched("ash", 95.0),
            ]),
            liveness.clone(),
            store,
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);
        assert_eq!(*liveness.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn liveness_not_run_for_proxy_outcomes() {
        let store = Arc::new(MemoryStore::default());
        let liveness = FixedLiveness::new(false);
        let orch = VerificationOrchestrator::new(
            Arc::new(ThresholdPolicy::default()),
            ScriptedMatcher::new(vec![
                FrameResult::MultipleFaces { count: 3 },
                matched("ash", 95.0),
                matched("ash", 95.0),
            ]),
            liveness.clone(),
            store,
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            require_liveness: true,
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert!(matches!(decision.outcome, Outcome::ProxySuspected { .. }));
        assert_eq!(*liveness.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn session_min_confidence_raises_accept_bar() {
        let store = Arc::new(MemoryStore::default());
        store.add_session(SessionContext {
            id: "strict".to_string(),
            name: "Exam".to_string(),
            status: SessionStatus::Active,
            require_liveness: false,
            min_confidence: 90.0,
            started_at: Some(Utc::now()),
            ended_at: None,
        });
        let orch = orchestrator(
            store,
            vec![matched("ash", 85.0), matched("ash", 85.0), matched("ash", 85.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            session_id: Some("strict".to_string()),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::BiometricRequired);
    }

    #[tokio::test]
    async fn anomaly_scoring_leaves_decision_untouched() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(
            store,
            vec![matched("ash", 95.0), matched("ash", 95.0), matched("ash", 95.0)],
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            // 50km north of campus: clearly off the geofence
            location: Some(crate::types::GeoPoint {
                lat: 12.9716 + 0.45,
                lon: 77.5946,
            }),
            ..Default::default()
        };
        let decision = orch.decide(&claim).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Verified);

        let anomaly = orch.score_anomaly(&decision, &claim).await;
        assert!(anomaly.is_anomaly);
        assert!(anomaly.risk_score > 0.0);
        // The decision itself is unchanged by scoring
        assert_eq!(decision.outcome, Outcome::Verified);
    }

    #[tokio::test]
    async fn matcher_timeout_is_an_error_not_a_decision() {
        let store = Arc::new(MemoryStore::default());
        let orch = VerificationOrchestrator::new(
            Arc::new(ThresholdPolicy::default()),
            Arc::new(MatcherHandle::new(Arc::new(TimedOutMatcher))),
            FixedLiveness::new(true),
            store,
        );
        let claim = AttendanceClaim {
            frames: frames(3),
            fingerprint_token: Some("fp-ash".to_string()),
            ..Default::default()
        };
        // A dead oracle must surface as a retryable error; even a supplied
        // fallback token must not rescue the claim into a decision.
        let err = orch.decide(&claim).await.unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Matcher(MatcherError::Timeout(10))
        ));
    }
}
