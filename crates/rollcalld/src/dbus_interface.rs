use std::sync::Arc;

use rollcall_core::{
    device_fingerprint, AttendanceClaim, AttendanceStore, MatcherHandle, Outcome, StoreError,
    ThresholdPolicy, VerificationOrchestrator, VerifyError,
};
use zbus::interface;

use crate::config::Config;
use crate::oracle::DbusMatcher;
use crate::store::SqliteStore;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub config: Config,
    pub policy: Arc<ThresholdPolicy>,
    pub store: SqliteStore,
    pub matcher: Arc<MatcherHandle>,
    pub orchestrator: Arc<VerificationOrchestrator>,
    /// Used by `ReloadMatcher` to build a fresh oracle proxy.
    pub bus: zbus::Connection,
}

fn verify_err(e: VerifyError) -> zbus::fdo::Error {
    match e {
        VerifyError::NoFrames
        | VerifyError::SessionNotFound(_)
        | VerifyError::SessionNotActive { .. } => zbus::fdo::Error::InvalidArgs(e.to_string()),
        // Oracle and store failures are retryable
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn store_err(e: StoreError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn none_if_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Run one attendance claim through the full verification pipeline.
    ///
    /// `claim_json` carries everything except the frames (claimed identity,
    /// fallback tokens, location, session, source). Returns the decision
    /// and its anomaly result as JSON. Every outcome except
    /// `BiometricRequired` and `AlreadyMarked` is persisted.
    async fn decide(
        &self,
        frames: Vec<Vec<u8>>,
        claim_json: &str,
    ) -> zbus::fdo::Result<String> {
        let mut claim: AttendanceClaim = serde_json::from_str(claim_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad claim: {e}")))?;
        claim.frames = frames;
        tracing::info!(
            frames = claim.frames.len(),
            session = claim.session_id.as_deref().unwrap_or("-"),
            claimed = claim.claimed_identity.as_deref().unwrap_or("-"),
            "decide requested"
        );

        let mut decision = self
            .orchestrator
            .decide(&claim)
            .await
            .map_err(verify_err)?;

        // Anomaly scoring runs for non-rejecting outcomes only and never
        // changes the identity decision.
        let anomaly = match decision.outcome {
            Outcome::Verified | Outcome::ProxySuspected { .. } => {
                Some(self.orchestrator.score_anomaly(&decision, &claim).await)
            }
            _ => None,
        };

        let persist = !matches!(
            decision.outcome,
            Outcome::BiometricRequired | Outcome::AlreadyMarked { .. }
        );
        if persist {
            let device = match (&claim.source_ip, &claim.user_agent) {
                (Some(ip), Some(ua)) => Some(device_fingerprint(ip, ua)),
                _ => None,
            };
            let entry = rollcall_core::NewLogEntry {
                decision: decision.clone(),
                anomaly: anomaly.clone(),
                timestamp: chrono::Utc::now(),
                location: claim.location,
                source_ip: claim.source_ip.clone(),
                device_fingerprint: device,
            };
            match self.store.append(&entry).await {
                Ok(record) => {
                    tracing::info!(log_id = %record.id, status = %record.status, "decision persisted");
                }
                Err(StoreError::DuplicateAccepted) => {
                    // Lost the duplicate race: another submission was
                    // accepted between our check and this insert. Rewrite
                    // from the surviving row.
                    let student_id = decision
                        .identity
                        .as_ref()
                        .map(|i| i.student_id.clone())
                        .unwrap_or_default();
                    let surviving = match &claim.session_id {
                        Some(session_id) => self
                            .store
                            .existing_accepted_log(&student_id, session_id)
                            .await
                            .map_err(store_err)?,
                        None => self
                            .store
                            .last_accepted_log_within(
                                &student_id,
                                self.policy.duplicate_window_seconds,
                            )
                            .await
                            .map_err(store_err)?,
                    };
                    let marked_at = surviving
                        .map(|log| log.timestamp)
                        .unwrap_or_else(chrono::Utc::now);
                    tracing::info!(
                        student = %student_id,
                        %marked_at,
                        "duplicate race lost; rewriting to already-marked"
                    );
                    decision.outcome = Outcome::AlreadyMarked { marked_at };
                    decision
                        .notes
                        .push(format!("attendance already marked at {marked_at}"));
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        Ok(serde_json::json!({
            "status": decision.outcome.status(),
            "decision": decision,
            "anomaly": anomaly,
        })
        .to_string())
    }

    /// Enroll a student. `fingerprint` and `id_card` may be empty strings.
    ///
    /// Returns the created student record as JSON.
    async fn register_student(
        &self,
        name: &str,
        roll_number: &str,
        fingerprint: &str,
        id_card: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(roll_number, "register_student requested");
        let student = self
            .store
            .register_student(
                name,
                roll_number,
                none_if_empty(fingerprint),
                none_if_empty(id_card),
            )
            .await
            .map_err(store_err)?;
        tracing::info!(student_id = %student.id, roll_number, "student registered");
        serde_json::to_string(&student).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Create and start an attendance session.
    async fn start_session(
        &self,
        name: &str,
        require_liveness: bool,
        min_confidence: f64,
    ) -> zbus::fdo::Result<String> {
        let session = self
            .store
            .start_session(name, require_liveness, min_confidence)
            .await
            .map_err(store_err)?;
        tracing::info!(session_id = %session.id, name, "session started");
        serde_json::to_string(&session).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// End an active session. Returns the closing summary as JSON.
    async fn end_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        self.store
            .end_session(session_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| {
                zbus::fdo::Error::InvalidArgs(format!("unknown session '{session_id}'"))
            })?;
        tracing::info!(session_id, "session ended");
        self.session_summary(session_id).await
    }

    /// Counters and mean confidence for one session, as JSON.
    async fn session_summary(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let summary = self
            .store
            .session_summary(session_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| {
                zbus::fdo::Error::InvalidArgs(format!("unknown session '{session_id}'"))
            })?;
        serde_json::to_string(&summary).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let students = self.store.count_students().await.unwrap_or(0);
        let active = self
            .store
            .active_sessions()
            .await
            .map(|s| s.len())
            .unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "students_enrolled": students,
            "active_sessions": active,
            "matcher_generation": self.matcher.generation(),
            "db_path": self.config.db_path,
        })
        .to_string())
    }

    /// Return the active threshold policy as JSON (read-only).
    async fn thresholds(&self) -> zbus::fdo::Result<String> {
        Ok(self.policy.as_map().to_string())
    }

    /// Swap in a fresh matcher oracle proxy (after model re-enrollment on
    /// the oracle side). In-flight decisions keep the snapshot they loaded;
    /// returns the new generation counter.
    async fn reload_matcher(&self) -> zbus::fdo::Result<u64> {
        let fresh = DbusMatcher::connect(
            &self.bus,
            &self.config.matcher_service,
            &self.config.matcher_path,
            self.config.oracle_timeout_secs,
        )
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let generation = self.matcher.swap(Arc::new(fresh));
        tracing::info!(generation, "matcher reloaded");
        Ok(generation)
    }
}
