//! Persistence contract consumed by the pipeline.
//!
//! The core never opens a database; the daemon supplies an implementation.
//! `append` must be a single atomic write of the decision and its anomaly
//! result, and the backend must enforce at-most-one accepted row per
//! `(student, session)` pair so two concurrent submissions cannot both pass
//! the duplicate check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anomaly::AnomalyResult;
use crate::types::{AttendanceDecision, GeoPoint, LogRecord, SessionContext, Student};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store timed out after {0}s")]
    Timeout(u64),
    /// The accepted-row uniqueness constraint fired: another submission won
    /// the duplicate race. The caller refetches the surviving row.
    #[error("accepted attendance already exists for this student and session")]
    DuplicateAccepted,
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Everything needed to persist one decision as an audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub decision: AttendanceDecision,
    pub anomaly: Option<AnomalyResult>,
    pub timestamp: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub source_ip: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// Async store operations consumed by the pipeline.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn find_session(&self, id: &str) -> Result<Option<SessionContext>, StoreError>;

    async fn find_student_by_fingerprint(
        &self,
        token: &str,
    ) -> Result<Option<Student>, StoreError>;

    async fn find_student_by_id_card(&self, token: &str) -> Result<Option<Student>, StoreError>;

    /// Look up a student by internal id or roll number.
    async fn find_student(&self, id_or_roll: &str) -> Result<Option<Student>, StoreError>;

    /// Earliest accepted log for the pair, if any.
    async fn existing_accepted_log(
        &self,
        student_id: &str,
        session_id: &str,
    ) -> Result<Option<LogRecord>, StoreError>;

    /// Most recent accepted log for the student within the window
    /// (sessionless deduplication).
    async fn last_accepted_log_within(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<Option<LogRecord>, StoreError>;

    /// Most recent log carrying a location for the student (impossible
    /// travel baseline).
    async fn last_located_log(&self, student_id: &str) -> Result<Option<LogRecord>, StoreError>;

    async fn failed_count_for_student(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError>;

    async fn failed_count_for_ip(
        &self,
        ip: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError>;

    /// Distinct source IPs seen for the student within the window.
    async fn distinct_ips_for_student(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError>;

    /// Persist one decision (and its anomaly result) atomically.
    async fn append(&self, entry: &NewLogEntry) -> Result<LogRecord, StoreError>;
}
