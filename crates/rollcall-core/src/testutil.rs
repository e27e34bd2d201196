//! In-memory store used by the unit tests across modules.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::store::{AttendanceStore, NewLogEntry, StoreError};
use crate::types::{GeoPoint, LogRecord, SessionContext, Student};

#[derive(Default)]
pub struct MemoryStore {
    students: Mutex<Vec<Student>>,
    sessions: Mutex<Vec<SessionContext>>,
    logs: Mutex<Vec<LogRecord>>,
}

impl MemoryStore {
    pub fn add_student(&self, student: Student) {
        self.students.lock().unwrap().push(student);
    }

    pub fn add_session(&self, session: SessionContext) {
        self.sessions.lock().unwrap().push(session);
    }

    pub fn add_log(&self, log: LogRecord) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn add_accepted_log(
        &self,
        student_id: &str,
        session_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) {
        self.add_log(LogRecord {
            id: format!("log-{}", self.logs.lock().unwrap().len()),
            student_id: Some(student_id.to_string()),
            session_id: session_id.map(str::to_string),
            timestamp,
            status: "Verified".to_string(),
            accepted: true,
            failed: false,
            confidence: 90.0,
            location: None,
            source_ip: None,
        });
    }

    pub fn add_failed_log(
        &self,
        student_id: &str,
        session_id: Option<&str>,
        timestamp: DateTime<Utc>,
        source_ip: Option<&str>,
    ) {
        self.add_log(LogRecord {
            id: format!("log-{}", self.logs.lock().unwrap().len()),
            student_id: Some(student_id.to_string()),
            session_id: session_id.map(str::to_string),
            timestamp,
            status: "Rejected: Low Confidence".to_string(),
            accepted: false,
            failed: true,
            confidence: 20.0,
            location: None,
            source_ip: source_ip.map(str::to_string),
        });
    }

    pub fn add_located_log(
        &self,
        student_id: &str,
        timestamp: DateTime<Utc>,
        location: GeoPoint,
    ) {
        self.add_log(LogRecord {
            id: format!("log-{}", self.logs.lock().unwrap().len()),
            student_id: Some(student_id.to_string()),
            session_id: None,
            timestamp,
            status: "Verified".to_string(),
            accepted: true,
            failed: false,
            confidence: 90.0,
            location: Some(location),
            source_ip: None,
        });
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn find_session(&self, id: &str) -> Result<Option<SessionContext>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn find_student_by_fingerprint(
        &self,
        token: &str,
    ) -> Result<Option<Student>, StoreError> {
        Ok(self
            .students
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.fingerprint_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_student_by_id_card(&self, token: &str) -> Result<Option<Student>, StoreError> {
        Ok(self
            .students
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id_card_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_student(&self, id_or_roll: &str) -> Result<Option<Student>, StoreError> {
        Ok(self
            .students
            .lock()
            .unwrap()
            .iter()
            .find(|s| {
                s.id.eq_ignore_ascii_case(id_or_roll)
                    || s.roll_number.eq_ignore_ascii_case(id_or_roll)
            })
            .cloned())
    }

    async fn existing_accepted_log(
        &self,
        student_id: &str,
        session_id: &str,
    ) -> Result<Option<LogRecord>, StoreError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| {
                l.accepted
                    && l.student_id.as_deref() == Some(student_id)
                    && l.session_id.as_deref() == Some(session_id)
            })
            .min_by_key(|l| l.timestamp)
            .cloned())
    }

    async fn last_accepted_log_within(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<Option<LogRecord>, StoreError> {
        let cutoff = Utc::now() - Duration::seconds(window_seconds);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| {
                l.accepted
                    && l.student_id.as_deref() == Some(student_id)
                    && l.timestamp >= cutoff
            })
            .max_by_key(|l| l.timestamp)
            .cloned())
    }

    async fn last_located_log(&self, student_id: &str) -> Result<Option<LogRecord>, StoreError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.student_id.as_deref() == Some(student_id) && l.location.is_some())
            .max_by_key(|l| l.timestamp)
            .cloned())
    }

    async fn failed_count_for_student(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError> {
        let cutoff = Utc::now() - Duration::seconds(window_seconds);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| {
                l.failed && l.student_id.as_deref() == Some(student_id) && l.timestamp >= cutoff
            })
            .count() as u32)
    }

    async fn failed_count_for_ip(
        &self,
        ip: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError> {
        let cutoff = Utc::now() - Duration::seconds(window_seconds);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.failed && l.source_ip.as_deref() == Some(ip) && l.timestamp >= cutoff)
            .count() as u32)
    }

    async fn distinct_ips_for_student(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError> {
        let cutoff = Utc::now() - Duration::seconds(window_seconds);
        let logs = self.logs.lock().unwrap();
        let ips: std::collections::BTreeSet<&str> = logs
            .iter()
            .filter(|l| l.student_id.as_deref() == Some(student_id) && l.timestamp >= cutoff)
            .filter_map(|l| l.source_ip.as_deref())
            .collect();
        Ok(ips.len() as u32)
    }

    async fn append(&self, entry: &NewLogEntry) -> Result<LogRecord, StoreError> {
        let mut logs = self.logs.lock().unwrap();
        let accepted = entry.decision.outcome.is_accepted();
        let student_id = entry.decision.identity.as_ref().map(|i| i.student_id.clone());
        if accepted {
            if let (Some(sid), Some(sess)) = (&student_id, &entry.decision.session_id) {
                let exists = logs.iter().any(|l| {
                    l.accepted
                        && l.student_id.as_deref() == Some(sid.as_str())
                        && l.session_id.as_deref() == Some(sess.as_str())
                });
                if exists {
                    return Err(StoreError::DuplicateAccepted);
                }
            }
        }
        let record = LogRecord {
            id: format!("log-{}", logs.len()),
            student_id,
            session_id: entry.decision.session_id.clone(),
            timestamp: entry.timestamp,
            status: entry.decision.outcome.status(),
            accepted,
            failed: entry.decision.outcome.is_failure(),
            confidence: entry.decision.confidence,
            location: entry.location,
            source_ip: entry.source_ip.clone(),
        };
        logs.push(record.clone());
        Ok(record)
    }
}
