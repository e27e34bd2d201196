//! SQLite-backed attendance storage.
//!
//! A decision and its anomaly result land in one `attendance_logs` row via a
//! single INSERT. The partial unique index on accepted rows is what closes
//! the duplicate-submission race: the second writer gets a constraint error
//! and refetches the surviving row.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rollcall_core::{
    AttendanceStore, GeoPoint, LogRecord, NewLogEntry, SessionContext, SessionStatus, StoreError,
    Student,
};
use tokio_rusqlite::Connection;

const ACCEPTED_INDEX: &str = "idx_logs_one_accepted";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

/// Aggregate counters for one session, returned by `EndSession` and
/// `SessionSummary`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session: SessionContext,
    pub total_submissions: u64,
    pub verified: u64,
    pub proxy_suspected: u64,
    pub rejected: u64,
    pub anomalies: u64,
    /// Mean confidence over accepted rows, when any exist.
    pub avg_confidence: Option<f64>,
    pub duration_minutes: Option<i64>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await.map_err(map_err)?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS students (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     roll_number TEXT NOT NULL UNIQUE COLLATE NOCASE,
                     fingerprint_token TEXT UNIQUE,
                     id_card_token TEXT UNIQUE,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     status TEXT NOT NULL,
                     require_liveness INTEGER NOT NULL DEFAULT 0,
                     min_confidence REAL NOT NULL DEFAULT 60.0,
                     started_at TEXT,
                     ended_at TEXT,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance_logs (
                     id TEXT PRIMARY KEY,
                     student_id TEXT REFERENCES students(id),
                     session_id TEXT REFERENCES sessions(id),
                     timestamp TEXT NOT NULL,
                     status TEXT NOT NULL,
                     accepted INTEGER NOT NULL,
                     failed INTEGER NOT NULL,
                     confidence REAL NOT NULL,
                     confidence_label TEXT NOT NULL,
                     verification_method TEXT NOT NULL,
                     frames_matched INTEGER NOT NULL,
                     total_frames INTEGER NOT NULL,
                     liveness_passed INTEGER,
                     latitude REAL,
                     longitude REAL,
                     source_ip TEXT,
                     device_fingerprint TEXT,
                     is_anomaly INTEGER NOT NULL DEFAULT 0,
                     risk_score REAL NOT NULL DEFAULT 0.0,
                     risk_level TEXT NOT NULL DEFAULT 'LOW',
                     anomaly_reasons TEXT NOT NULL DEFAULT '[]',
                     recommendations TEXT NOT NULL DEFAULT '[]',
                     notes TEXT NOT NULL DEFAULT '[]'
                 );
                 CREATE INDEX IF NOT EXISTS idx_logs_student_time
                     ON attendance_logs(student_id, timestamp);
                 CREATE INDEX IF NOT EXISTS idx_logs_ip_time
                     ON attendance_logs(source_ip, timestamp);
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_logs_one_accepted
                     ON attendance_logs(student_id, session_id)
                     WHERE accepted = 1 AND session_id IS NOT NULL;",
            )?;
            Ok(())
        })
        .await
        .map_err(map_err)?;

        Ok(Self { conn })
    }

    /// Enroll a student. Roll numbers and tokens are unique; a collision is
    /// a constraint error.
    pub async fn register_student(
        &self,
        name: &str,
        roll_number: &str,
        fingerprint_token: Option<String>,
        id_card_token: Option<String>,
    ) -> Result<Student, StoreError> {
        let student = Student {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            roll_number: roll_number.to_string(),
            fingerprint_token,
            id_card_token,
        };
        let row = student.clone();
        let created_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, name, roll_number, fingerprint_token, id_card_token, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        row.id,
                        row.name,
                        row.roll_number,
                        row.fingerprint_token,
                        row.id_card_token,
                        created_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;

        Ok(student)
    }

    /// Create a new session and start it immediately.
    pub async fn start_session(
        &self,
        name: &str,
        require_liveness: bool,
        min_confidence: f64,
    ) -> Result<SessionContext, StoreError> {
        let session = SessionContext {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: SessionStatus::Active,
            require_liveness,
            min_confidence,
            started_at: Some(Utc::now()),
            ended_at: None,
        };
        let row = session.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, name, status, require_liveness, min_confidence, started_at, ended_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?6)",
                    rusqlite::params![
                        row.id,
                        row.name,
                        row.status.as_str(),
                        row.require_liveness,
                        row.min_confidence,
                        row.started_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;

        Ok(session)
    }

    /// Move an active session to ended. Returns the updated session, or
    /// `None` when the id is unknown.
    pub async fn end_session(&self, id: &str) -> Result<Option<SessionContext>, StoreError> {
        let session_id = id.to_string();
        let ended_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'ended', ended_at = ?2
                     WHERE id = ?1 AND status = 'active'",
                    rusqlite::params![session_id, ended_at],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;
        self.find_session(id).await
    }

    /// Counters and mean confidence for one session.
    pub async fn session_summary(&self, id: &str) -> Result<Option<SessionSummary>, StoreError> {
        let Some(session) = self.find_session(id).await? else {
            return Ok(None);
        };

        let session_id = id.to_string();
        let (total, verified, proxy, rejected, anomalies, avg_confidence) = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(status = 'Verified'), 0),
                            COALESCE(SUM(status LIKE 'Proxy Suspected%'), 0),
                            COALESCE(SUM(status LIKE 'Rejected%'), 0),
                            COALESCE(SUM(is_anomaly), 0),
                            AVG(CASE WHEN accepted = 1 THEN confidence END)
                     FROM attendance_logs WHERE session_id = ?1",
                    [&session_id],
                    |row| {
                        Ok((
                            row.get::<_, u64>(0)?,
                            row.get::<_, u64>(1)?,
                            row.get::<_, u64>(2)?,
                            row.get::<_, u64>(3)?,
                            row.get::<_, u64>(4)?,
                            row.get::<_, Option<f64>>(5)?,
                        ))
                    },
                )
                .map_err(Into::into)
            })
            .await
            .map_err(map_err)?;

        let duration_minutes = match (session.started_at, session.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_minutes()),
            (Some(start), None) => Some((Utc::now() - start).num_minutes()),
            _ => None,
        };

        Ok(Some(SessionSummary {
            session,
            total_submissions: total,
            verified,
            proxy_suspected: proxy,
            rejected,
            anomalies,
            avg_confidence,
            duration_minutes,
        }))
    }

    pub async fn count_students(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .map_err(map_err)
    }

    pub async fn active_sessions(&self) -> Result<Vec<SessionContext>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, require_liveness, min_confidence, started_at, ended_at
                     FROM sessions WHERE status = 'active' ORDER BY started_at",
                )?;
                let rows = stmt.query_map([], session_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(map_err)
    }

    async fn student_by(
        &self,
        sql: &'static str,
        param: &str,
    ) -> Result<Option<Student>, StoreError> {
        let param = param.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query_map([&param], student_from_row)?;
                rows.next().transpose().map_err(Into::into)
            })
            .await
            .map_err(map_err)
    }

    async fn log_by(
        &self,
        sql: &'static str,
        params: Vec<String>,
    ) -> Result<Option<LogRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let mut rows =
                    stmt.query_map(rusqlite::params_from_iter(params.iter()), log_from_row)?;
                rows.next().transpose().map_err(Into::into)
            })
            .await
            .map_err(map_err)?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn count_by(
        &self,
        sql: &'static str,
        params: Vec<String>,
    ) -> Result<u32, StoreError> {
        self.conn
            .call(move |conn| {
                conn.query_row(sql, rusqlite::params_from_iter(params.iter()), |row| {
                    row.get(0)
                })
                .map_err(Into::into)
            })
            .await
            .map_err(map_err)
    }
}

#[async_trait::async_trait]
impl AttendanceStore for SqliteStore {
    async fn find_session(&self, id: &str) -> Result<Option<SessionContext>, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, require_liveness, min_confidence, started_at, ended_at
                     FROM sessions WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map([&id], session_from_row)?;
                rows.next().transpose().map_err(Into::into)
            })
            .await
            .map_err(map_err)
    }

    async fn find_student_by_fingerprint(
        &self,
        token: &str,
    ) -> Result<Option<Student>, StoreError> {
        self.student_by(
            "SELECT id, name, roll_number, fingerprint_token, id_card_token
             FROM students WHERE fingerprint_token = ?1",
            token,
        )
        .await
    }

    async fn find_student_by_id_card(&self, token: &str) -> Result<Option<Student>, StoreError> {
        self.student_by(
            "SELECT id, name, roll_number, fingerprint_token, id_card_token
             FROM students WHERE id_card_token = ?1",
            token,
        )
        .await
    }

    async fn find_student(&self, id_or_roll: &str) -> Result<Option<Student>, StoreError> {
        self.student_by(
            "SELECT id, name, roll_number, fingerprint_token, id_card_token
             FROM students WHERE id = ?1 OR roll_number = ?1 COLLATE NOCASE",
            id_or_roll,
        )
        .await
    }

    async fn existing_accepted_log(
        &self,
        student_id: &str,
        session_id: &str,
    ) -> Result<Option<LogRecord>, StoreError> {
        self.log_by(
            "SELECT id, student_id, session_id, timestamp, status, accepted, failed,
                    confidence, latitude, longitude, source_ip
             FROM attendance_logs
             WHERE student_id = ?1 AND session_id = ?2 AND accepted = 1
             ORDER BY timestamp LIMIT 1",
            vec![student_id.to_string(), session_id.to_string()],
        )
        .await
    }

    async fn last_accepted_log_within(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<Option<LogRecord>, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(window_seconds)).to_rfc3339();
        self.log_by(
            "SELECT id, student_id, session_id, timestamp, status, accepted, failed,
                    confidence, latitude, longitude, source_ip
             FROM attendance_logs
             WHERE student_id = ?1 AND accepted = 1 AND timestamp >= ?2
             ORDER BY timestamp DESC LIMIT 1",
            vec![student_id.to_string(), cutoff],
        )
        .await
    }

    async fn last_located_log(&self, student_id: &str) -> Result<Option<LogRecord>, StoreError> {
        self.log_by(
            "SELECT id, student_id, session_id, timestamp, status, accepted, failed,
                    confidence, latitude, longitude, source_ip
             FROM attendance_logs
             WHERE student_id = ?1 AND latitude IS NOT NULL
             ORDER BY timestamp DESC LIMIT 1",
            vec![student_id.to_string()],
        )
        .await
    }

    async fn failed_count_for_student(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(window_seconds)).to_rfc3339();
        self.count_by(
            "SELECT COUNT(*) FROM attendance_logs
             WHERE student_id = ?1 AND failed = 1 AND timestamp >= ?2",
            vec![student_id.to_string(), cutoff],
        )
        .await
    }

    async fn failed_count_for_ip(
        &self,
        ip: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(window_seconds)).to_rfc3339();
        self.count_by(
            "SELECT COUNT(*) FROM attendance_logs
             WHERE source_ip = ?1 AND failed = 1 AND timestamp >= ?2",
            vec![ip.to_string(), cutoff],
        )
        .await
    }

    async fn distinct_ips_for_student(
        &self,
        student_id: &str,
        window_seconds: i64,
    ) -> Result<u32, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(window_seconds)).to_rfc3339();
        self.count_by(
            "SELECT COUNT(DISTINCT source_ip) FROM attendance_logs
             WHERE student_id = ?1 AND source_ip IS NOT NULL AND timestamp >= ?2",
            vec![student_id.to_string(), cutoff],
        )
        .await
    }

    async fn append(&self, entry: &NewLogEntry) -> Result<LogRecord, StoreError> {
        let record = LogRecord {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: entry
                .decision
                .identity
                .as_ref()
                .map(|i| i.student_id.clone()),
            session_id: entry.decision.session_id.clone(),
            timestamp: entry.timestamp,
            status: entry.decision.outcome.status(),
            accepted: entry.decision.outcome.is_accepted(),
            failed: entry.decision.outcome.is_failure(),
            confidence: entry.decision.confidence,
            location: entry.location,
            source_ip: entry.source_ip.clone(),
        };

        let row = record.clone();
        let label = entry.decision.confidence_label.to_string();
        let method = entry.decision.method_string();
        let frames_matched = entry.decision.frames_matched as i64;
        let total_frames = entry.decision.total_frames as i64;
        let liveness_passed = entry.decision.liveness_passed;
        let device = entry.device_fingerprint.clone();
        let notes = serde_json::to_string(&entry.decision.notes)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let (is_anomaly, risk_score, risk_level, reasons, recommendations) = match &entry.anomaly {
            Some(a) => (
                a.is_anomaly,
                a.risk_score,
                a.risk_level.to_string(),
                serde_json::to_string(&a.reasons).map_err(|e| StoreError::Backend(e.to_string()))?,
                serde_json::to_string(&a.recommendations)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
            ),
            None => (false, 0.0, "LOW".to_string(), "[]".to_string(), "[]".to_string()),
        };

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_logs (
                         id, student_id, session_id, timestamp, status, accepted, failed,
                         confidence, confidence_label, verification_method, frames_matched,
                         total_frames, liveness_passed, latitude, longitude, source_ip,
                         device_fingerprint, is_anomaly, risk_score, risk_level,
                         anomaly_reasons, recommendations, notes
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                               ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                    rusqlite::params![
                        row.id,
                        row.student_id,
                        row.session_id,
                        row.timestamp.to_rfc3339(),
                        row.status,
                        row.accepted,
                        row.failed,
                        row.confidence,
                        label,
                        method,
                        frames_matched,
                        total_frames,
                        liveness_passed,
                        row.location.map(|l| l.lat),
                        row.location.map(|l| l.lon),
                        row.source_ip,
                        device,
                        is_anomaly,
                        risk_score,
                        risk_level,
                        reasons,
                        recommendations,
                        notes,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;

        Ok(record)
    }
}

/// Raw log columns before the timestamp is parsed (rusqlite row mappers
/// cannot return chrono parse errors).
struct RawLog {
    id: String,
    student_id: Option<String>,
    session_id: Option<String>,
    timestamp: String,
    status: String,
    accepted: bool,
    failed: bool,
    confidence: f64,
    latitude: Option<f64>,
    longitude: Option<f64>,
    source_ip: Option<String>,
}

impl TryFrom<RawLog> for LogRecord {
    type Error = StoreError;

    fn try_from(raw: RawLog) -> Result<Self, StoreError> {
        let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
            .map_err(|e| StoreError::Backend(format!("bad timestamp in log row: {e}")))?
            .with_timezone(&Utc);
        let location = match (raw.latitude, raw.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        };
        Ok(LogRecord {
            id: raw.id,
            student_id: raw.student_id,
            session_id: raw.session_id,
            timestamp,
            status: raw.status,
            accepted: raw.accepted,
            failed: raw.failed,
            confidence: raw.confidence,
            location,
            source_ip: raw.source_ip,
        })
    }
}

fn log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLog> {
    Ok(RawLog {
        id: row.get(0)?,
        student_id: row.get(1)?,
        session_id: row.get(2)?,
        timestamp: row.get(3)?,
        status: row.get(4)?,
        accepted: row.get(5)?,
        failed: row.get(6)?,
        confidence: row.get(7)?,
        latitude: row.get(8)?,
        longitude: row.get(9)?,
        source_ip: row.get(10)?,
    })
}

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        roll_number: row.get(2)?,
        fingerprint_token: row.get(3)?,
        id_card_token: row.get(4)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionContext> {
    let status: String = row.get(2)?;
    let started_at: Option<String> = row.get(5)?;
    let ended_at: Option<String> = row.get(6)?;
    Ok(SessionContext {
        id: row.get(0)?,
        name: row.get(1)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Ended),
        require_liveness: row.get(3)?,
        min_confidence: row.get(4)?,
        started_at: started_at.and_then(|t| parse_utc(&t)),
        ended_at: ended_at.and_then(|t| parse_utc(&t)),
    })
}

fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn map_err(e: tokio_rusqlite::Error) -> StoreError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(f, ref msg)) = e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            let text = msg.clone().unwrap_or_default();
            if text.contains(ACCEPTED_INDEX) {
                return StoreError::DuplicateAccepted;
            }
            return StoreError::Constraint(text);
        }
    }
    StoreError::Backend(e.to_string())
}
