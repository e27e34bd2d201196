//! Shared value types flowing through the verification pipeline.
//!
//! Decisions are immutable values assembled by pure stages; nothing in here
//! is a shared mutable bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::ConfidenceLabel;

/// WGS-84 coordinate supplied with a claim or recorded on a log row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// An authentication factor checked during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Factor {
    Face,
    Fingerprint,
    IdCard,
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Factor::Face => "Face",
            Factor::Fingerprint => "Fingerprint",
            Factor::IdCard => "IDCard",
        };
        f.write_str(s)
    }
}

/// Join checked factors into the audit method string, e.g.
/// `"Face+Fingerprint"`.
pub fn method_string(factors: &[Factor]) -> String {
    factors
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("+")
}

/// An enrolled student record, including fallback tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub roll_number: String,
    pub fingerprint_token: Option<String>,
    pub id_card_token: Option<String>,
}

/// A resolved identity produced by the matcher oracle or a fallback lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub student_id: String,
    pub name: String,
    pub roll_number: String,
}

impl Identity {
    /// Whether a caller-supplied claim token refers to this identity
    /// (internal id or roll number, case-insensitive).
    pub fn matches_claim(&self, claimed: &str) -> bool {
        self.student_id.eq_ignore_ascii_case(claimed)
            || self.roll_number.eq_ignore_ascii_case(claimed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

/// Session context read (never written) by the pipeline. Claims against a
/// non-active session are rejected before any frame is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub require_liveness: bool,
    /// Session-specific accept bar; raises the policy's fallback tier when
    /// higher.
    pub min_confidence: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Caller input for one verification decision. Immutable for the duration
/// of the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttendanceClaim {
    /// Encoded camera frames, in capture order. Opaque to this crate; only
    /// the matcher oracle interprets them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<Vec<u8>>,
    /// Asserted identity (roll number or internal id), if the kiosk knows
    /// who claims to be present.
    pub claimed_identity: Option<String>,
    pub fingerprint_token: Option<String>,
    pub id_card_token: Option<String>,
    pub location: Option<GeoPoint>,
    pub session_id: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Caller-requested liveness check (sessions can also require it).
    #[serde(default)]
    pub require_liveness: bool,
}

impl AttendanceClaim {
    pub fn has_fallback_token(&self) -> bool {
        self.fingerprint_token.is_some() || self.id_card_token.is_some()
    }
}

/// Why a claim was flagged as a probable proxy attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyReason {
    /// More than one face in at least one frame.
    MultipleFaces { frames: usize, total: usize },
    /// Distinct identities among the matched frames.
    IdentitySwitch,
    /// Claimed identity does not match the recognized one.
    IdMismatch,
    /// Supplied fingerprint token belongs to a different student than the
    /// recognized face.
    FingerprintMismatch,
    /// Supplied ID-card token belongs to a different student.
    IdCardMismatch,
}

impl std::fmt::Display for ProxyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyReason::MultipleFaces { frames, total } => {
                write!(f, "multiple faces detected in {frames}/{total} frames")
            }
            ProxyReason::IdentitySwitch => f.write_str("identity switch during capture"),
            ProxyReason::IdMismatch => f.write_str("claimed identity mismatch"),
            ProxyReason::FingerprintMismatch => f.write_str("fingerprint mismatch"),
            ProxyReason::IdCardMismatch => f.write_str("ID card mismatch"),
        }
    }
}

impl ProxyReason {
    /// Short tag used in the persisted status string, e.g.
    /// `"Proxy Suspected: Identity Switch"`.
    pub fn tag(&self) -> &'static str {
        match self {
            ProxyReason::MultipleFaces { .. } => "Multiple Faces",
            ProxyReason::IdentitySwitch => "Identity Switch",
            ProxyReason::IdMismatch => "ID Mismatch",
            ProxyReason::FingerprintMismatch => "Fingerprint Mismatch",
            ProxyReason::IdCardMismatch => "ID Card Mismatch",
        }
    }
}

/// Why a claim was terminally rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Average confidence fell below the auto-reject cutoff.
    LowConfidence { confidence: f64, cutoff: f64 },
    /// A fingerprint token was supplied but matches no enrolled student.
    FingerprintNotFound,
    /// An ID-card token was supplied but matches no enrolled student.
    IdCardNotFound,
    /// The liveness detector failed the frames.
    LivenessFailed { message: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::LowConfidence { confidence, cutoff } => {
                write!(f, "confidence {confidence:.1}% below threshold {cutoff:.1}%")
            }
            RejectReason::FingerprintNotFound => f.write_str("fingerprint not found"),
            RejectReason::IdCardNotFound => f.write_str("id card not found"),
            RejectReason::LivenessFailed { message } => {
                write!(f, "liveness failed: {message}")
            }
        }
    }
}

impl RejectReason {
    pub fn tag(&self) -> &'static str {
        match self {
            RejectReason::LowConfidence { .. } => "Low Confidence",
            RejectReason::FingerprintNotFound => "Fingerprint Not Found",
            RejectReason::IdCardNotFound => "ID Card Not Found",
            RejectReason::LivenessFailed { .. } => "Liveness Failed",
        }
    }
}

/// Terminal outcome of one verification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Outcome {
    Verified,
    ProxySuspected { reason: ProxyReason },
    /// The primary factor was inconclusive and no fallback token was
    /// supplied. Terminal for this request; the caller resubmits with a
    /// secondary factor. No record is written.
    BiometricRequired,
    Rejected { reason: RejectReason },
    /// An accepted mark already exists for this identity in this session
    /// window. The original timestamp is returned unchanged.
    AlreadyMarked { marked_at: DateTime<Utc> },
}

impl Outcome {
    /// A `Verified`-class outcome that counts toward duplicate prevention.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Verified)
    }

    /// Rejected or proxy-flagged outcomes counted by brute-force detection.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Rejected { .. } | Outcome::ProxySuspected { .. })
    }

    /// Human-readable status string persisted on the audit row.
    pub fn status(&self) -> String {
        match self {
            Outcome::Verified => "Verified".to_string(),
            Outcome::ProxySuspected { reason } => {
                format!("Proxy Suspected: {}", reason.tag())
            }
            Outcome::BiometricRequired => "Biometric Required".to_string(),
            Outcome::Rejected { reason } => format!("Rejected: {}", reason.tag()),
            Outcome::AlreadyMarked { .. } => "Already Marked".to_string(),
        }
    }
}

/// The pipeline's output: one immutable, explainable decision. The
/// persistence layer turns this into an audit log row; it is never mutated
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceDecision {
    pub outcome: Outcome,
    pub identity: Option<Identity>,
    pub confidence: f64,
    pub confidence_label: ConfidenceLabel,
    /// Every factor checked during the decision, in order, regardless of
    /// outcome.
    pub verification_method: Vec<Factor>,
    pub frames_matched: usize,
    pub total_frames: usize,
    pub liveness_passed: Option<bool>,
    pub session_id: Option<String>,
    pub notes: Vec<String>,
}

impl AttendanceDecision {
    pub fn method_string(&self) -> String {
        method_string(&self.verification_method)
    }
}

/// A persisted attendance log row, as read back for duplicate and anomaly
/// queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub student_id: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub accepted: bool,
    pub failed: bool,
    pub confidence: f64,
    pub location: Option<GeoPoint>,
    pub source_ip: Option<String>,
}
