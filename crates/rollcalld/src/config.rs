use std::path::PathBuf;

use rollcall_core::{PolicyError, ThresholdPolicy};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Bus name of the face identification oracle.
    pub matcher_service: String,
    /// Object path of the face identification oracle.
    pub matcher_path: String,
    /// Bus name of the liveness detector oracle.
    pub liveness_service: String,
    /// Object path of the liveness detector oracle.
    pub liveness_path: String,
    /// Timeout in seconds for a single oracle call.
    pub oracle_timeout_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            db_path,
            matcher_service: std::env::var("ROLLCALL_MATCHER_SERVICE")
                .unwrap_or_else(|_| "org.rollcall.Matcher1".to_string()),
            matcher_path: std::env::var("ROLLCALL_MATCHER_PATH")
                .unwrap_or_else(|_| "/org/rollcall/Matcher1".to_string()),
            liveness_service: std::env::var("ROLLCALL_LIVENESS_SERVICE")
                .unwrap_or_else(|_| "org.rollcall.Liveness1".to_string()),
            liveness_path: std::env::var("ROLLCALL_LIVENESS_PATH")
                .unwrap_or_else(|_| "/org/rollcall/Liveness1".to_string()),
            oracle_timeout_secs: env_u64("ROLLCALL_ORACLE_TIMEOUT_SECS", 10),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS").is_ok(),
        }
    }
}

/// Build the threshold policy from defaults plus `ROLLCALL_*` overrides,
/// failing fast on a misconfiguration.
pub fn policy_from_env() -> Result<ThresholdPolicy, PolicyError> {
    let defaults = ThresholdPolicy::default();
    let policy = ThresholdPolicy {
        confidence_high: env_f64("ROLLCALL_CONFIDENCE_HIGH", defaults.confidence_high),
        confidence_medium: env_f64("ROLLCALL_CONFIDENCE_MEDIUM", defaults.confidence_medium),
        confidence_low: env_f64("ROLLCALL_CONFIDENCE_LOW", defaults.confidence_low),
        confidence_reject: env_f64("ROLLCALL_CONFIDENCE_REJECT", defaults.confidence_reject),
        require_fallback_tier: env_f64(
            "ROLLCALL_FALLBACK_TIER",
            defaults.require_fallback_tier,
        ),
        required_consistent_frames: env_usize(
            "ROLLCALL_REQUIRED_FRAMES",
            defaults.required_consistent_frames,
        ),
        duplicate_window_seconds: env_i64(
            "ROLLCALL_DUPLICATE_WINDOW_SECS",
            defaults.duplicate_window_seconds,
        ),
        campus_lat: env_f64("ROLLCALL_CAMPUS_LAT", defaults.campus_lat),
        campus_lon: env_f64("ROLLCALL_CAMPUS_LON", defaults.campus_lon),
        geofence_radius_meters: env_f64(
            "ROLLCALL_GEOFENCE_RADIUS_M",
            defaults.geofence_radius_meters,
        ),
        impossible_speed_mps: env_f64(
            "ROLLCALL_IMPOSSIBLE_SPEED_MPS",
            defaults.impossible_speed_mps,
        ),
        late_grace_seconds: env_i64("ROLLCALL_LATE_GRACE_SECS", defaults.late_grace_seconds),
        early_grace_seconds: env_i64("ROLLCALL_EARLY_GRACE_SECS", defaults.early_grace_seconds),
        max_failed_attempts: env_u32(
            "ROLLCALL_MAX_FAILED_ATTEMPTS",
            defaults.max_failed_attempts,
        ),
        ..defaults
    };
    policy.validate()?;
    Ok(policy)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
