//! The liveness detector oracle contract.
//!
//! Liveness runs only after a would-be-verified outcome, and only when the
//! session or the caller requested it. A failed check downgrades the
//! outcome without discarding the already-computed identity and confidence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("liveness detector timed out after {0}s")]
    Timeout(u64),
    #[error("liveness detector unavailable: {0}")]
    Unavailable(String),
}

/// Blink-detection tuning forwarded to the oracle with each check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LivenessParams {
    /// Eye aspect ratio below which the eye counts as closed.
    pub ear_blink_threshold: f64,
    /// Consecutive closed-eye frames required to count a blink.
    pub min_blink_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub passed: bool,
    pub message: String,
}

/// Per-frame-set liveness oracle.
#[async_trait]
pub trait LivenessDetector: Send + Sync {
    async fn check(
        &self,
        frames: &[Vec<u8>],
        params: LivenessParams,
    ) -> Result<LivenessVerdict, LivenessError>;
}
