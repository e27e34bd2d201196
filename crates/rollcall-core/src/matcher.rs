//! The biometric matcher oracle contract.
//!
//! The underlying face-identification model is external; the pipeline only
//! sees its per-frame verdicts. A timeout from the oracle is a true error
//! (retryable by the caller), never coerced into a decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::types::Identity;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("matcher timed out after {0}s")]
    Timeout(u64),
    #[error("matcher unavailable: {0}")]
    Unavailable(String),
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Per-frame verdict from the matcher oracle. Consumed once by the
/// aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameResult {
    /// No candidate face in the frame (includes an unenrolled face).
    NoFace,
    /// More than one face in the frame.
    MultipleFaces { count: usize },
    Matched {
        identity: Identity,
        /// Match confidence in percent, [0, 100].
        confidence: f64,
        bbox: Option<BoundingBox>,
    },
    /// The oracle could not process this frame (bad encoding etc.). The
    /// frame is skipped; it neither matches nor counts as no-face.
    Error { message: String },
}

/// Per-frame face identification oracle.
#[async_trait]
pub trait BiometricMatcher: Send + Sync {
    async fn identify(&self, frame: &[u8]) -> Result<FrameResult, MatcherError>;
}

/// Swappable handle to the current matcher.
///
/// Re-enrollment retrains the external model; the daemon then swaps in a
/// fresh oracle client here. Recognition calls load an immutable `Arc`
/// snapshot, so an in-flight decision never observes a half-updated model.
pub struct MatcherHandle {
    inner: RwLock<Arc<dyn BiometricMatcher>>,
    generation: AtomicU64,
}

impl MatcherHandle {
    pub fn new(matcher: Arc<dyn BiometricMatcher>) -> Self {
        Self {
            inner: RwLock::new(matcher),
            generation: AtomicU64::new(1),
        }
    }

    /// Snapshot the current matcher for one decision.
    pub fn load(&self) -> Arc<dyn BiometricMatcher> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the matcher atomically. Returns the new generation number.
    pub fn swap(&self, matcher: Arc<dyn BiometricMatcher>) -> u64 {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = matcher;
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
