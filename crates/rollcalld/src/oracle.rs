//! D-Bus clients for the face identification and liveness oracles.
//!
//! Every call is wrapped in a timeout so a hung oracle surfaces as a
//! retryable error instead of stalling the decision pipeline. Replies are
//! JSON payloads deserialized into the core wire types; anything malformed
//! is reported as `Unavailable`.

use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{
    BiometricMatcher, FrameResult, LivenessDetector, LivenessError, LivenessParams,
    LivenessVerdict, MatcherError,
};
use zbus::Connection;

#[zbus::proxy(
    interface = "org.rollcall.Matcher1",
    default_service = "org.rollcall.Matcher1",
    default_path = "/org/rollcall/Matcher1"
)]
trait Matcher {
    /// Identify the face in one encoded frame. Returns a JSON-encoded
    /// frame verdict.
    async fn identify(&self, frame: &[u8]) -> zbus::Result<String>;
}

#[zbus::proxy(
    interface = "org.rollcall.Liveness1",
    default_service = "org.rollcall.Liveness1",
    default_path = "/org/rollcall/Liveness1"
)]
trait Liveness {
    /// Run liveness detection over a frame sequence. `params_json` carries
    /// the blink-detection tuning; the reply is a JSON-encoded verdict.
    async fn check(&self, frames: Vec<Vec<u8>>, params_json: &str) -> zbus::Result<String>;
}

pub struct DbusMatcher {
    proxy: MatcherProxy<'static>,
    timeout: Duration,
}

impl DbusMatcher {
    pub async fn connect(
        conn: &Connection,
        service: &str,
        path: &str,
        timeout_secs: u64,
    ) -> zbus::Result<Self> {
        let proxy = MatcherProxy::builder(conn)
            .destination(service.to_string())?
            .path(path.to_string())?
            .build()
            .await?;
        Ok(Self {
            proxy,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[async_trait]
impl BiometricMatcher for DbusMatcher {
    async fn identify(&self, frame: &[u8]) -> Result<FrameResult, MatcherError> {
        let reply = tokio::time::timeout(self.timeout, self.proxy.identify(frame))
            .await
            .map_err(|_| MatcherError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| MatcherError::Unavailable(e.to_string()))?;
        serde_json::from_str(&reply)
            .map_err(|e| MatcherError::Unavailable(format!("malformed matcher reply: {e}")))
    }
}

pub struct DbusLiveness {
    proxy: LivenessProxy<'static>,
    timeout: Duration,
}

impl DbusLiveness {
    pub async fn connect(
        conn: &Connection,
        service: &str,
        path: &str,
        timeout_secs: u64,
    ) -> zbus::Result<Self> {
        let proxy = LivenessProxy::builder(conn)
            .destination(service.to_string())?
            .path(path.to_string())?
            .build()
            .await?;
        Ok(Self {
            proxy,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[async_trait]
impl LivenessDetector for DbusLiveness {
    async fn check(
        &self,
        frames: &[Vec<u8>],
        params: LivenessParams,
    ) -> Result<LivenessVerdict, LivenessError> {
        let params_json = serde_json::to_string(&params)
            .map_err(|e| LivenessError::Unavailable(e.to_string()))?;
        let reply = tokio::time::timeout(
            self.timeout,
            self.proxy.check(frames.to_vec(), &params_json),
        )
        .await
        .map_err(|_| LivenessError::Timeout(self.timeout.as_secs()))?
        .map_err(|e| LivenessError::Unavailable(e.to_string()))?;
        serde_json::from_str(&reply)
            .map_err(|e| LivenessError::Unavailable(format!("malformed liveness reply: {e}")))
    }
}
