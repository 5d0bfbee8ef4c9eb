//! Probe capability and the executor that classifies its results.

mod ping;

pub use ping::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::models::{PingTarget, ProbeOutcome};

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("resolution failed: {0}")]
    Resolution(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProbeError {
    /// The short classification recorded in `ProbeOutcome::error`.
    pub fn classify(&self) -> String {
        match self {
            ProbeError::Timeout(_) => "timeout".to_string(),
            ProbeError::Unreachable(detail) => format!("unreachable: {}", detail),
            ProbeError::Resolution(detail) => format!("resolution failed: {}", detail),
            ProbeError::Transport(detail) => format!("transport error: {}", detail),
        }
    }
}

/// Sends one probe to an address and reports the round-trip time.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn send(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Runs a single probe through a [`Probe`] transport and turns whatever
/// happens into a [`ProbeOutcome`].
#[derive(Clone)]
pub struct ProbeExecutor {
    transport: Arc<dyn Probe>,
}

impl ProbeExecutor {
    pub fn new(transport: Arc<dyn Probe>) -> Self {
        Self { transport }
    }

    /// Probe `target`. Never fails: errors and timeouts become unsuccessful outcomes.
    ///
    /// The outcome is stamped with the time the probe was issued and carries
    /// sequence 0; the scheduler assigns the real sequence.
    pub async fn probe(&self, target: &PingTarget, timeout: Duration) -> ProbeOutcome {
        let issued_at = Utc::now();

        let result = match tokio::time::timeout(timeout, self.transport.send(&target.address, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };

        // A reply slower than the timeout still counts as lost.
        let result = result.and_then(|latency| {
            if latency >= timeout {
                Err(ProbeError::Timeout(timeout))
            } else {
                Ok(latency)
            }
        });

        match result {
            Ok(latency) => ProbeOutcome::success(target, issued_at, latency),
            Err(e) => {
                tracing::debug!("Probe failed for {} ({}): {}", target.label, target.address, e);
                ProbeOutcome::failure(target, issued_at, e.classify())
            }
        }
    }
}
