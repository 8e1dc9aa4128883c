//! TCP outbound retry policy
//!
//! ```text
//!            received data
//!   Direct ─────────────────▶ Established
//!     │
//!     │ closed or failed with nothing received
//!     ▼
//!   Fallback ───────────────▶ Terminal
//! ```
//!
//! The only guard is whether the first attempt ever received a byte from the
//! remote. The fallback attempt is never retried.

use crate::config::FallbackMode;
use std::fmt;

/// Where an attempt connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-attempt record of what came back from the remote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub bytes_received: u64,
}

impl RetryState {
    pub fn record(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    pub fn received_any(&self) -> bool {
        self.bytes_received > 0
    }
}

/// Policy states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    Direct,
    Fallback,
    Established,
    Terminal,
}

/// What to do after an attempt ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Connect again to this target
    Retry(Target),
    /// The session is over
    Done,
}

/// Retry state machine for one session
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    stage: RetryStage,
    destination: Target,
    fallback_host: Option<String>,
    mode: FallbackMode,
}

impl RetryPolicy {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        fallback_host: Option<String>,
        mode: FallbackMode,
    ) -> Self {
        Self {
            stage: RetryStage::Direct,
            destination: Target {
                host: host.into(),
                port,
            },
            fallback_host: fallback_host.filter(|h| !h.is_empty()),
            mode,
        }
    }

    pub fn stage(&self) -> RetryStage {
        self.stage
    }

    /// A retry may still follow the current attempt
    pub fn retry_pending(&self) -> bool {
        self.stage == RetryStage::Direct
    }

    /// Target of the first attempt
    pub fn initial_target(&self) -> Target {
        match (self.mode, &self.fallback_host) {
            (FallbackMode::Prefer, Some(host)) => Target {
                host: host.clone(),
                port: self.destination.port,
            },
            _ => self.destination.clone(),
        }
    }

    /// Target of the retry: the fallback host, or the destination when none is
    /// configured. The port always comes from the request.
    pub fn fallback_target(&self) -> Target {
        Target {
            host: self
                .fallback_host
                .clone()
                .unwrap_or_else(|| self.destination.host.clone()),
            port: self.destination.port,
        }
    }

    /// Record the end of the current attempt
    pub fn on_attempt_finished(&mut self, received_any: bool) -> RetryDecision {
        match self.stage {
            RetryStage::Direct if received_any => {
                self.stage = RetryStage::Established;
                RetryDecision::Done
            }
            RetryStage::Direct => {
                self.stage = RetryStage::Fallback;
                RetryDecision::Retry(self.fallback_target())
            }
            RetryStage::Fallback => {
                self.stage = RetryStage::Terminal;
                RetryDecision::Done
            }
            RetryStage::Established | RetryStage::Terminal => RetryDecision::Done,
        }
    }
}
