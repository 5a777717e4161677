//! Per-agent circuit breaker state
//!
//! Closed → Open on loop detection or an explicit pause. Open → Closed once
//! `now - opened_at` exceeds the timeout, evaluated whenever the breaker is
//! read, or on reset.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub agent_id: String,
    pub status: BreakerStatus,
    pub opened_at: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    /// Why the breaker was last opened
    #[serde(default)]
    pub reason: Option<String>,
}

impl CircuitBreakerState {
    pub fn closed(agent_id: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: BreakerStatus::Closed,
            opened_at: None,
            timeout_secs,
            reason: None,
        }
    }

    /// Open as of `now`
    pub fn open(&mut self, now: DateTime<Utc>, timeout_secs: u64, reason: impl Into<String>) {
        self.status = BreakerStatus::Open;
        self.opened_at = Some(now);
        self.timeout_secs = timeout_secs;
        self.reason = Some(reason.into());
    }

    pub fn close(&mut self) {
        self.status = BreakerStatus::Closed;
        self.opened_at = None;
    }

    /// Open and not yet past its timeout at `now`
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.opened_at) {
            (BreakerStatus::Open, Some(opened_at)) => {
                now - opened_at <= Duration::seconds(self.timeout_secs as i64)
            }
            (BreakerStatus::Open, None) => true,
            _ => false,
        }
    }

    /// Marked open but already past its timeout
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BreakerStatus::Open && !self.is_open_at(now)
    }
}
