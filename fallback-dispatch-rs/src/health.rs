//! # Backend Health
//!
//! Read-only view of every circuit a dispatcher knows about. Capturing a
//! snapshot takes each backend's lock briefly and never awaits.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;

/// Health of a single backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend_id: String,
    pub state: CircuitState,
    /// True while calls to this backend are being skipped
    pub is_open: bool,
    pub consecutive_failures: u32,
    /// Milliseconds until the next trial call is admitted, 0 when closed
    pub time_until_retry_ms: u64,
    /// A trial call is running; never set while the circuit is closed
    pub trial_in_flight: bool,
    pub last_failure_reason: Option<String>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_skips: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl BackendHealth {
    pub fn time_until_retry(&self) -> Duration {
        Duration::from_millis(self.time_until_retry_ms)
    }
}

/// Point-in-time health of all known backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub captured_at: DateTime<Utc>,
    /// Sorted by backend id
    pub backends: Vec<BackendHealth>,
}

impl HealthSnapshot {
    pub fn get(&self, backend_id: &str) -> Option<&BackendHealth> {
        self.backends.iter().find(|b| b.backend_id == backend_id)
    }

    /// Ids of backends whose circuit is currently open
    pub fn open_backends(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|b| b.is_open)
            .map(|b| b.backend_id.as_str())
            .collect()
    }

    /// True when no circuit is open
    pub fn all_closed(&self) -> bool {
        self.backends.iter().all(|b| !b.is_open)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
