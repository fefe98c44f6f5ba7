//! # Circuit Breaker
//!
//! One circuit per backend id, shared by every dispatch that goes through the
//! same [`CircuitBreaker`]. The state machine is driven by a single
//! `circuit_open_until` timestamp:
//!
//! - `None` is CLOSED: calls are admitted and failures counted.
//! - `Some(t)` with `now < t` is OPEN: calls are skipped without invoking the
//!   backend.
//! - `Some(t)` with `now >= t` is HALF-OPEN: exactly one trial call is
//!   admitted. Its success closes the circuit, its failure re-arms the timer.
//!
//! Every read-modify-write happens under the backend's own mutex, and the
//! lock is never held across an `.await`. Admission hands out a
//! [`CallPermit`]; resolving it records the outcome, dropping it unresolved
//! (cancellation) records nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::health::{BackendHealth, HealthSnapshot};
use crate::metrics::{
    CIRCUIT_CONSECUTIVE_FAILURES, CIRCUIT_OPEN, CIRCUIT_SKIPS_TOTAL, CIRCUIT_TRANSITIONS_TOTAL,
};
use crate::sanitization::sanitize_reason;
use crate::types::{Error, ErrorKind};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls admitted
    Closed,
    /// Failing, calls skipped until the timer runs out
    Open,
    /// Timer elapsed, one trial call admitted
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Per-backend record
#[derive(Debug)]
struct BackendState {
    backend_id: String,
    consecutive_failures: u32,
    circuit_open_until: Option<Instant>,
    last_failure_reason: Option<String>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_skips: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BackendState {
    fn new(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            consecutive_failures: 0,
            circuit_open_until: None,
            last_failure_reason: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            total_skips: 0,
            last_success_at: None,
            last_failure_at: None,
        }
    }

    fn state(&self, now: Instant) -> CircuitState {
        match self.circuit_open_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    fn time_until_retry(&self, now: Instant) -> Duration {
        self.circuit_open_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn health(&self, now: Instant) -> BackendHealth {
        let state = self.state(now);
        BackendHealth {
            backend_id: self.backend_id.clone(),
            state,
            is_open: state == CircuitState::Open,
            consecutive_failures: self.consecutive_failures,
            time_until_retry_ms: self.time_until_retry(now).as_millis() as u64,
            trial_in_flight: self.trial_in_flight && state != CircuitState::Closed,
            last_failure_reason: self.last_failure_reason.clone(),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_skips: self.total_skips,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
        }
    }

    fn emit_metrics(&self, now: Instant) {
        let backend = self.backend_id.clone();
        let open = if self.state(now) == CircuitState::Open { 1.0 } else { 0.0 };
        gauge!(CIRCUIT_OPEN, open, "backend" => backend.clone());
        gauge!(
            CIRCUIT_CONSECUTIVE_FAILURES,
            self.consecutive_failures as f64,
            "backend" => backend
        );
    }
}

type SharedState = Arc<Mutex<BackendState>>;

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    // Transitions are plain field writes; a poisoned state is still whole
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of per-backend circuits
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Name of this breaker (for logging)
    name: String,
    /// Thresholds for backends without an override
    defaults: CircuitBreakerConfig,
    /// Per-backend thresholds
    overrides: HashMap<String, CircuitBreakerConfig>,
    /// Circuits by backend id, created lazily
    circuits: RwLock<HashMap<String, SharedState>>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given name and default thresholds
    pub fn new<S: Into<String>>(name: S, defaults: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            defaults,
            overrides: HashMap::new(),
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// Uses different thresholds for one backend
    pub fn with_backend_config<S: Into<String>>(
        mut self,
        backend_id: S,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.overrides.insert(backend_id.into(), config);
        self
    }

    /// Thresholds that apply to a backend
    pub fn config_for(&self, backend_id: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(backend_id)
            .copied()
            .unwrap_or(self.defaults)
    }

    fn circuit(&self, backend_id: &str) -> SharedState {
        {
            let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = circuits.get(backend_id) {
                return Arc::clone(state);
            }
        }

        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        let state = circuits.entry(backend_id.to_string()).or_insert_with(|| {
            debug!(breaker = %self.name, backend = %backend_id, "Tracking new backend");
            Arc::new(Mutex::new(BackendState::new(backend_id)))
        });
        Arc::clone(state)
    }

    fn existing(&self, backend_id: &str) -> Option<SharedState> {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(backend_id)
            .cloned()
    }

    /// Asks to call a backend.
    ///
    /// Returns a synthetic `CircuitOpen` error when the circuit is open, or
    /// when it is half-open and another caller already holds the trial.
    pub fn try_acquire(&self, backend_id: &str) -> Result<CallPermit, Error> {
        let shared = self.circuit(backend_id);
        let now = Instant::now();

        let trial = {
            let mut state = lock(&shared);
            match state.state(now) {
                CircuitState::Closed => false,
                CircuitState::HalfOpen if !state.trial_in_flight => {
                    state.trial_in_flight = true;
                    info!(
                        breaker = %self.name,
                        backend = %backend_id,
                        failures = %state.consecutive_failures,
                        "Circuit HALF-OPEN: admitting trial call"
                    );
                    true
                }
                current => {
                    state.total_skips += 1;
                    let remaining = state.time_until_retry(now);
                    counter!(CIRCUIT_SKIPS_TOTAL, 1, "backend" => backend_id.to_string());
                    debug!(
                        breaker = %self.name,
                        backend = %backend_id,
                        state = %current,
                        remaining_ms = %remaining.as_millis(),
                        "Circuit open, call rejected"
                    );
                    let message = if current == CircuitState::HalfOpen {
                        format!("circuit half-open for '{}', trial call in flight", backend_id)
                    } else {
                        format!(
                            "circuit open for '{}', retry in {} ms",
                            backend_id,
                            remaining.as_millis()
                        )
                    };
                    return Err(Error::new(ErrorKind::CircuitOpen, message)
                        .context("backend", backend_id)
                        .context("retry_in_ms", remaining.as_millis() as u64));
                }
            }
        };

        Ok(CallPermit {
            backend_id: backend_id.to_string(),
            breaker: self.name.clone(),
            config: self.config_for(backend_id),
            state: shared,
            trial,
            resolved: false,
        })
    }

    /// Current state of a backend's circuit; unknown backends are closed
    pub fn state(&self, backend_id: &str) -> CircuitState {
        self.existing(backend_id)
            .map(|shared| lock(&shared).state(Instant::now()))
            .unwrap_or(CircuitState::Closed)
    }

    /// Health of one backend, `None` if it has never been called
    pub fn backend_health(&self, backend_id: &str) -> Option<BackendHealth> {
        self.existing(backend_id)
            .map(|shared| lock(&shared).health(Instant::now()))
    }

    /// Read-only view of every known backend, sorted by id
    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        let circuits: Vec<SharedState> = self
            .circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut backends: Vec<BackendHealth> =
            circuits.iter().map(|shared| lock(shared).health(now)).collect();
        backends.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));

        HealthSnapshot {
            captured_at: Utc::now(),
            backends,
        }
    }

    /// Forces one circuit closed. Returns false for unknown backends.
    pub fn reset(&self, backend_id: &str) -> bool {
        match self.existing(backend_id) {
            Some(shared) => {
                self.reset_state(&mut lock(&shared));
                true
            }
            None => false,
        }
    }

    /// Forces every circuit closed
    pub fn reset_all(&self) {
        let circuits: Vec<SharedState> = self
            .circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for shared in circuits {
            self.reset_state(&mut lock(&shared));
        }
    }

    fn reset_state(&self, state: &mut BackendState) {
        let previous = state.state(Instant::now());
        state.consecutive_failures = 0;
        state.circuit_open_until = None;

        info!(
            breaker = %self.name,
            backend = %state.backend_id,
            previous_state = %previous,
            "Circuit manually reset to CLOSED state"
        );
        state.emit_metrics(Instant::now());
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", CircuitBreakerConfig::default())
    }
}

/// Admission to call one backend once (including its retries)
///
/// Must be resolved with [`CallPermit::record_success`] or
/// [`CallPermit::record_failure`]. Dropping it unresolved frees a held
/// half-open trial slot and leaves the counters alone.
#[derive(Debug)]
pub struct CallPermit {
    backend_id: String,
    breaker: String,
    config: CircuitBreakerConfig,
    state: SharedState,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// True when this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a success: resets the counter and closes the circuit
    pub fn record_success(mut self) {
        self.resolved = true;
        let now = Instant::now();
        let mut state = lock(&self.state);

        if self.trial {
            state.trial_in_flight = false;
        }

        let previous = state.state(now);
        state.consecutive_failures = 0;
        state.circuit_open_until = None;
        state.total_successes += 1;
        state.last_success_at = Some(Utc::now());

        if previous != CircuitState::Closed {
            info!(
                breaker = %self.breaker,
                backend = %self.backend_id,
                previous_state = %previous,
                "Circuit CLOSED: backend recovered"
            );
            counter!(
                CIRCUIT_TRANSITIONS_TOTAL, 1,
                "backend" => self.backend_id.clone(),
                "to" => "closed"
            );
        }

        state.emit_metrics(now);
    }

    /// Records one failed attempt, opening or re-arming the circuit as needed
    pub fn record_failure(mut self, error: &Error) {
        self.resolved = true;
        let now = Instant::now();
        let open_for = self.config.open_duration();
        let mut state = lock(&self.state);

        if self.trial {
            state.trial_in_flight = false;
        }

        state.total_failures += 1;
        state.last_failure_at = Some(Utc::now());
        state.last_failure_reason = Some(sanitize_reason(&error.summary()));

        // A late success from a call admitted while closed may have closed
        // the circuit under the trial; count the failure normally then.
        if self.trial && state.circuit_open_until.is_some() {
            // Already at the threshold; only the timer is re-armed
            state.circuit_open_until = Some(now + open_for);
            warn!(
                breaker = %self.breaker,
                backend = %self.backend_id,
                open_for_ms = %open_for.as_millis(),
                "Circuit REOPENED: trial call failed"
            );
            counter!(
                CIRCUIT_TRANSITIONS_TOTAL, 1,
                "backend" => self.backend_id.clone(),
                "to" => "open"
            );
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);

            if state.consecutive_failures >= self.config.max_failures {
                let was_open = state.circuit_open_until.is_some();
                state.circuit_open_until = Some(now + open_for);

                if !was_open {
                    warn!(
                        breaker = %self.breaker,
                        backend = %self.backend_id,
                        failures = %state.consecutive_failures,
                        threshold = %self.config.max_failures,
                        open_for_ms = %open_for.as_millis(),
                        "Circuit OPEN: failure threshold reached"
                    );
                    counter!(
                        CIRCUIT_TRANSITIONS_TOTAL, 1,
                        "backend" => self.backend_id.clone(),
                        "to" => "open"
                    );
                }
            } else {
                debug!(
                    breaker = %self.breaker,
                    backend = %self.backend_id,
                    failures = %state.consecutive_failures,
                    threshold = %self.config.max_failures,
                    "Failure recorded"
                );
            }
        }

        state.emit_metrics(now);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.resolved || !self.trial {
            return;
        }
        let mut state = lock(&self.state);
        state.trial_in_flight = false;
        debug!(
            breaker = %self.breaker,
            backend = %self.backend_id,
            "Trial call abandoned, slot released"
        );
    }
}
