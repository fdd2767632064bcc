//! Per-topic circuit breakers
//!
//! States:
//! - Closed: calls proceed, consecutive failures are counted
//! - Open: calls are rejected until the reset timeout has elapsed
//! - HalfOpen: exactly one trial call is admitted; its outcome closes or
//!   reopens the circuit

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Circuit breaker settings, shared by every topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before admitting a trial call
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one topic's breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub topic: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds since the circuit last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the admitted half-open trial
    trial_started: Option<Instant>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

impl Circuit {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
    }
}

/// Breakers for every topic seen so far
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Circuit>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to make a call on `topic`
    ///
    /// Returns false when the call must be rejected without dispatching.
    pub fn try_acquire(&self, topic: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        let reset_timeout = self.config.reset_timeout();
        let mut circuit = self.circuits.entry(topic.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map_or(reset_timeout, |at| now.duration_since(at));
                if elapsed < reset_timeout {
                    tracing::debug!(
                        topic,
                        remaining_ms = (reset_timeout - elapsed).as_millis() as u64,
                        "Circuit breaker open, rejecting call"
                    );
                    return false;
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_started = Some(now);
                tracing::info!(topic, "Circuit breaker half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                // A trial abandoned by its caller would otherwise hold the
                // circuit half-open forever.
                let stuck = circuit
                    .trial_started
                    .is_none_or(|at| now.duration_since(at) >= reset_timeout);
                if stuck {
                    circuit.trial_started = Some(now);
                }
                stuck
            }
        }
    }

    pub fn record_success(&self, topic: &str) {
        if !self.config.enabled {
            return;
        }

        let mut circuit = self.circuits.entry(topic.to_string()).or_default();
        match circuit.state {
            CircuitState::HalfOpen => {
                *circuit = Circuit::default();
                tracing::info!(topic, "Circuit breaker closed after successful trial");
            }
            CircuitState::Closed => circuit.consecutive_failures = 0,
            // A call admitted before the circuit opened; the open period stands
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, topic: &str) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let mut circuit = self.circuits.entry(topic.to_string()).or_default();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.open(now);
                    tracing::warn!(
                        topic,
                        failures = circuit.consecutive_failures,
                        reset_timeout_ms = self.config.reset_timeout_ms,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.open(now);
                tracing::warn!(topic, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state; topics never called report `Closed`
    pub fn state(&self, topic: &str) -> CircuitState {
        self.circuits
            .get(topic)
            .map_or(CircuitState::Closed, |circuit| circuit.state)
    }

    /// Force a topic's breaker back to closed
    pub fn reset(&self, topic: &str) -> bool {
        let removed = self.circuits.remove(topic).is_some();
        if removed {
            tracing::info!(topic, "Circuit breaker reset");
        }
        removed
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| CircuitSnapshot {
                topic: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                open_for_ms: entry
                    .opened_at
                    .filter(|_| entry.state != CircuitState::Closed)
                    .map(|at| now.duration_since(at).as_millis() as u64),
            })
            .collect();
        snapshots.sort_by(|a, b| a.topic.cmp(&b.topic));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(threshold: u32, reset_timeout_ms: u64) -> CircuitBreakers {
        CircuitBreakers::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            reset_timeout_ms,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breakers(3, 60_000);
        for _ in 0..2 {
            assert!(cb.try_acquire("svc"));
            cb.record_failure("svc");
        }
        assert_eq!(cb.state("svc"), CircuitState::Closed);

        assert!(cb.try_acquire("svc"));
        cb.record_failure("svc");
        assert_eq!(cb.state("svc"), CircuitState::Open);
        assert!(!cb.try_acquire("svc"));

        // Other topics are unaffected
        assert!(cb.try_acquire("other"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breakers(2, 60_000);
        cb.record_failure("svc");
        cb.record_success("svc");
        cb.record_failure("svc");
        assert_eq!(cb.state("svc"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let cb = breakers(1, 0);
        cb.record_failure("svc");
        assert_eq!(cb.state("svc"), CircuitState::Open);

        assert!(cb.try_acquire("svc"));
        assert_eq!(cb.state("svc"), CircuitState::HalfOpen);

        cb.record_success("svc");
        assert_eq!(cb.state("svc"), CircuitState::Closed);
        assert_eq!(cb.snapshots()[0].consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breakers(1, 20);
        cb.record_failure("svc");
        std::thread::sleep(Duration::from_millis(25));

        assert!(cb.try_acquire("svc"));
        assert!(!cb.try_acquire("svc"));
        cb.record_failure("svc");
        assert_eq!(cb.state("svc"), CircuitState::Open);
        assert!(!cb.try_acquire("svc"));
    }

    #[test]
    fn test_disabled_never_opens() {
        let cb = CircuitBreakers::new(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            ..Default::default()
        });
        for _ in 0..5 {
            cb.record_failure("svc");
        }
        assert!(cb.try_acquire("svc"));
        assert_eq!(cb.state("svc"), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = breakers(1, 60_000);
        cb.record_failure("svc");
        assert!(cb.reset("svc"));
        assert!(cb.try_acquire("svc"));
        assert!(!cb.reset("never-seen"));
    }
}
