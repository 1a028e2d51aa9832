//! Per-upstream circuit breaking.
//!
//! # States
//! - Closed: requests pass, consecutive failures are counted
//! - Open: requests fail fast until the cooldown elapses
//! - Half-open: a single probe is in flight
//!
//! The cooldown is `backoff * threshold`, preserving the coupling between
//! the retry knobs and the breaker window. A request counts as a failure
//! when its response status is >= 500 (which includes gateway-generated 502
//! and 504) or the transport failed; 4xx responses reflect client behavior
//! and count as successes. Any success resets the failure counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Circuit state, exposed for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds governing a circuit, derived from the route's retry spec.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
    /// Consecutive failures that trip the circuit.
    pub threshold: u32,
    /// Base backoff; the open window is `backoff * threshold`.
    pub backoff: Duration,
}

impl CircuitPolicy {
    /// Time the circuit stays open before admitting a probe.
    pub fn cooldown(&self) -> Duration {
        self.backoff * self.threshold
    }
}

struct Circuit {
    state: CircuitState,
    failures: u32,
    successes: u64,
    last_failure: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
        }
    }
}

/// Process-wide registry of circuits keyed by upstream base URL.
///
/// Uses the same two-level locking as the limiter registry: the concurrent
/// map resolves the circuit, the per-circuit mutex serializes transitions,
/// so different upstreams never contend.
pub struct BreakerRegistry {
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            circuits: DashMap::new(),
        }
    }

    fn circuit(&self, upstream: &str) -> Arc<Mutex<Circuit>> {
        if let Some(circuit) = self.circuits.get(upstream) {
            return Arc::clone(&circuit);
        }
        Arc::clone(
            self.circuits
                .entry(upstream.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::new())))
                .value(),
        )
    }

    /// Pre-call gate. Returns false while the circuit is open or a half-open
    /// probe is already in flight; the call that flips open to half-open is
    /// the probe.
    pub fn allow(&self, upstream: &str, policy: &CircuitPolicy) -> bool {
        let circuit = self.circuit(upstream);
        let mut circuit = circuit.lock();
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = circuit
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= policy.cooldown());
                if cooled {
                    debug!(upstream, "circuit half-open, admitting probe");
                    circuit.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => false,
        }
    }

    /// Post-call feedback for the upstream.
    pub fn record(&self, upstream: &str, success: bool, policy: &CircuitPolicy) {
        let circuit = self.circuit(upstream);
        let mut circuit = circuit.lock();
        if success {
            circuit.successes += 1;
            circuit.failures = 0;
            if circuit.state == CircuitState::HalfOpen {
                debug!(upstream, "probe succeeded, circuit closed");
                circuit.state = CircuitState::Closed;
            }
            return;
        }
        circuit.failures += 1;
        circuit.last_failure = Some(Instant::now());
        match circuit.state {
            CircuitState::HalfOpen => {
                warn!(upstream, "probe failed, circuit re-opened");
                circuit.state = CircuitState::Open;
            }
            CircuitState::Closed if circuit.failures >= policy.threshold => {
                warn!(
                    upstream,
                    failures = circuit.failures,
                    "failure threshold reached, circuit opened"
                );
                circuit.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Current state of the circuit for an upstream, if one exists.
    pub fn state(&self, upstream: &str) -> Option<CircuitState> {
        self.circuits.get(upstream).map(|c| c.lock().state)
    }

    /// Successes recorded for an upstream, if a circuit exists.
    pub fn successes(&self, upstream: &str) -> Option<u64> {
        self.circuits.get(upstream).map(|c| c.lock().successes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP: &str = "http://backend:9000";

    fn policy(threshold: u32, backoff_ms: u64) -> CircuitPolicy {
        CircuitPolicy {
            threshold,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    #[test]
    fn cooldown_is_backoff_times_threshold() {
        assert_eq!(policy(3, 100).cooldown(), Duration::from_millis(300));
    }

    #[test]
    fn stays_closed_below_threshold() {
        let registry = BreakerRegistry::new();
        let p = policy(3, 100);
        registry.record(UP, false, &p);
        registry.record(UP, false, &p);
        assert_eq!(registry.state(UP), Some(CircuitState::Closed));
        assert!(registry.allow(UP, &p));
    }

    #[test]
    fn opens_at_threshold_and_fails_fast() {
        let registry = BreakerRegistry::new();
        let p = policy(3, 10_000);
        for _ in 0..3 {
            assert!(registry.allow(UP, &p));
            registry.record(UP, false, &p);
        }
        assert_eq!(registry.state(UP), Some(CircuitState::Open));
        assert!(!registry.allow(UP, &p));
        assert!(!registry.allow(UP, &p));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let registry = BreakerRegistry::new();
        let p = policy(3, 10_000);
        registry.record(UP, false, &p);
        registry.record(UP, false, &p);
        registry.record(UP, true, &p);
        registry.record(UP, false, &p);
        registry.record(UP, false, &p);
        assert_eq!(registry.state(UP), Some(CircuitState::Closed));
    }

    #[test]
    fn admits_exactly_one_probe_after_cooldown() {
        let registry = BreakerRegistry::new();
        let p = policy(2, 5);
        registry.record(UP, false, &p);
        registry.record(UP, false, &p);
        assert!(!registry.allow(UP, &p));
        std::thread::sleep(p.cooldown() + Duration::from_millis(5));
        assert!(registry.allow(UP, &p));
        // Probe outstanding: nothing else gets through.
        assert!(!registry.allow(UP, &p));
        assert_eq!(registry.state(UP), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn probe_success_closes_circuit() {
        let registry = BreakerRegistry::new();
        let p = policy(1, 1);
        registry.record(UP, false, &p);
        std::thread::sleep(Duration::from_millis(10));
        assert!(registry.allow(UP, &p));
        registry.record(UP, true, &p);
        assert_eq!(registry.state(UP), Some(CircuitState::Closed));
        assert_eq!(registry.successes(UP), Some(1));
        assert!(registry.allow(UP, &p));
    }

    #[test]
    fn probe_failure_reopens_circuit() {
        let registry = BreakerRegistry::new();
        let p = policy(1, 50);
        registry.record(UP, false, &p);
        std::thread::sleep(Duration::from_millis(60));
        assert!(registry.allow(UP, &p));
        registry.record(UP, false, &p);
        assert_eq!(registry.state(UP), Some(CircuitState::Open));
        // The cooldown clock restarted; still failing fast.
        assert!(!registry.allow(UP, &p));
    }

    #[test]
    fn upstreams_are_independent() {
        let registry = BreakerRegistry::new();
        let p = policy(1, 10_000);
        registry.record("http://a", false, &p);
        assert!(!registry.allow("http://a", &p));
        assert!(registry.allow("http://b", &p));
    }
}
