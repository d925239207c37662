//! Per-connection circuit breakers guarding the remote inference endpoints.
//!
//! A connection that fails five times inside a minute opens for a minute;
//! the first dispatch attempted after the open interval is admitted as a
//! half-open probe, and its outcome closes or re-opens the circuit. While a
//! circuit is open, leases targeting that connection are released back to
//! the queue instead of dispatched.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const FAILURE_THRESHOLD: usize = 5;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);
pub const OPEN_FOR: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen,
}

#[derive(Default)]
pub struct CircuitBreakers(Mutex<HashMap<i32, State>>);

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a dispatch to this connection may proceed right now. An open
    /// circuit whose interval has elapsed admits exactly one caller as the
    /// half-open probe.
    pub fn admit(&self, connection_id: i32) -> bool {
        self.admit_at(connection_id, Instant::now())
    }

    pub fn record_success(&self, connection_id: i32) {
        let mut map = self.0.lock().unwrap();
        map.insert(
            connection_id,
            State::Closed {
                failures: VecDeque::new(),
            },
        );
    }

    pub fn record_failure(&self, connection_id: i32) {
        self.record_failure_at(connection_id, Instant::now())
    }

    /// Number of circuits currently open, for the monitoring surface.
    pub fn open_count(&self) -> usize {
        let now = Instant::now();
        let map = self.0.lock().unwrap();
        map.values()
            .filter(|state| matches!(state, State::Open { until } if *until > now))
            .count()
    }

    fn admit_at(&self, connection_id: i32, now: Instant) -> bool {
        let mut map = self.0.lock().unwrap();
        let state = map.entry(connection_id).or_insert(State::Closed {
            failures: VecDeque::new(),
        });
        match state {
            State::Closed { .. } => true,
            State::Open { until } if now >= *until => {
                *state = State::HalfOpen;
                true
            }
            State::Open { .. } => false,
            // A probe is already in flight; hold further dispatches.
            State::HalfOpen => false,
        }
    }

    fn record_failure_at(&self, connection_id: i32, now: Instant) {
        let mut map = self.0.lock().unwrap();
        let state = map.entry(connection_id).or_insert(State::Closed {
            failures: VecDeque::new(),
        });
        match state {
            State::Closed { failures } => {
                failures.push_back(now);
                while let Some(oldest) = failures.front() {
                    if now.duration_since(*oldest) > FAILURE_WINDOW {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() >= FAILURE_THRESHOLD {
                    tracing::warn!(connection_id, "circuit opened after repeated failures");
                    *state = State::Open {
                        until: now + OPEN_FOR,
                    };
                }
            }
            State::HalfOpen => {
                tracing::warn!(connection_id, "half-open probe failed, circuit re-opened");
                *state = State::Open {
                    until: now + OPEN_FOR,
                };
            }
            State::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn five_failures_in_window_open_the_circuit() {
        let breakers = CircuitBreakers::new();
        let t0 = Instant::now();
        for i in 0..4 {
            breakers.record_failure_at(1, t0 + Duration::from_secs(i));
            assert!(breakers.admit_at(1, t0 + Duration::from_secs(i)));
        }
        breakers.record_failure_at(1, t0 + Duration::from_secs(4));
        assert!(!breakers.admit_at(1, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let breakers = CircuitBreakers::new();
        let t0 = Instant::now();
        for i in 0..10 {
            // One failure every 70 seconds never reaches the threshold.
            breakers.record_failure_at(2, t0 + Duration::from_secs(i * 70));
        }
        assert!(breakers.admit_at(2, t0 + Duration::from_secs(700)));
    }

    #[test]
    fn open_circuit_admits_one_probe_after_interval() {
        let breakers = CircuitBreakers::new();
        let t0 = Instant::now();
        for i in 0..5 {
            breakers.record_failure_at(3, t0 + Duration::from_millis(i));
        }
        let after_open = t0 + OPEN_FOR + Duration::from_secs(1);
        assert!(breakers.admit_at(3, after_open)); // The half-open probe.
        assert!(!breakers.admit_at(3, after_open)); // Held behind the probe.
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let breakers = CircuitBreakers::new();
        let t0 = Instant::now();
        for i in 0..5 {
            breakers.record_failure_at(4, t0 + Duration::from_millis(i));
        }
        let after_open = t0 + OPEN_FOR + Duration::from_secs(1);
        assert!(breakers.admit_at(4, after_open));
        breakers.record_success(4);
        assert!(breakers.admit_at(4, after_open));

        for i in 0..5 {
            breakers.record_failure_at(4, after_open + Duration::from_millis(i));
        }
        let after_second = after_open + OPEN_FOR + Duration::from_secs(1);
        assert!(breakers.admit_at(4, after_second));
        breakers.record_failure_at(4, after_second);
        assert!(!breakers.admit_at(4, after_second + Duration::from_secs(1)));
    }

    #[test]
    fn unknown_connection_is_closed() {
        let breakers = CircuitBreakers::new();
        assert!(breakers.admit(99));
    }
}
