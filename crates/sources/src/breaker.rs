use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// A per-source circuit breaker. After `threshold` consecutive failures the
/// breaker opens for `cooldown`; the first caller after the cooldown gets a
/// single half-open probe, and its outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Whether a request may proceed right now.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if Instant::now() >= until {
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight.
            State::HalfOpen => false,
        }
    }

    pub fn on_success(&self) {
        *self.state.lock().unwrap() = State::Closed { failures: 0 };
    }

    pub fn on_failure(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    State::Open {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    State::Closed { failures }
                }
            }
            State::HalfOpen | State::Open { .. } => State::Open {
                until: Instant::now() + self.cooldown,
            },
        };
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Open { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_recovers_via_probe() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));

        assert!(breaker.allow());
        breaker.on_failure();
        assert!(breaker.allow());
        breaker.on_failure();

        // Open: fail fast.
        assert!(!breaker.allow());
        assert!(breaker.is_open());

        // After the cooldown, exactly one probe is admitted.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.allow());
        assert!(!breaker.allow());

        // A successful probe closes the circuit.
        breaker.on_success();
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.on_failure();
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allow());
        breaker.on_failure();
        assert!(!breaker.allow());
    }

    #[test]
    fn successes_reset_the_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert!(!breaker.is_open());
    }
}
