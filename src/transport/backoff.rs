//! Exponential reconnect backoff: initial delay, doubled each failed
//! attempt up to a cap, reset to the initial delay after a success
//! (spec §4.2). Grounded on the shape of
//! `scrapers/binance_session.rs`'s `BackoffCalculator` (`attempt`,
//! `next_backoff`, `reset`), without jitter — spec.md pins the schedule
//! exactly ("initial 5s, doubled up to 30s, reset to 5s after success").

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait for this attempt, then doubles it
    /// (capped at `max`) for the next call.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap_then_holds() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let delays: Vec<_> = (0..6).map(|_| b.next()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(5));
    }
}
