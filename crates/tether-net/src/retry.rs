//! Reconnect schedule for a session that lost its hub connection.
//!
//! Delays are fixed for the first attempts and jittered afterwards. The
//! schedule never gives up. Once the outage has lasted long enough it asks
//! its owner to announce the loss, at most once until [`RetrySchedule::reset`]
//! is called on a successful reconnect.

use std::time::Duration;

use rand::Rng;

use tether_shared::constants::{
    RETRY_ANNOUNCE_ATTEMPT, RETRY_FIXED_DELAYS_SECS, RETRY_JITTER_RANGE_SECS,
};

/// What to do before the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub delay: Duration,
    /// Publish the "connection lost" notification and disconnect event now.
    pub announce: bool,
}

#[derive(Debug, Default)]
pub struct RetrySchedule {
    announced: bool,
}

impl RetrySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before reconnect attempt `attempt` (0-based count of attempts
    /// already made in this outage).
    pub fn delay_for(attempt: u32) -> Duration {
        match RETRY_FIXED_DELAYS_SECS.get(attempt as usize) {
            Some(secs) => Duration::from_secs(*secs),
            None => {
                let (min, max) = RETRY_JITTER_RANGE_SECS;
                let millis = rand::thread_rng().gen_range(min * 1000..max * 1000);
                Duration::from_millis(millis)
            }
        }
    }

    pub fn next_step(&mut self, attempt: u32) -> RetryStep {
        let announce = attempt >= RETRY_ANNOUNCE_ATTEMPT && !self.announced;
        if announce {
            self.announced = true;
        }
        RetryStep {
            delay: Self::delay_for(attempt),
            announce,
        }
    }

    /// Called when the session reaches `Connected`.
    pub fn reset(&mut self) {
        self.announced = false;
    }

    pub fn has_announced(&self) -> bool {
        self.announced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delays() {
        assert_eq!(RetrySchedule::delay_for(0), Duration::from_secs(3));
        assert_eq!(RetrySchedule::delay_for(1), Duration::from_secs(5));
        assert_eq!(RetrySchedule::delay_for(2), Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_delays_in_range() {
        for attempt in 3..200 {
            let delay = RetrySchedule::delay_for(attempt);
            assert!(delay >= Duration::from_secs(10), "{delay:?}");
            assert!(delay < Duration::from_secs(20), "{delay:?}");
        }
    }

    #[test]
    fn test_announces_once_per_outage() {
        let mut schedule = RetrySchedule::new();
        let announced: Vec<bool> = (0..10).map(|a| schedule.next_step(a).announce).collect();
        assert_eq!(announced.iter().filter(|a| **a).count(), 1);
        assert!(announced[3]);
        assert!(!announced[2]);
    }

    #[test]
    fn test_reset_rearms_announcement() {
        let mut schedule = RetrySchedule::new();
        for a in 0..5 {
            schedule.next_step(a);
        }
        assert!(schedule.has_announced());
        schedule.reset();
        assert!(!schedule.has_announced());
        assert!(!schedule.next_step(0).announce);
        assert!(schedule.next_step(3).announce);
    }
}
