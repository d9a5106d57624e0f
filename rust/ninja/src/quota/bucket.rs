use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a single consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub consumed: bool,
    pub remaining: u64,
    /// Time until the bucket is topped up again.
    pub reset_in: Duration,
}

#[derive(Debug)]
struct State {
    tokens: u64,
    next_refill: Instant,
    last_used: Instant,
}

/// Bucket refilled to full capacity once per interval.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    interval: Duration,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(capacity: u64, interval: Duration) -> Self {
        Self::starting_at(capacity, interval, Instant::now())
    }

    pub fn starting_at(capacity: u64, interval: Duration, now: Instant) -> Self {
        Self {
            capacity,
            interval,
            state: Mutex::new(State {
                tokens: capacity,
                next_refill: now + interval,
                last_used: now,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn try_consume(&self) -> Probe {
        self.try_consume_at(Instant::now())
    }

    pub fn try_consume_at(&self, now: Instant) -> Probe {
        let mut state = self.state.lock();
        if now >= state.next_refill {
            state.tokens = self.capacity;
            // skip whole intervals that passed without traffic
            let behind = now.duration_since(state.next_refill).as_nanos() / self.interval.as_nanos().max(1);
            state.next_refill += self.interval * (behind as u32 + 1);
        }
        state.last_used = now;

        let consumed = state.tokens > 0;
        if consumed {
            state.tokens -= 1;
        }
        Probe {
            consumed,
            remaining: state.tokens,
            reset_in: state.next_refill.saturating_duration_since(now),
        }
    }

    /// Untouched for at least `idle`.
    pub fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        now.saturating_duration_since(self.state.lock().last_used) >= idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_strictly_decreases_until_empty() {
        let start = Instant::now();
        let bucket = TokenBucket::starting_at(3, Duration::from_secs(1), start);
        let remaining: Vec<_> = (0..5)
            .map(|step| bucket.try_consume_at(start + Duration::from_millis(step * 10)))
            .map(|probe| (probe.consumed, probe.remaining))
            .collect();
        assert_eq!(
            remaining,
            vec![(true, 2), (true, 1), (true, 0), (false, 0), (false, 0)]
        );
    }

    #[test]
    fn refills_after_the_interval() {
        let start = Instant::now();
        let bucket = TokenBucket::starting_at(1, Duration::from_secs(1), start);
        assert!(bucket.try_consume_at(start).consumed);
        let empty = bucket.try_consume_at(start + Duration::from_millis(400));
        assert!(!empty.consumed);
        assert_eq!(empty.reset_in, Duration::from_millis(600));

        let later = bucket.try_consume_at(start + Duration::from_millis(3_500));
        assert!(later.consumed);
        assert_eq!(later.reset_in, Duration::from_millis(500));
    }
}
