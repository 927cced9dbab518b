use std::sync::atomic::{AtomicI64, Ordering};

/// Produces strictly increasing microsecond timestamps for a single session.
///
/// Wall-clock reads can collide or even go backwards across a fast sequence
/// of events (two LLM calls logged in the same microsecond, NTP slew). This
/// clock guarantees every value it hands out is greater than the last one it
/// handed out, by bumping forward on collision.
#[derive(Debug, Default)]
pub struct SessionClock {
    last_us: AtomicI64,
}

impl SessionClock {
    pub fn new() -> Self {
        Self { last_us: AtomicI64::new(0) }
    }

    pub fn now_us(&self) -> i64 {
        loop {
            let wall = chrono::Utc::now().timestamp_micros();
            let last = self.last_us.load(Ordering::SeqCst);
            let next = if wall > last { wall } else { last + 1 };
            if self
                .last_us
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase_under_collision() {
        let clock = SessionClock::new();
        let mut prev = clock.now_us();
        for _ in 0..1000 {
            let next = clock.now_us();
            assert!(next > prev);
            prev = next;
        }
    }
}
