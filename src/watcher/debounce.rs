use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Resettable delay timer folding a burst of accepted events into one
/// firing: the first event arms the timer, every further event pushes the
/// deadline out again, and the timer only fires once quiet for the full
/// interval.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    deadline: Option<Instant>,
    last_path: Option<PathBuf>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            last_path: None,
        }
    }

    pub fn record(&mut self, path: PathBuf, now: Instant) {
        self.deadline = Some(now + self.interval);
        self.last_path = Some(path);
    }

    /// Returns the pending path once the quiet interval has elapsed,
    /// disarming the timer.
    pub fn due(&mut self, now: Instant) -> Option<PathBuf> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.last_path.take()
            }
            _ => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// How long the event loop may block before it must re-check `due`.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn burst_fires_exactly_once() {
        let mut d = Debouncer::new(Duration::from_secs(2));
        let t0 = Instant::now();

        for i in 0..10 {
            d.record(p("main.go"), t0 + Duration::from_millis(i * 100));
            assert_eq!(None, d.due(t0 + Duration::from_millis(i * 100)));
        }

        // 2s of quiet after the last event
        let fire_at = t0 + Duration::from_millis(900) + Duration::from_secs(2);
        assert_eq!(Some(p("main.go")), d.due(fire_at));
        // and nothing more without new events
        assert_eq!(None, d.due(fire_at + Duration::from_secs(10)));
        assert!(!d.is_armed());
    }

    #[test]
    fn each_event_resets_the_deadline() {
        let mut d = Debouncer::new(Duration::from_secs(2));
        let t0 = Instant::now();

        d.record(p("a.go"), t0);
        // one more event just before the deadline pushes it out
        d.record(p("b.go"), t0 + Duration::from_millis(1900));
        assert_eq!(None, d.due(t0 + Duration::from_secs(2)));
        assert_eq!(
            Some(p("b.go")),
            d.due(t0 + Duration::from_millis(1900) + Duration::from_secs(2))
        );
    }

    #[test]
    fn events_after_firing_arm_a_second_round() {
        let mut d = Debouncer::new(Duration::from_secs(2));
        let t0 = Instant::now();

        d.record(p("a.go"), t0);
        assert_eq!(Some(p("a.go")), d.due(t0 + Duration::from_secs(2)));

        d.record(p("b.go"), t0 + Duration::from_secs(3));
        assert_eq!(Some(p("b.go")), d.due(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn next_timeout_tracks_the_deadline() {
        let mut d = Debouncer::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(None, d.next_timeout(t0));

        d.record(p("a.go"), t0);
        assert_eq!(Some(Duration::from_secs(2)), d.next_timeout(t0));
        assert_eq!(
            Some(Duration::from_secs(0)),
            d.next_timeout(t0 + Duration::from_secs(5))
        );
    }
}
