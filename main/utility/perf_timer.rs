use std::time::{Duration, Instant};

/// A stopwatch that can be paused and resumed across the phases of a run.
pub struct PerfTimer {
    start_time: Option<Instant>,
    elapsed: Duration,
}

impl PerfTimer {
    /// Create a timer, and start it.
    pub fn new_started() -> Self {
        Self {
            start_time: Some(Instant::now()),
            elapsed: Duration::new(0, 0),
        }
    }

    /// Create a timer, but don't start it.
    pub fn new_stopped() -> Self {
        Self {
            start_time: None,
            elapsed: Duration::new(0, 0),
        }
    }

    /// Start the timer, which must not already be running.
    pub fn start(&mut self) {
        debug_assert!(self.start_time.is_none());
        self.start_time = Some(Instant::now());
    }

    /// Stop the timer, which must already be running.
    pub fn stop(&mut self) {
        debug_assert!(self.start_time.is_some());
        if let Some(t) = self.start_time.take() {
            self.elapsed += Instant::now().duration_since(t)
        }
    }

    /// Total time elapsed while the timer has been running.
    pub fn elapsed(&self) -> Duration {
        let mut e = self.elapsed;
        if let Some(t) = self.start_time.as_ref() {
            e += Instant::now().duration_since(*t)
        }
        e
    }
}

impl Default for PerfTimer {
    fn default() -> Self {
        Self::new_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_timer_accumulates_nothing() {
        let timer = PerfTimer::new_stopped();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_start_stop_accumulates() {
        let mut timer = PerfTimer::new_started();
        std::thread::sleep(Duration::from_millis(5));
        timer.stop();
        let frozen = timer.elapsed();
        assert!(frozen >= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.elapsed(), frozen);
    }
}
