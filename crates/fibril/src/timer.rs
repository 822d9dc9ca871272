//! Wall-clock time and interval timers on the monotonic clock

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed on the monotonic clock since the first call in this process
pub fn wtime() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Interval timer
///
/// A timer records a start and a stop instant; `read` reports the interval
/// between them in seconds.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    start: Option<Instant>,
    stop: Option<Instant>,
}

impl Timer {
    /// Create a timer that has not been started
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start instant
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.stop = None;
    }

    /// Record the stop instant
    pub fn stop(&mut self) {
        self.stop = Some(Instant::now());
    }

    /// Interval between start and stop, in seconds
    ///
    /// Zero if the timer was never started. A running timer reads up to now.
    pub fn read(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Stop the timer and return the interval
    pub fn stop_and_read(&mut self) -> f64 {
        self.stop();
        self.read()
    }

    /// Stop the timer and add the interval to `acc`
    pub fn stop_and_add(&mut self, acc: &mut f64) {
        *acc += self.stop_and_read();
    }

    /// Interval as a [`Duration`]
    pub fn elapsed(&self) -> Duration {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Measured cost of a start/stop pair, in seconds
    pub fn overhead() -> f64 {
        const ROUNDS: u32 = 64;
        let mut timer = Timer::new();
        let mut total = 0.0;
        for _ in 0..ROUNDS {
            timer.start();
            timer.stop_and_add(&mut total);
        }
        total / f64::from(ROUNDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wtime_is_monotonic() {
        let a = wtime();
        let b = wtime();
        assert!(b >= a);
    }

    #[test]
    fn test_timer_reads_interval() {
        let mut timer = Timer::new();
        assert_eq!(timer.read(), 0.0);

        timer.start();
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.stop_and_read();
        assert!(elapsed >= 0.005);

        // Stopped timers do not keep counting
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(timer.read(), elapsed);
    }

    #[test]
    fn test_timer_accumulates() {
        let mut timer = Timer::new();
        let mut acc = 0.0;
        for _ in 0..3 {
            timer.start();
            timer.stop_and_add(&mut acc);
        }
        assert!(acc >= 0.0);
        assert!(Timer::overhead() >= 0.0);
    }
}
