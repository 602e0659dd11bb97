use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Sliding-window request limiter keyed by an arbitrary string (a client
/// address, or a single shared key for upstream traffic).
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max: usize,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            window,
            max: max.max(1),
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(max: usize) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    /// Records a hit for `key` if the window has room. Returns the remaining
    /// budget on success, or how long to wait before the oldest hit leaves
    /// the window.
    pub fn try_acquire(&self, key: &str, now: Instant) -> Result<usize, Duration> {
        let mut hits = self.hits.lock();
        let queue = hits.entry(key.to_string()).or_default();
        while let Some(front) = queue.front() {
            if now.saturating_duration_since(*front) >= self.window {
                queue.pop_front();
            } else {
                break;
            }
        }
        if queue.len() >= self.max {
            let oldest = queue.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.saturating_duration_since(oldest)));
        }
        queue.push_back(now);
        Ok(self.max - queue.len())
    }

    /// Blocks the current thread until `key` has room. Only call from
    /// blocking contexts.
    pub fn acquire_blocking(&self, key: &str) {
        loop {
            match self.try_acquire(key, Instant::now()) {
                Ok(_) => return,
                Err(wait) => {
                    tracing::debug!(key, wait_ms = wait.as_millis() as u64, "rate limit reached");
                    std::thread::sleep(wait.max(Duration::from_millis(10)));
                }
            }
        }
    }

    /// Drops keys whose every hit has left the window.
    pub fn prune(&self, now: Instant) {
        let window = self.window;
        self.hits.lock().retain(|_, queue| {
            queue
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) < window)
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.hits.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_the_window_is_full() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.try_acquire("a", start), Ok(1));
        assert_eq!(limiter.try_acquire("a", start + Duration::from_secs(1)), Ok(0));
        let wait = limiter
            .try_acquire("a", start + Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(wait, Duration::from_secs(50));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.try_acquire("a", now).is_ok());
        assert!(limiter.try_acquire("b", now).is_ok());
        assert!(limiter.try_acquire("a", now).is_err());
    }

    #[test]
    fn old_hits_leave_the_window() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.try_acquire("a", start).is_ok());
        assert!(
            limiter
                .try_acquire("a", start + Duration::from_secs(60))
                .is_ok()
        );
    }

    #[test]
    fn prune_forgets_idle_keys() {
        let limiter = SlidingWindow::new(5, Duration::from_secs(60));
        let start = Instant::now();
        limiter.try_acquire("a", start).unwrap();
        limiter
            .try_acquire("b", start + Duration::from_secs(30))
            .unwrap();
        limiter.prune(start + Duration::from_secs(61));
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
