//! Per-path throttling for forwarded events.
//!
//! Throttling keeps bursts of writes to one file (editor auto-save, log
//! appends) from flooding the consumer: the first event for a path passes,
//! further events for that path are dropped until the interval has elapsed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Once the map holds this many paths, expired entries are pruned on insert.
const PRUNE_THRESHOLD: usize = 1024;

/// Leading-edge throttle keyed by path.
///
/// Owned by a single pipeline; the lock only guards against the pipeline
/// being shared between the dispatcher and a registration in progress.
#[derive(Debug)]
pub struct Throttle {
    /// Forwarded events: path -> time it was last let through.
    last_forwarded: Mutex<HashMap<PathBuf, Instant>>,
    /// Minimum spacing between two forwarded events for one path.
    interval: Duration,
}

impl Throttle {
    /// Create a throttle with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            last_forwarded: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a throttle with the interval given in milliseconds.
    pub fn from_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// Decide whether an event for `path` may pass, recording it if so.
    pub fn allow(&self, path: &Path) -> bool {
        self.allow_at(path, Instant::now())
    }

    fn allow_at(&self, path: &Path, now: Instant) -> bool {
        let mut last_forwarded = self.last_forwarded.lock();

        if let Some(last) = last_forwarded.get(path) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }

        if last_forwarded.len() >= PRUNE_THRESHOLD {
            let interval = self.interval;
            last_forwarded.retain(|_, last| now.duration_since(*last) < interval);
        }

        last_forwarded.insert(path.to_path_buf(), now);
        true
    }

    /// Number of paths currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.last_forwarded.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_throttle_leading_edge() {
        let throttle = Throttle::from_millis(1000);
        let path = Path::new("/test/main.go");

        assert!(throttle.allow(path));
        // Immediately after, the same path is held back
        assert!(!throttle.allow(path));
    }

    #[test]
    fn test_throttle_independent_paths() {
        let throttle = Throttle::from_millis(1000);

        assert!(throttle.allow(Path::new("/test/main.go")));
        assert!(throttle.allow(Path::new("/test/main.c")));
        assert!(!throttle.allow(Path::new("/test/main.go")));
    }

    #[test]
    fn test_throttle_reopens_after_interval() {
        let throttle = Throttle::from_millis(50);
        let path = Path::new("/test/file.rs");

        assert!(throttle.allow(path));
        assert!(!throttle.allow(path));

        // Wait for the interval to elapse
        sleep(Duration::from_millis(60));

        assert!(throttle.allow(path));
    }

    #[test]
    fn test_throttle_prunes_expired_entries() {
        let throttle = Throttle::from_millis(10);
        let start = Instant::now();

        for i in 0..PRUNE_THRESHOLD {
            assert!(throttle.allow_at(&PathBuf::from(format!("/f{i}")), start));
        }
        assert_eq!(throttle.tracked_count(), PRUNE_THRESHOLD);

        // Everything recorded at `start` has expired by now
        let later = start + Duration::from_millis(20);
        assert!(throttle.allow_at(Path::new("/fresh"), later));
        assert_eq!(throttle.tracked_count(), 1);
    }
}
