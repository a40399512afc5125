//! Label cardinality tracking.
//!
//! Remembers every distinct value seen per label key and warns once when a
//! key first exceeds the configured threshold. The map only grows; keeping
//! label values few is the operator's job, this just makes violations visible.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

/// Callback receiving `(label_key, unique_values, threshold)`.
pub type CardinalityWarningHandler = Arc<dyn Fn(&str, usize, usize) + Send + Sync>;

/// Shared tracker of distinct label values.
pub struct CardinalityTracker {
    threshold: usize,
    seen: Mutex<HashMap<String, HashSet<String>>>,
    on_warning: Option<CardinalityWarningHandler>,
}

impl CardinalityTracker {
    /// Create a tracker warning when a label exceeds `threshold` distinct
    /// values. A threshold of 0 disables tracking.
    pub fn new(threshold: usize, on_warning: Option<CardinalityWarningHandler>) -> Self {
        Self {
            threshold,
            seen: Mutex::new(HashMap::new()),
            on_warning,
        }
    }

    /// Whether tracking is active.
    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Record one observation of `key=value`.
    pub fn track(&self, key: &str, value: &str) {
        if !self.is_enabled() {
            return;
        }

        let crossed = {
            let mut seen = self.seen.lock();
            let values = seen.entry(key.to_owned()).or_default();

            if values.contains(value) {
                return;
            }
            values.insert(value.to_owned());

            // Only the transition threshold -> threshold + 1 warns.
            (values.len() == self.threshold + 1).then_some(values.len())
        };

        if let Some(unique) = crossed {
            if let Some(handler) = &self.on_warning {
                handler(key, unique, self.threshold);
            }
        }
    }

    /// Number of distinct values recorded for `key`.
    pub fn unique_values(&self, key: &str) -> usize {
        self.seen.lock().get(key).map_or(0, HashSet::len)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl std::fmt::Debug for CardinalityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardinalityTracker")
            .field("threshold", &self.threshold)
            .field("keys", &self.seen.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_tracker(threshold: usize) -> (CardinalityTracker, Arc<Mutex<Vec<(String, usize, usize)>>>) {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = warnings.clone();
        let tracker = CardinalityTracker::new(
            threshold,
            Some(Arc::new(move |key: &str, unique: usize, threshold: usize| {
                sink.lock().push((key.to_string(), unique, threshold));
            })),
        );
        (tracker, warnings)
    }

    #[test]
    fn test_warns_once_on_crossing() {
        let (tracker, warnings) = counting_tracker(3);

        for i in 0..3 {
            tracker.track("user", &format!("u{}", i));
        }
        assert!(warnings.lock().is_empty());

        tracker.track("user", "u3");
        assert_eq!(*warnings.lock(), vec![("user".to_string(), 4, 3)]);

        for i in 4..13 {
            tracker.track("user", &format!("u{}", i));
        }
        assert_eq!(warnings.lock().len(), 1);
        assert_eq!(tracker.unique_values("user"), 13);
    }

    #[test]
    fn test_repeated_values_not_counted() {
        let (tracker, warnings) = counting_tracker(2);
        for _ in 0..100 {
            tracker.track("env", "prod");
            tracker.track("env", "dev");
        }
        assert_eq!(tracker.unique_values("env"), 2);
        assert!(warnings.lock().is_empty());
    }

    #[test]
    fn test_keys_tracked_independently() {
        let (tracker, warnings) = counting_tracker(1);
        tracker.track("a", "1");
        tracker.track("b", "1");
        tracker.track("a", "2");
        tracker.track("b", "2");

        let warnings = warnings.lock();
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].0, "a");
        assert_eq!(warnings[1].0, "b");
    }

    #[test]
    fn test_disabled_tracker() {
        let (tracker, warnings) = counting_tracker(0);
        assert!(!tracker.is_enabled());
        for i in 0..50 {
            tracker.track("id", &i.to_string());
        }
        assert_eq!(tracker.unique_values("id"), 0);
        assert!(warnings.lock().is_empty());
    }

    #[test]
    fn test_concurrent_tracking_warns_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let tracker = Arc::new(CardinalityTracker::new(
            10,
            Some(Arc::new(move |_: &str, _: usize, _: usize| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        ));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        tracker.track("request_id", &format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.unique_values("request_id"), 100);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
