//! Debounced parameter updates - one delayed update per job key.
//!
//! When a continuous control (slider, angle, color) is dragged, every step would
//! otherwise send a parameter update and a render. Instead:
//! 1. Each edit cancels the pending timer for its key and schedules a new one
//! 2. When the delay elapses with no newer edit, the callback runs with the latest args
//!
//! Earlier edits are dropped, never executed (last write wins).

use log::{error, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::render::JobKey;
use super::timer::{TimerHandle, spawn_timer};

struct Pending {
    id: u64,
    timer: TimerHandle,
}

type PendingMap = Arc<Mutex<HashMap<JobKey, Pending>>>;

/// Per-key debounce timers. Clones share the timer map.
///
/// # Usage
/// ```ignore
/// // On every slider step:
/// debouncer.schedule(&key, edit, move |edit| applier.apply(edit));
/// ```
#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Replace any pending update for `key` with `callback(args)` after the delay.
    ///
    /// The callback runs on the timer thread, after the timer has removed itself
    /// from the map and with no lock held.
    pub fn schedule<A, F>(&self, key: &JobKey, args: A, callback: F)
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = pending.remove(key) {
            trace!("Debounce: superseding pending update for {}", key);
            previous.timer.cancel();
        }

        let map = Arc::clone(&self.pending);
        let fire_key = key.clone();
        let fire = move || {
            let still_current = {
                let mut pending = map.lock().unwrap_or_else(PoisonError::into_inner);
                match pending.get(&fire_key) {
                    Some(entry) if entry.id == id => {
                        pending.remove(&fire_key);
                        true
                    }
                    _ => false,
                }
            };
            if still_current {
                trace!("Debounce: firing update for {}", fire_key);
                callback(args);
            }
        };

        match spawn_timer("debounce", self.delay, fire) {
            Ok(timer) => {
                pending.insert(key.clone(), Pending { id, timer });
            }
            Err(e) => error!("Failed to spawn debounce timer for {}: {}", key, e),
        }
    }

    /// Drop the pending update for `key`. Returns true if one was pending.
    pub fn cancel(&self, key: &JobKey) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some(entry) => {
                entry.timer.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.timer.cancel();
        }
    }

    pub fn is_pending(&self, key: &JobKey) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn() -> Box<dyn FnOnce(i32) + Send>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let make = move || {
            let f = Arc::clone(&f);
            Box::new(move |v: i32| f.lock().unwrap().push(v)) as Box<dyn FnOnce(i32) + Send>
        };
        (fired, make)
    }

    #[test]
    fn test_immediate_no_trigger() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let (fired, cb) = recorder();
        let key = JobKey::new("res", 0);

        debouncer.schedule(&key, 1, cb());
        assert!(debouncer.is_pending(&key));
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rapid_edits_collapse_to_last() {
        let debouncer = Debouncer::new(Duration::from_millis(60));
        let (fired, cb) = recorder();
        let key = JobKey::new("res", 0);

        for v in 1..=5 {
            debouncer.schedule(&key, v, cb());
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(200));

        assert_eq!(*fired.lock().unwrap(), vec![5]);
        assert!(!debouncer.is_pending(&key));
    }

    #[test]
    fn test_keys_are_independent() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let (fired, cb) = recorder();

        debouncer.schedule(&JobKey::new("a", 0), 1, cb());
        debouncer.schedule(&JobKey::new("b", 0), 2, cb());
        assert_eq!(debouncer.pending_count(), 2);
        thread::sleep(Duration::from_millis(150));

        let mut values = fired.lock().unwrap().clone();
        values.sort();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[test]
    fn test_cancel_drops_update() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let (fired, cb) = recorder();
        let key = JobKey::new("res", 1);

        debouncer.schedule(&key, 1, cb());
        assert!(debouncer.cancel(&key));
        assert!(!debouncer.cancel(&key));
        thread::sleep(Duration::from_millis(100));
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let (fired, cb) = recorder();

        debouncer.schedule(&JobKey::new("a", 0), 1, cb());
        debouncer.schedule(&JobKey::new("b", 0), 2, cb());
        debouncer.cancel_all();
        thread::sleep(Duration::from_millis(100));
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(debouncer.pending_count(), 0);
    }
}
