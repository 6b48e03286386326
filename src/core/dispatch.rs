//! Dispatch queue - the only way background threads touch host-owned state.
//!
//! Any thread may [`schedule`](DispatchQueue::schedule) a closure. The privileged
//! thread (the one that created the queue, normally the host's main loop) calls
//! [`drain`](DispatchQueue::drain) on every tick and runs whatever is queued, in order.
//!
//! A task scheduled while a drain is running is picked up by that same drain.
//! A panicking task is logged and skipped; the rest of the pass still runs.

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{error, trace, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    owner: ThreadId,
}

/// Cross-thread hand-off to the privileged thread. Clones share one queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

impl DispatchQueue {
    /// Create a queue owned by the calling thread.
    pub fn new() -> Self {
        Self::with_owner(thread::current().id())
    }

    /// Create a queue owned by an explicit thread.
    pub fn with_owner(owner: ThreadId) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(Inner { sender, receiver, owner }),
        }
    }

    /// True when called on the privileged thread
    pub fn is_privileged(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    /// Queue a task for the privileged thread. Never blocks.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The queue owns a receiver, so the channel cannot be disconnected here
        if let Err(e) = self.inner.sender.send(Box::new(task)) {
            error!("Failed to enqueue dispatch task: {}", e);
        }
    }

    /// Run `task` now if on the privileged thread, otherwise queue it as a continuation.
    pub fn on_privileged<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_privileged() {
            task();
        } else {
            self.schedule(task);
        }
    }

    /// Run queued tasks until the queue is observed empty. Returns how many ran.
    pub fn drain(&self) -> usize {
        if !self.is_privileged() {
            warn!("DispatchQueue::drain called off the privileged thread, ignored");
            return 0;
        }

        let mut executed = 0;
        while let Ok(task) = self.inner.receiver.try_recv() {
            executed += 1;
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Dispatch task panicked, continuing with the next one");
            }
        }
        if executed > 0 {
            trace!("Dispatch drain ran {} task(s)", executed);
        }
        executed
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.inner.receiver.len()
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo_order() {
        let queue = DispatchQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.schedule(move || log.lock().unwrap().push(i));
        }
        assert_eq!(queue.pending(), 5);
        assert_eq!(queue.drain(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn test_tasks_scheduled_during_drain_run_in_same_pass() {
        let queue = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let c = Arc::clone(&counter);
        queue.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c = Arc::clone(&c);
            q.schedule(move || {
                c.fetch_add(10, Ordering::SeqCst);
            });
        });

        assert_eq!(queue.drain(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_schedule_from_background_thread() {
        let queue = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = queue.clone();
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    q.schedule(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Nothing ran on the background threads
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.drain(), 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_drain_refused_off_privileged_thread() {
        let queue = DispatchQueue::new();
        queue.schedule(|| {});

        let q = queue.clone();
        let ran = thread::spawn(move || q.drain()).join().unwrap();
        assert_eq!(ran, 0);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_panicking_task_does_not_abort_drain() {
        let queue = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.schedule(|| panic!("task failure"));
        let c = Arc::clone(&counter);
        queue.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(queue.drain(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_privileged_runs_inline_or_defers() {
        let queue = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        queue.on_privileged(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let q = queue.clone();
        let c = Arc::clone(&counter);
        thread::spawn(move || {
            q.on_privileged(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
