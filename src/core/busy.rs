//! Busy indicator with approximate reference counting.
//!
//! `push(name)` shows `name`; if something was already showing, `name` is also queued
//! so a later `pop()` has a label to fall back to. `pop()` re-shows the *oldest*
//! queued label, or restores the default indicator once nothing is queued.
//! Nesting order of the displayed label is not strict LIFO; only the final restore is
//! guaranteed.
//!
//! Both calls are safe from any thread: off the privileged thread they are
//! re-dispatched through the [`DispatchQueue`].

use crossbeam::queue::SegQueue;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::dispatch::DispatchQueue;

/// Host side of the indicator (cursor, spinner, status label...)
pub trait IndicatorDisplay: Send + Sync {
    fn show(&self, name: &str);
    fn restore_default(&self);
}

struct State {
    display: Arc<dyn IndicatorDisplay>,
    outstanding: SegQueue<String>,
    active: AtomicBool,
}

/// Busy-indicator stack. Clones share state.
#[derive(Clone)]
pub struct BusyIndicator {
    queue: DispatchQueue,
    state: Arc<State>,
}

impl BusyIndicator {
    pub fn new(queue: DispatchQueue, display: Arc<dyn IndicatorDisplay>) -> Self {
        Self {
            queue,
            state: Arc::new(State {
                display,
                outstanding: SegQueue::new(),
                active: AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, name: impl Into<String>) {
        let name = name.into();
        let state = Arc::clone(&self.state);
        self.queue.on_privileged(move || Self::push_now(&state, name));
    }

    pub fn pop(&self) {
        let state = Arc::clone(&self.state);
        self.queue.on_privileged(move || Self::pop_now(&state));
    }

    /// Push now, pop when the guard drops
    pub fn scope(&self, name: impl Into<String>) -> BusyGuard {
        self.push(name);
        BusyGuard { indicator: self.clone() }
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    fn push_now(state: &State, name: String) {
        trace!("Busy push: {}", name);
        state.display.show(&name);
        if state.active.load(Ordering::SeqCst) {
            state.outstanding.push(name);
        }
        state.active.store(true, Ordering::SeqCst);
    }

    fn pop_now(state: &State) {
        match state.outstanding.pop() {
            Some(name) => {
                trace!("Busy pop, still showing: {}", name);
                state.display.show(&name);
            }
            None => {
                trace!("Busy pop, restoring default");
                state.active.store(false, Ordering::SeqCst);
                state.display.restore_default();
            }
        }
    }
}

/// Pops its indicator on drop
pub struct BusyGuard {
    indicator: BusyIndicator,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.indicator.pop();
    }
}
