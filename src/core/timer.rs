//! One-shot timer threads that can be cancelled before they fire.
//!
//! The timer thread waits on a channel with a timeout. A message (or the handle being
//! dropped) cancels it; the timeout firing runs the callback on the timer thread.

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::trace;
use std::io;
use std::thread;
use std::time::Duration;

/// Cancels the timer when told to or when dropped
#[derive(Debug)]
pub struct TimerHandle {
    cancel: Sender<()>,
}

impl TimerHandle {
    pub fn cancel(self) {
        let _ = self.cancel.try_send(());
    }
}

/// Run `callback` on a new thread after `delay`, unless cancelled first.
pub fn spawn_timer<F>(name: &str, delay: Duration, callback: F) -> io::Result<TimerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = bounded::<()>(1);
    let label = name.to_string();

    thread::Builder::new()
        .name(format!("render-link-{}", name))
        .spawn(move || match rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => callback(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => trace!("Timer {} cancelled", label),
        })?;

    Ok(TimerHandle { cancel: tx })
}
