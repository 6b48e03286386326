//! Render coordinator - single-flight render slot with a FIFO backlog.
//!
//! # Purpose
//!
//! The engine renders one graph at a time. The coordinator makes sure at most one
//! render request is in flight, queues further requests in submission order, and
//! starts the next one as soon as the engine reports completion.
//!
//! # State machine
//!
//! ```text
//!  IDLE --submit(k)--> BUSY(k)         trigger(k) is sent to the engine
//!  BUSY(k) --submit(k | queued)-->     no-op
//!  BUSY(k) --submit(j)-->              j appended to backlog
//!  BUSY(k) --finish/expire-->          BUSY(oldest backlog) or IDLE
//!  BUSY(k) --trigger(k) fails-->       same as expire, status Failed
//! ```
//!
//! Promotion from the backlog happens under the same lock that clears the slot, so no
//! other submission can slip in between.
//!
//! Each started job arms a watchdog. If the engine never calls back, the job expires
//! after the configured deadline and the backlog keeps moving. A trigger that fails
//! outright frees the slot immediately.
//!
//! # Thread safety
//!
//! - Slot + backlog live behind one mutex; triggers run after it is released
//! - Host-visible effects (status tags, payload delivery) go through the [`DispatchQueue`]

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::dispatch::DispatchQueue;
use super::timer::{TimerHandle, spawn_timer};
use crate::rest::ResponseCode;

/// Identifies one render target: resource id + graph index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(resource_id: &str, graph_index: u32) -> Self {
        Self(format!("{}_{}", resource_id, graph_index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the engine call is made on the calling thread or fired off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    Sync,
    Async,
}

/// A render the engine should perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub key: JobKey,
    pub resource_id: String,
    pub graph_index: u32,
    pub mode: RequestMode,
}

impl RenderJob {
    pub fn new(resource_id: impl Into<String>, graph_index: u32, mode: RequestMode) -> Self {
        let resource_id = resource_id.into();
        Self {
            key: JobKey::new(&resource_id, graph_index),
            resource_id,
            graph_index,
            mode,
        }
    }
}

/// Sends the render request to the engine. `Err` means nothing reached the engine.
pub type RenderTrigger = Arc<dyn Fn(&RenderJob) -> Result<(), ResponseCode> + Send + Sync>;

/// Status tag shown next to a resource in the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Rendering,
    Finished,
    Expired,
    /// The render request never reached the engine
    Failed,
}

/// Host side of the coordinator. Always called on the privileged thread.
pub trait RenderSink: Send + Sync {
    fn set_status(&self, resource_id: &str, status: RenderStatus);
    fn deliver(&self, payload: &Value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Slot was idle; the trigger has been called
    Started,
    /// Appended to the backlog
    Queued,
    /// Key already current or queued; nothing changed
    AlreadyPending,
    /// Slot was idle but the trigger failed; the slot is idle again
    Rejected(ResponseCode),
}

struct PendingRequest {
    job: RenderJob,
    trigger: RenderTrigger,
}

/// A job that has just taken the slot and still has to be triggered
struct Launch {
    request: PendingRequest,
    generation: u64,
}

struct ActiveJob {
    job: RenderJob,
    generation: u64,
    started: Instant,
    watchdog: Option<TimerHandle>,
}

#[derive(Default)]
struct SlotState {
    current: Option<ActiveJob>,
    backlog: IndexMap<JobKey, PendingRequest>,
    generation: u64,
}

struct Inner {
    state: Mutex<SlotState>,
    dispatch: DispatchQueue,
    sink: Arc<dyn RenderSink>,
    job_timeout: Option<Duration>,
}

/// Outcome of clearing the slot
struct Completion {
    finished: Option<ActiveJob>,
    promoted: Option<Launch>,
}

/// Single-flight render coordinator. Clones share the slot.
#[derive(Clone)]
pub struct RenderCoordinator {
    inner: Arc<Inner>,
}

impl RenderCoordinator {
    /// `job_timeout` of `None` disables the watchdog.
    pub fn new(dispatch: DispatchQueue, sink: Arc<dyn RenderSink>, job_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SlotState::default()),
                dispatch,
                sink,
                job_timeout,
            }),
        }
    }

    /// Request a render. Only an idle slot actually reaches the engine.
    pub fn submit(&self, job: RenderJob, trigger: RenderTrigger) -> SubmitOutcome {
        let resource_id = job.resource_id.clone();
        let (mut outcome, to_trigger) = {
            let mut state = self.lock();
            let busy_with = state.current.as_ref().map(|active| active.job.key.clone());
            match busy_with {
                None => {
                    let started = self.occupy(&mut state, job, trigger);
                    (SubmitOutcome::Started, Some(started))
                }
                Some(current) if current == job.key || state.backlog.contains_key(&job.key) => {
                    debug!("Render {} already pending", job.key);
                    (SubmitOutcome::AlreadyPending, None)
                }
                Some(current) => {
                    debug!("Render {} queued behind {} ({} waiting)", job.key, current, state.backlog.len() + 1);
                    state.backlog.insert(job.key.clone(), PendingRequest { job, trigger });
                    (SubmitOutcome::Queued, None)
                }
            }
        };

        // Posted before triggering so a failure status lands after it
        let sink = Arc::clone(&self.inner.sink);
        self.inner
            .dispatch
            .schedule(move || sink.set_status(&resource_id, RenderStatus::Rendering));

        if let Some(launch) = to_trigger {
            if let Err(code) = self.launch(launch) {
                outcome = SubmitOutcome::Rejected(code);
            }
        }

        outcome
    }

    /// Engine reported a finished render: free the slot, start the next job and hand
    /// `payload` to the host on the privileged thread.
    pub fn finish(&self, payload: Value) -> Option<JobKey> {
        let completion = {
            let mut state = self.lock();
            self.complete(&mut state)
        };
        let finished = completion.finished.as_ref().map(|active| active.job.clone());
        if let Some(active) = &completion.finished {
            info!("Render {} finished in {:?}", active.job.key, active.started.elapsed());
        }
        self.start_promoted(completion);

        let sink = Arc::clone(&self.inner.sink);
        let finished_resource = finished.as_ref().map(|job| job.resource_id.clone());
        self.inner.dispatch.schedule(move || {
            sink.deliver(&payload);
            if let Some(resource_id) = finished_resource {
                sink.set_status(&resource_id, RenderStatus::Finished);
            }
        });

        finished.map(|job| job.key)
    }

    /// Current job key, if any
    pub fn current(&self) -> Option<JobKey> {
        self.lock().current.as_ref().map(|active| active.job.key.clone())
    }

    /// Backlog keys in promotion order
    pub fn backlog(&self) -> Vec<JobKey> {
        self.lock().backlog.keys().cloned().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().current.is_none()
    }

    /// True when a render for `resource_id` is in flight or queued
    pub fn is_rendering(&self, resource_id: &str) -> bool {
        let state = self.lock();
        state
            .current
            .as_ref()
            .is_some_and(|active| active.job.resource_id == resource_id)
            || state.backlog.values().any(|pending| pending.job.resource_id == resource_id)
    }

    /// Drop a queued request. The in-flight render cannot be recalled.
    pub fn cancel_queued(&self, key: &JobKey) -> bool {
        self.lock().backlog.shift_remove(key).is_some()
    }

    /// Forget everything: clear backlog and slot, disarm the watchdog.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        let dropped = state.backlog.len();
        state.backlog.clear();
        if let Some(active) = state.current.take() {
            if let Some(watchdog) = active.watchdog {
                watchdog.cancel();
            }
            debug!("Render coordinator shutdown with {} in flight", active.job.key);
        }
        if dropped > 0 {
            debug!("Render coordinator shutdown dropped {} queued request(s)", dropped);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `job` in the slot and arm its watchdog. Caller holds the lock.
    fn occupy(&self, state: &mut SlotState, job: RenderJob, trigger: RenderTrigger) -> Launch {
        state.generation += 1;
        let generation = state.generation;
        debug!("Render {} started", job.key);

        let watchdog = self.inner.job_timeout.and_then(|timeout| {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let spawned = spawn_timer("render-watchdog", timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    RenderCoordinator { inner }.expire(generation);
                }
            });
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to arm render watchdog for {}: {}", job.key, e);
                    None
                }
            }
        });

        state.current = Some(ActiveJob {
            job: job.clone(),
            generation,
            started: Instant::now(),
            watchdog,
        });
        Launch {
            request: PendingRequest { job, trigger },
            generation,
        }
    }

    /// Clear the slot and promote the oldest backlog entry into it. Caller holds the lock.
    fn complete(&self, state: &mut SlotState) -> Completion {
        let finished = state.current.take().map(|mut active| {
            if let Some(watchdog) = active.watchdog.take() {
                watchdog.cancel();
            }
            active
        });
        let promoted = state
            .backlog
            .shift_remove_index(0)
            .map(|(_, next)| self.occupy(state, next.job, next.trigger));
        Completion { finished, promoted }
    }

    fn start_promoted(&self, completion: Completion) {
        if let Some(next) = completion.promoted {
            let _ = self.launch(next);
        }
    }

    /// Trigger a job that holds the slot. While triggers fail, release the slot and
    /// move on to the next backlog entry. Returns the first job's trigger result.
    fn launch(&self, first: Launch) -> Result<(), ResponseCode> {
        let mut next = Some(first);
        let mut result = Ok(());
        let mut is_first = true;

        while let Some(launch) = next.take() {
            let outcome = (launch.request.trigger)(&launch.request.job);
            if is_first {
                result = outcome;
                is_first = false;
            }
            let Err(code) = outcome else { break };

            let job = launch.request.job;
            warn!("{} Render {} could not be sent, releasing the slot", code, job.key);
            let completion = {
                let mut state = self.lock();
                let still_current = state
                    .current
                    .as_ref()
                    .is_some_and(|active| active.generation == launch.generation);
                if !still_current {
                    // Finished, expired or shut down from inside the trigger
                    None
                } else {
                    Some(self.complete(&mut state))
                }
            };

            let sink = Arc::clone(&self.inner.sink);
            self.inner
                .dispatch
                .schedule(move || sink.set_status(&job.resource_id, RenderStatus::Failed));

            next = completion.and_then(|c| c.promoted);
        }
        result
    }

    /// Watchdog fired: give up on `generation` if it is still the current job.
    fn expire(&self, generation: u64) {
        let completion = {
            let mut state = self.lock();
            let still_current = state
                .current
                .as_ref()
                .is_some_and(|active| active.generation == generation);
            if !still_current {
                return;
            }
            self.complete(&mut state)
        };

        let expired = completion.finished.as_ref().map(|active| active.job.clone());
        if let Some(job) = &expired {
            warn!("Render {} expired without a response from the engine", job.key);
        }
        self.start_promoted(completion);

        if let Some(job) = expired {
            let sink = Arc::clone(&self.inner.sink);
            self.inner
                .dispatch
                .schedule(move || sink.set_status(&job.resource_id, RenderStatus::Expired));
        }
    }
}
