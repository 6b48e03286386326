//! Core coordination primitives - dispatch, busy indicator, debounce, render slot
//!
//! These modules know nothing about HTTP; the engine and server layers plug into them.

pub mod busy;
pub mod debounce;
pub mod dispatch;
pub mod render;
pub mod timer;

// Re-exports for convenience
pub use busy::{BusyGuard, BusyIndicator, IndicatorDisplay};
pub use debounce::Debouncer;
pub use dispatch::DispatchQueue;
pub use render::{
    JobKey, RenderCoordinator, RenderJob, RenderSink, RenderStatus, RenderTrigger, RequestMode, SubmitOutcome,
};
pub use timer::{TimerHandle, spawn_timer};
