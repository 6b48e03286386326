//! render-link - render coordination between a host and a local material engine
//!
//! Re-exports all modules for use by the binary target.

// Coordination primitives (dispatch, busy, debounce, render slot)
pub mod core;

// Engine communication
pub mod engine;
pub mod rest;
pub mod server;

// App modules
pub mod cli;
pub mod config;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use crate::core::{BusyIndicator, DispatchQueue, IndicatorDisplay, RenderCoordinator, RenderSink, RenderStatus};
pub use engine::EngineApi;
pub use rest::{ResponseCode, RestClient, RestOutcome};
pub use session::{EditKind, ParamEdit, RenderSession};
