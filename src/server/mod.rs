//! Local push server the engine calls back into.
//!
//! # Purpose
//!
//! Renders finish asynchronously inside the engine. The engine reports completion
//! by POSTing a JSON payload to the callback URI handed over at resource load time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐   POST {id, outputs}   ┌──────────────────────┐
//! │  Engine process     │  ───────────────────▶  │  LocalListener       │
//! │                     │                        │  (rouille thread)    │
//! └─────────────────────┘                        └──────────┬───────────┘
//!                                                           │ notify(Post)
//!                                                ┌──────────▼───────────┐
//!                                                │  RenderDelivery      │
//!                                                │  move outputs        │
//!                                                │  coordinator.finish  │
//!                                                └──────────────────────┘
//! ```
//!
//! # Dependencies
//!
//! - `rouille` - HTTP server
//! - `serde_json` - payload parsing
//!
//! # Used by
//!
//! - `session.rs` - starts the listener and registers [`RenderDelivery`]
//!
//! # Endpoints
//!
//! | Method | Path | Description                       |
//! |--------|------|-----------------------------------|
//! | HEAD   | any  | Liveness check                    |
//! | GET    | any  | Forwarded to `get` listeners      |
//! | POST   | any  | Render result, JSON body          |
//! | PATCH  | any  | Acknowledged, ignored             |

mod delivery;
mod listener;

pub use delivery::{RenderDelivery, relocate_outputs};
pub use listener::{ALLOWED_HOSTS, ListenerRegistry, LocalListener, PushKind, PushListener, is_allowed_host};
