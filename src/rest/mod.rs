//! REST client for the external engine.
//!
//! - `client` - sync/async requests, retry, throttle
//! - `response` - response codes and outcomes

mod client;
mod response;

pub use client::{RestClient, RestConfig, RestRequest, Verb};
pub use response::{ResponseCode, RestOutcome};
