//! Typed calls against the engine's REST API.
//!
//! # Purpose
//!
//! Wraps [`RestClient`] with the engine's endpoint layout
//! (`{base}/{version}/{resource}/{id}/{sub-resource}[/{index}]`) and a running gate:
//! nothing but [`EngineApi::connect`] is sent until the engine has acknowledged a start.
//!
//! # Endpoints
//!
//! | Method | Path                               | Call                  |
//! |--------|------------------------------------|-----------------------|
//! | PATCH  | `/system/start`                    | `connect`             |
//! | PATCH  | `/system/end`                      | `disconnect`          |
//! | GET    | `/system/active`                   | `active_clients`      |
//! | GET    | `/system/imageformats`             | `image_formats`       |
//! | GET    | `/system/processingunit`           | `processing_unit`     |
//! | POST   | `/sbsar`                           | `add_resource`        |
//! | DELETE | `/sbsar/{id}`                      | `remove_resource`     |
//! | POST   | `/sbsar/{id}/duplicate`            | `duplicate_resource`  |
//! | GET    | `/sbsar/{id}/parameters`           | `parameters`          |
//! | PATCH  | `/sbsar/{id}/parameter/{pid}`      | `update_parameter`    |
//! | GET    | `/sbsar/{id}/outputs`              | `outputs`             |
//! | PATCH  | `/sbsar/{id}/output/{oid}`         | `set_output_format`   |
//! | GET    | `/sbsar/{id}/graphsinfo`           | `graphs_info`         |
//! | GET    | `/sbsar/{id}/presets`              | `presets`             |
//! | PATCH  | `/sbsar/{id}/preset/{graph}`       | `load_preset`         |
//! | GET    | `/sbsar/{id}/embeddedpresets/{g}`  | `embedded_presets`    |
//! | PATCH  | `/sbsar/{id}/render/{graph}`       | `render`              |

use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::{RenderJob, RenderTrigger, RequestMode};
use crate::rest::{ResponseCode, RestClient, RestOutcome, RestRequest, Verb};

const RESOURCE: &str = "sbsar";
const OUTPUT_FORMAT: &str = "tga";

/// Engine REST API
pub struct EngineApi {
    client: RestClient,
    base: String,
    load_timeout: Duration,
    running: AtomicBool,
}

impl EngineApi {
    /// `base` is `{host}:{port}/{version}`, e.g. `http://127.0.0.1:41646/v1`
    pub fn new(client: RestClient, base: impl Into<String>, load_timeout: Duration) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            load_timeout,
            running: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========== System ==========

    /// Announce this process to the engine. Opens the running gate on success.
    pub fn connect(&self, pid: u32) -> Result<(), ResponseCode> {
        let req = self
            .client
            .request(Verb::Patch, self.url("system/start"))
            .body(json!({ "pid": pid }));
        let outcome = self.client.sync_request(&req);
        if outcome.is_success() {
            self.running.store(true, Ordering::SeqCst);
            info!("Engine connected at {}", self.base);
            Ok(())
        } else {
            error!("{} Engine start failed", outcome.code);
            Err(outcome.code)
        }
    }

    /// Best-effort goodbye: async, connection errors ignored. Closes the gate.
    pub fn disconnect(&self, pid: u32) -> ResponseCode {
        if !self.running.swap(false, Ordering::SeqCst) {
            return ResponseCode::EngineNotRunning;
        }
        let req = self
            .client
            .request(Verb::Patch, self.url("system/end"))
            .body(json!({ "pid": pid }))
            .ignore_connection_error(true);
        let code = self.client.async_request(req);
        debug!("Engine disconnect sent: {}", code);
        code
    }

    /// Number of host processes attached to the engine
    pub fn active_clients(&self) -> Result<i64, ResponseCode> {
        let value = self.get_field("system/active", "active")?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or(ResponseCode::ResponseJsonError)
    }

    pub fn image_formats(&self) -> Result<Value, ResponseCode> {
        self.get_field("system/imageformats", "supportedformats")
    }

    pub fn processing_unit(&self) -> Result<Value, ResponseCode> {
        self.get_field("system/processingunit", "processingunit")
    }

    // ========== Resources ==========

    /// Load a resource file into the engine. Renders for it are pushed to `render_callback`.
    pub fn add_resource(&self, path: &str, render_callback: &str) -> Result<String, ResponseCode> {
        self.ensure_running()?;
        let req = self
            .client
            .request(Verb::Post, self.url(RESOURCE))
            .timeout(self.load_timeout)
            .body(json!({
                "path": path,
                "renderCallback": render_callback,
                "format": OUTPUT_FORMAT,
            }));
        Self::id_field(&self.checked(self.client.sync_request(&req))?)
    }

    pub fn remove_resource(&self, id: &str) -> Result<(), ResponseCode> {
        self.ensure_running()?;
        let req = self.client.request(Verb::Delete, self.resource_url(id, ""));
        self.checked(self.client.sync_request(&req)).map(|_| ())
    }

    pub fn duplicate_resource(&self, id: &str) -> Result<String, ResponseCode> {
        self.ensure_running()?;
        let req = self.client.request(Verb::Post, self.resource_url(id, "duplicate"));
        Self::id_field(&self.checked(self.client.sync_request(&req))?)
    }

    pub fn parameters(&self, id: &str) -> Result<Value, ResponseCode> {
        self.resource_field(id, "parameters", "parameters")
    }

    pub fn outputs(&self, id: &str) -> Result<Value, ResponseCode> {
        self.resource_field(id, "outputs", "outputs")
    }

    pub fn graphs_info(&self, id: &str) -> Result<Value, ResponseCode> {
        self.resource_field(id, "graphsinfo", "graphsinfo")
    }

    pub fn presets(&self, id: &str) -> Result<Value, ResponseCode> {
        self.resource_field(id, "presets", "presets")
    }

    pub fn embedded_presets(&self, id: &str, graph_index: u32) -> Result<Value, ResponseCode> {
        self.resource_field(id, &format!("embeddedpresets/{}", graph_index), "embeddedpresets")
    }

    // ========== Mutations ==========

    /// Set one parameter. Booleans go over the wire as 0/1.
    pub fn update_parameter(
        &self,
        id: &str,
        param_id: &str,
        value: &Value,
        mode: RequestMode,
    ) -> Result<Option<RestOutcome>, ResponseCode> {
        let value = match value {
            Value::Bool(b) => json!(*b as i32),
            other => other.clone(),
        };
        let req = self
            .client
            .request(Verb::Patch, self.resource_url(id, &format!("parameter/{}", param_id)))
            .body(json!({ "value": value }));
        self.send(req, mode)
    }

    pub fn set_output_format(
        &self,
        id: &str,
        output_id: &str,
        format: &Value,
        mode: RequestMode,
    ) -> Result<Option<RestOutcome>, ResponseCode> {
        let req = self
            .client
            .request(Verb::Patch, self.resource_url(id, &format!("output/{}", output_id)))
            .body(json!({ "resultFormat": format }));
        self.send(req, mode)
    }

    pub fn load_preset(
        &self,
        id: &str,
        graph_index: u32,
        preset: &Value,
        mode: RequestMode,
    ) -> Result<Option<RestOutcome>, ResponseCode> {
        let req = self
            .client
            .request(Verb::Patch, self.resource_url(id, &format!("preset/{}", graph_index)))
            .body(json!({ "preset": preset }));
        self.send(req, mode)
    }

    /// Ask the engine to render one graph. Completion arrives as a push.
    pub fn render(&self, id: &str, graph_index: u32, mode: RequestMode) -> Result<Option<RestOutcome>, ResponseCode> {
        let req = self
            .client
            .request(Verb::Patch, self.resource_url(id, &format!("render/{}", graph_index)));
        self.send(req, mode)
    }

    /// Adapt [`EngineApi::render`] into a coordinator trigger
    pub fn render_trigger(self: &Arc<Self>) -> RenderTrigger {
        let engine = Arc::clone(self);
        Arc::new(move |job: &RenderJob| {
            engine
                .render(&job.resource_id, job.graph_index, job.mode)
                .map(|_| ())
                .inspect_err(|code| warn!("{} Render request for {} failed", code, job.key))
        })
    }

    // ========== Helpers ==========

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn resource_url(&self, id: &str, sub: &str) -> String {
        if sub.is_empty() {
            format!("{}/{}/{}", self.base, RESOURCE, id)
        } else {
            format!("{}/{}/{}/{}", self.base, RESOURCE, id, sub)
        }
    }

    fn ensure_running(&self) -> Result<(), ResponseCode> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ResponseCode::EngineNotRunning)
        }
    }

    fn checked(&self, outcome: RestOutcome) -> Result<RestOutcome, ResponseCode> {
        if outcome.is_success() { Ok(outcome) } else { Err(outcome.code) }
    }

    /// Sync: wait and check. Async: fire and report acceptance only.
    fn send(&self, req: RestRequest, mode: RequestMode) -> Result<Option<RestOutcome>, ResponseCode> {
        self.ensure_running()?;
        match mode {
            RequestMode::Sync => self.checked(self.client.sync_request(&req)).map(Some),
            RequestMode::Async => match self.client.async_request(req) {
                ResponseCode::Accepted => Ok(None),
                code => Err(code),
            },
        }
    }

    fn get_field(&self, path: &str, key: &str) -> Result<Value, ResponseCode> {
        self.ensure_running()?;
        let req = self.client.request(Verb::Get, self.url(path));
        self.checked(self.client.sync_request(&req))?.json_field(key)
    }

    fn resource_field(&self, id: &str, sub: &str, key: &str) -> Result<Value, ResponseCode> {
        self.ensure_running()?;
        let req = self.client.request(Verb::Get, self.resource_url(id, sub));
        self.checked(self.client.sync_request(&req))?.json_field(key)
    }

    fn id_field(outcome: &RestOutcome) -> Result<String, ResponseCode> {
        match outcome.json_field("id")? {
            Value::String(id) => Ok(id),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(ResponseCode::ResponseJsonError),
        }
    }
}
