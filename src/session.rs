//! Render session - one explicit service object owning every coordinator piece.
//!
//! # Purpose
//!
//! Wires the dispatch queue, busy indicator, REST client, engine API, push listener,
//! render coordinator and parameter debouncer together. Created on the privileged
//! thread, which must then call [`RenderSession::tick`] regularly.
//!
//! # Parameter routing
//!
//! ```text
//!  discrete edit (selection, toggle, image, resolution)
//!      └─▶ update parameter (sync) ─▶ submit render (async)
//!  continuous edit (slider, angle, color, ...)
//!      └─▶ debounce per job key ─▶ same as above, last value only
//! ```
//!
//! # Used by
//!
//! - `main.rs` - CLI host loop

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;
use crate::core::{
    BusyIndicator, Debouncer, DispatchQueue, IndicatorDisplay, JobKey, RenderCoordinator, RenderJob,
    RenderSink, RequestMode, SubmitOutcome,
};
use crate::engine::EngineApi;
use crate::rest::RestClient;
use crate::server::{ListenerRegistry, LocalListener, PushKind, PushListener, RenderDelivery};

/// Kind of control that produced a parameter edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Selection,
    Toggle,
    Image,
    Resolution,
    Slider,
    Angle,
    Color,
    Other,
}

impl EditKind {
    /// Discrete edits are applied immediately, the rest are debounced
    pub fn is_discrete(self) -> bool {
        matches!(
            self,
            EditKind::Selection | EditKind::Toggle | EditKind::Image | EditKind::Resolution
        )
    }
}

/// One parameter change coming from the host UI
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEdit {
    pub resource_id: String,
    pub graph_index: u32,
    pub param_id: String,
    pub value: Value,
    pub kind: EditKind,
}

impl ParamEdit {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.resource_id, self.graph_index)
    }
}

/// Sends a parameter update, then asks for a fresh render
struct ParamApplier {
    engine: Arc<EngineApi>,
    coordinator: RenderCoordinator,
}

impl ParamApplier {
    fn apply(&self, edit: &ParamEdit) {
        if let Err(code) = self
            .engine
            .update_parameter(&edit.resource_id, &edit.param_id, &edit.value, RequestMode::Sync)
        {
            warn!("{} Parameter {} update on {} failed", code, edit.param_id, edit.resource_id);
            return;
        }
        let job = RenderJob::new(edit.resource_id.clone(), edit.graph_index, RequestMode::Async);
        self.coordinator.submit(job, self.engine.render_trigger());
    }
}

/// Render coordination service
pub struct RenderSession {
    config: Config,
    dispatch: DispatchQueue,
    busy: BusyIndicator,
    engine: Arc<EngineApi>,
    coordinator: RenderCoordinator,
    debouncer: Debouncer,
    applier: Arc<ParamApplier>,
    listener: LocalListener,
    delivery: Arc<dyn PushListener>,
}

impl RenderSession {
    /// Must be called on the thread that will call [`RenderSession::tick`]
    pub fn new(config: Config, display: Arc<dyn IndicatorDisplay>, sink: Arc<dyn RenderSink>) -> Self {
        let dispatch = DispatchQueue::new();
        let busy = BusyIndicator::new(dispatch.clone(), display);
        let client = RestClient::new(config.rest_config());
        let engine = Arc::new(EngineApi::new(client, config.engine_base(), config.load_timeout()));
        let coordinator = RenderCoordinator::new(dispatch.clone(), sink, config.render_timeout());
        let debouncer = Debouncer::new(config.debounce_delay());
        let applier = Arc::new(ParamApplier {
            engine: Arc::clone(&engine),
            coordinator: coordinator.clone(),
        });
        let listener = LocalListener::new(config.listener_host.clone(), ListenerRegistry::new());
        let delivery: Arc<dyn PushListener> = Arc::new(RenderDelivery::new(config.output_dir(), coordinator.clone()));

        Self {
            config,
            dispatch,
            busy,
            engine,
            coordinator,
            debouncer,
            applier,
            listener,
            delivery,
        }
    }

    /// Start the push listener and register render delivery. Optionally connect the engine.
    /// Returns the listener port.
    pub fn start(&mut self, connect: bool) -> Result<u16> {
        let port = self.listener.start().context("Failed to start push listener")?;
        self.listener
            .registry()
            .add(PushKind::Post, Arc::clone(&self.delivery));
        info!(
            "Session started: listener {}, outputs to {}",
            port,
            self.config.output_dir().display()
        );

        if connect {
            let _busy = self.busy.scope("Connecting to engine");
            self.engine
                .connect(std::process::id())
                .with_context(|| format!("Engine at {} did not accept start", self.engine.base()))?;
        }
        Ok(port)
    }

    /// Run queued privileged-thread work. Returns the number of tasks run.
    pub fn tick(&self) -> usize {
        self.dispatch.drain()
    }

    /// Load a resource file into the engine with renders pushed back to this session
    pub fn load_resource(&self, path: &str) -> Result<String> {
        let uri = self
            .listener
            .callback_uri()
            .context("Push listener is not running")?;
        let _busy = self.busy.scope("Loading resource");
        let id = self
            .engine
            .add_resource(path, &uri)
            .with_context(|| format!("Failed to load {}", path))?;
        info!("Loaded {} as resource {}", path, id);
        Ok(id)
    }

    pub fn submit_render(&self, resource_id: &str, graph_index: u32, mode: RequestMode) -> SubmitOutcome {
        let job = RenderJob::new(resource_id, graph_index, mode);
        self.coordinator.submit(job, self.engine.render_trigger())
    }

    /// Route a parameter edit: discrete now, continuous after the debounce delay
    pub fn apply_parameter(&self, edit: ParamEdit) {
        if edit.kind.is_discrete() {
            self.applier.apply(&edit);
            return;
        }
        let key = edit.key();
        let applier = Arc::clone(&self.applier);
        self.debouncer.schedule(&key, edit, move |edit| applier.apply(&edit));
    }

    pub fn coordinator(&self) -> &RenderCoordinator {
        &self.coordinator
    }

    pub fn engine(&self) -> &Arc<EngineApi> {
        &self.engine
    }

    pub fn listener_port(&self) -> Option<u16> {
        self.listener.port()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancel timers, forget pending renders, say goodbye to the engine and stop listening
    pub fn shutdown(&mut self) {
        self.debouncer.cancel_all();
        self.coordinator.shutdown();

        if self.engine.is_running() {
            self.engine.disconnect(std::process::id());
        }

        if self.listener.is_running() {
            if let Err(code) = self.listener.registry().remove(PushKind::Post, &self.delivery) {
                debug!("{} Delivery listener was not registered", code);
            }
            if let Err(code) = self.listener.stop() {
                warn!("{} Push listener did not stop cleanly", code);
            }
        }

        let ran = self.dispatch.drain();
        info!("Session shut down ({} final task(s))", ran);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RenderStatus;
    use crate::rest::ResponseCode;
    use rouille::{Request, Response};
    use serde_json::json;
    use std::io::Read;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct NullDisplay;

    impl IndicatorDisplay for NullDisplay {
        fn show(&self, _name: &str) {}
        fn restore_default(&self) {}
    }

    #[derive(Default)]
    struct Sink {
        payloads: Mutex<Vec<Value>>,
        statuses: Mutex<Vec<(String, RenderStatus)>>,
    }

    impl RenderSink for Sink {
        fn set_status(&self, resource_id: &str, status: RenderStatus) {
            self.statuses.lock().unwrap().push((resource_id.to_string(), status));
        }
        fn deliver(&self, payload: &Value) {
            self.payloads.lock().unwrap().push(payload.clone());
        }
    }

    /// (method, path, body) per request
    type Seen = Arc<Mutex<Vec<(String, String, String)>>>;

    fn fake_engine() -> (u16, Seen, std::sync::mpsc::Sender<()>) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let server = rouille::Server::new("127.0.0.1:0", move |request: &Request| {
            let mut body = String::new();
            if let Some(mut data) = request.data() {
                let _ = data.read_to_string(&mut body);
            }
            s.lock()
                .unwrap()
                .push((request.method().to_string(), request.url(), body));
            Response::text("{}")
        })
        .unwrap();
        let port = server.server_addr().port();
        let (_handle, stop) = server.stoppable();
        (port, seen, stop)
    }

    fn config(engine_port: u16) -> Config {
        Config {
            engine_port,
            rest_max_retries: 0,
            rest_timeout_ms: 2_000,
            debounce_ms: 50,
            render_timeout_ms: 0,
            output_dir: Some(std::env::temp_dir().join(format!("render-link-session-{}", uuid::Uuid::new_v4()))),
            ..Config::default()
        }
    }

    fn count(seen: &Seen, method: &str, prefix: &str) -> usize {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| m == method && p.starts_with(prefix))
            .count()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn edit(kind: EditKind, value: Value) -> ParamEdit {
        ParamEdit {
            resource_id: "4".into(),
            graph_index: 0,
            param_id: "9".into(),
            value,
            kind,
        }
    }

    #[test]
    fn test_edit_kinds() {
        assert!(EditKind::Selection.is_discrete());
        assert!(EditKind::Toggle.is_discrete());
        assert!(EditKind::Image.is_discrete());
        assert!(EditKind::Resolution.is_discrete());
        assert!(!EditKind::Slider.is_discrete());
        assert!(!EditKind::Color.is_discrete());
        assert_eq!(edit(EditKind::Slider, json!(1)).key(), JobKey::new("4", 0));
    }

    #[test]
    fn test_discrete_edit_applies_now() {
        let (port, seen, stop) = fake_engine();
        let mut session = RenderSession::new(config(port), Arc::new(NullDisplay), Arc::new(Sink::default()));
        session.start(true).unwrap();

        session.apply_parameter(edit(EditKind::Toggle, json!(true)));
        // Update is synchronous
        assert_eq!(count(&seen, "PATCH", "/v1/sbsar/4/parameter/9"), 1);
        assert_eq!(session.coordinator().current(), Some(JobKey::new("4", 0)));

        session.shutdown();
        let _ = stop.send(());
    }

    #[test]
    fn test_continuous_edits_debounced() {
        let (port, seen, stop) = fake_engine();
        let mut session = RenderSession::new(config(port), Arc::new(NullDisplay), Arc::new(Sink::default()));
        session.start(true).unwrap();

        for v in 0..5 {
            session.apply_parameter(edit(EditKind::Slider, json!(v)));
        }
        assert_eq!(count(&seen, "PATCH", "/v1/sbsar/4/parameter/9"), 0);

        wait_until(|| count(&seen, "PATCH", "/v1/sbsar/4/render/0") == 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count(&seen, "PATCH", "/v1/sbsar/4/parameter/9"), 1);
        assert_eq!(count(&seen, "PATCH", "/v1/sbsar/4/render/0"), 1);

        session.shutdown();
        let _ = stop.send(());
    }

    #[test]
    fn test_debounced_edit_queues_behind_busy_slot() {
        let (port, seen, stop) = fake_engine();
        let mut session = RenderSession::new(config(port), Arc::new(NullDisplay), Arc::new(Sink::default()));
        session.start(true).unwrap();

        assert_eq!(session.submit_render("X", 0, RequestMode::Async), SubmitOutcome::Started);
        for v in 1..=5 {
            session.apply_parameter(edit(EditKind::Slider, json!(v)));
        }

        wait_until(|| session.coordinator().backlog() == vec![JobKey::new("4", 0)]);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(session.coordinator().current(), Some(JobKey::new("X", 0)));
        assert_eq!(session.coordinator().backlog(), vec![JobKey::new("4", 0)]);
        assert_eq!(count(&seen, "PATCH", "/v1/sbsar/4/render/0"), 0);

        let updates: Vec<Value> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| m == "PATCH" && p == "/v1/sbsar/4/parameter/9")
            .map(|(_, _, body)| serde_json::from_str(body).unwrap())
            .collect();
        assert_eq!(updates, vec![json!({"value": 5})]);

        session.shutdown();
        let _ = stop.send(());
    }

    #[test]
    fn test_unconnected_engine_does_not_block_queue() {
        let sink = Arc::new(Sink::default());
        let session = RenderSession::new(Config::default(), Arc::new(NullDisplay), sink.clone());

        assert_eq!(
            session.submit_render("A", 0, RequestMode::Async),
            SubmitOutcome::Rejected(ResponseCode::EngineNotRunning)
        );
        assert_eq!(
            session.submit_render("B", 0, RequestMode::Async),
            SubmitOutcome::Rejected(ResponseCode::EngineNotRunning)
        );
        assert!(session.coordinator().is_idle());
        assert!(session.coordinator().backlog().is_empty());

        session.tick();
        let statuses = sink.statuses.lock().unwrap().clone();
        assert!(statuses.contains(&("A".to_string(), RenderStatus::Failed)));
        assert!(statuses.contains(&("B".to_string(), RenderStatus::Failed)));
    }

    #[test]
    fn test_push_completes_render() {
        let (port, _seen, stop) = fake_engine();
        let sink = Arc::new(Sink::default());
        let mut session = RenderSession::new(config(port), Arc::new(NullDisplay), sink.clone());
        let listener_port = session.start(true).unwrap();

        assert_eq!(session.submit_render("4", 0, RequestMode::Async), SubmitOutcome::Started);
        assert_eq!(session.submit_render("5", 0, RequestMode::Async), SubmitOutcome::Queued);

        ureq::post(&format!("http://127.0.0.1:{}/", listener_port))
            .send_json(json!({"id": "4", "outputs": []}))
            .unwrap();

        assert_eq!(session.coordinator().current(), Some(JobKey::new("5", 0)));
        session.tick();
        assert_eq!(*sink.payloads.lock().unwrap(), vec![json!({"id": "4", "outputs": []})]);
        assert!(
            sink.statuses
                .lock()
                .unwrap()
                .contains(&("4".to_string(), RenderStatus::Finished))
        );

        session.shutdown();
        assert!(session.coordinator().is_idle());
        assert!(session.listener_port().is_none());
        assert!(!session.engine().is_running());
        let _ = stop.send(());
    }

    #[test]
    fn test_start_fails_when_engine_absent() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut session = RenderSession::new(config(closed), Arc::new(NullDisplay), Arc::new(Sink::default()));
        assert!(session.start(true).is_err());
        assert!(!session.engine().is_running());
        // Listener came up before the connect attempt
        assert!(session.listener_port().is_some());
        session.shutdown();
    }

    #[test]
    fn test_load_requires_listener() {
        let session = RenderSession::new(Config::default(), Arc::new(NullDisplay), Arc::new(Sink::default()));
        assert!(session.load_resource("/tmp/x.sbsar").is_err());
    }
}
