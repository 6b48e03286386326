//! Local push listener using rouille.
//!
//! # Purpose
//!
//! The engine cannot call into the host directly, so the host opens a small HTTP
//! server on `127.0.0.1` (ephemeral port) and tells the engine to push there.
//!
//! # Request handling
//!
//! | Method | Effect                                              |
//! |--------|-----------------------------------------------------|
//! | HEAD   | 200                                                 |
//! | GET    | notify `get` listeners with the path, 200           |
//! | PATCH  | 200                                                 |
//! | POST   | parse JSON body, notify `post` listeners, 200       |
//!
//! Only requests whose `Host` header names `127.0.0.1` or `localhost` are handled.
//! This is a weak trust boundary, not authentication. Other hosts get a bare 403 only
//! because rouille must answer every request; callers should treat it as "no response".
//!
//! # Thread safety
//!
//! - rouille runs handlers on its own pool; listeners must be `Send + Sync`
//! - The registry is snapshotted per notification, so listeners may (un)register
//!   from inside `execute`

use log::{debug, error, info, trace, warn};
use rouille::{Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, mpsc};
use std::thread::JoinHandle;

use crate::rest::ResponseCode;

/// Hosts accepted in the `Host` header
pub const ALLOWED_HOSTS: [&str; 2] = ["127.0.0.1", "localhost"];

/// Push category a listener subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    Head,
    Get,
    Post,
    Patch,
}

/// Receives pushes from the engine
pub trait PushListener: Send + Sync {
    fn execute(&self, payload: &Value);
}

/// Ordered listener lists per push kind. Clones share the lists.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    lists: Arc<RwLock<HashMap<PushKind, Vec<Arc<dyn PushListener>>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: PushKind, listener: Arc<dyn PushListener>) {
        self.lists
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Remove `listener` (by identity) from `kind`
    pub fn remove(&self, kind: PushKind, listener: &Arc<dyn PushListener>) -> Result<(), ResponseCode> {
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        let list = lists.get_mut(&kind).ok_or(ResponseCode::ListenerRemoveError)?;
        let index = list
            .iter()
            .position(|l| Arc::ptr_eq(l, listener))
            .ok_or(ResponseCode::ListenerRemoveError)?;
        list.remove(index);
        Ok(())
    }

    /// Call every listener of `kind`, in registration order
    pub fn notify(&self, kind: PushKind, payload: &Value) {
        let snapshot: Vec<Arc<dyn PushListener>> = self
            .lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        trace!("Notifying {} {:?} listener(s)", snapshot.len(), kind);
        for listener in snapshot {
            listener.execute(payload);
        }
    }

    pub fn count(&self, kind: PushKind) -> usize {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

struct Running {
    port: u16,
    handle: JoinHandle<()>,
    stop: mpsc::Sender<()>,
}

/// Local HTTP listener for engine pushes
pub struct LocalListener {
    host: String,
    registry: ListenerRegistry,
    running: Option<Running>,
}

impl LocalListener {
    pub fn new(host: impl Into<String>, registry: ListenerRegistry) -> Self {
        Self {
            host: host.into(),
            registry,
            running: None,
        }
    }

    /// Bind an ephemeral port and start serving. Returns the port.
    pub fn start(&mut self) -> Result<u16, ResponseCode> {
        if self.running.is_some() {
            return Err(ResponseCode::ServerAlreadyRunning);
        }

        let registry = self.registry.clone();
        let server = rouille::Server::new((self.host.as_str(), 0), move |request| {
            Self::handle_request(request, &registry)
        })
        .map_err(|e| {
            error!("Listener failed to bind {}: {}", self.host, e);
            ResponseCode::ServerStartError
        })?;

        let port = server.server_addr().port();
        let (handle, stop) = server.stoppable();
        info!("Listener started on http://{}:{}", self.host, port);
        self.running = Some(Running { port, handle, stop });
        Ok(port)
    }

    pub fn stop(&mut self) -> Result<(), ResponseCode> {
        let running = self.running.take().ok_or(ResponseCode::ServerNotRunning)?;
        // Send fails only if the server thread already exited
        let _ = running.stop.send(());
        running.handle.join().map_err(|_| {
            error!("Listener thread panicked");
            ResponseCode::ServerStopError
        })?;
        info!("Listener on port {} stopped", running.port);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    /// URI the engine should push renders to
    pub fn callback_uri(&self) -> Option<String> {
        self.port().map(|port| format!("http://{}:{}", self.host, port))
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    fn handle_request(request: &Request, registry: &ListenerRegistry) -> Response {
        if !is_allowed_host(request.header("Host")) {
            debug!("Rejected push with Host {:?}", request.header("Host"));
            // rouille has to answer something; no body, no listener sees it
            return Response::empty_400().with_status_code(403);
        }

        match request.method() {
            "HEAD" | "PATCH" => Response::text(""),
            "GET" => {
                registry.notify(PushKind::Get, &Value::String(request.url()));
                Response::text("")
            }
            "POST" => match rouille::input::json_input::<Value>(request) {
                Ok(payload) => {
                    registry.notify(PushKind::Post, &payload);
                    Response::text("")
                }
                Err(e) => {
                    warn!("Push with unreadable body: {}", e);
                    Response::empty_400()
                }
            },
            other => {
                debug!("Unsupported push method {}", other);
                Response::empty_400().with_status_code(405)
            }
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop();
        }
    }
}

/// `Host` header check (port ignored)
pub fn is_allowed_host(header: Option<&str>) -> bool {
    header
        .and_then(|h| h.split(':').next())
        .map(|host| ALLOWED_HOSTS.contains(&host))
        .unwrap_or(false)
}
