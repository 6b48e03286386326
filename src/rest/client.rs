//! Blocking REST client with retry and throttled fire-and-forget requests.
//!
//! # Purpose
//!
//! Talks to the external engine over local HTTP. Two execution modes:
//!
//! - [`RestClient::sync_request`] - runs on the caller's thread, returns a [`RestOutcome`]
//! - [`RestClient::async_request`] - returns [`ResponseCode::Accepted`] at once and runs the
//!   request on its own thread, launched no sooner than the throttle spacing after the
//!   previous async launch. Failures are logged only.
//!
//! Connection-level failures are retried with a fixed backoff; HTTP-level failures never are.
//!
//! # Dependencies
//!
//! - `ureq` - sync HTTP client (pairs with the sync `rouille` listener)

use log::{debug, error, trace, warn};
use serde_json::Value;
use std::backtrace::Backtrace;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::response::{ResponseCode, RestOutcome};

/// HTTP verbs the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }

    /// Statuses the engine uses to signal success for this verb
    pub fn accepts(self, status: u16) -> bool {
        match self {
            Verb::Post => status == 200 || status == 201,
            Verb::Delete | Verb::Put => status == 200,
            Verb::Patch | Verb::Get => status == 200 || status == 204,
        }
    }

    pub fn failure_code(self) -> ResponseCode {
        match self {
            Verb::Get => ResponseCode::RestGetError,
            Verb::Post => ResponseCode::RestPostError,
            Verb::Put => ResponseCode::RestPutError,
            Verb::Patch => ResponseCode::RestPatchError,
            Verb::Delete => ResponseCode::RestDeleteError,
        }
    }

    fn sends_body(self) -> bool {
        matches!(self, Verb::Post | Verb::Put | Verb::Patch)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-wide defaults
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Minimum spacing between async launches
    pub throttle: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
            throttle: Duration::from_millis(5),
        }
    }
}

/// One request. Build with [`RestClient::request`] to pick up client defaults.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub verb: Verb,
    pub endpoint: String,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub ignore_connection_error: bool,
}

impl RestRequest {
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn ignore_connection_error(mut self, ignore: bool) -> Self {
        self.ignore_connection_error = ignore;
        self
    }
}

enum Failure {
    Connection,
    Http,
    Unknown,
}

/// REST client. Cheap to clone; clones share the agent and the throttle clock.
#[derive(Clone)]
pub struct RestClient {
    agent: ureq::Agent,
    config: RestConfig,
    next_launch: Arc<Mutex<Instant>>,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            next_launch: Arc::new(Mutex::new(Instant::now())),
            config,
        }
    }

    /// Start a request with the client defaults
    pub fn request(&self, verb: Verb, endpoint: impl Into<String>) -> RestRequest {
        RestRequest {
            verb,
            endpoint: endpoint.into(),
            body: None,
            timeout: self.config.timeout,
            max_retries: self.config.max_retries,
            ignore_connection_error: false,
        }
    }

    /// Perform the request on this thread.
    ///
    /// Connection failures are retried up to `max_retries` times (so at most
    /// `max_retries + 1` attempts) unless `ignore_connection_error` is set, in which
    /// case the first one returns [`ResponseCode::RestIgnoreConnectionError`].
    pub fn sync_request(&self, req: &RestRequest) -> RestOutcome {
        let mut retries_left = req.max_retries;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match self.send_once(req) {
                Ok(response) => return Self::check_status(req, response, attempts),
                Err(ureq::Error::Status(status, response)) => {
                    // ureq turns 4xx/5xx into errors; the engine contract treats them
                    // like any other rejected status
                    return Self::check_status_code(req, status, response.into_string().ok(), attempts);
                }
                Err(ureq::Error::Transport(transport)) => transport,
            };

            match Self::classify(&err) {
                Failure::Connection => {
                    if req.ignore_connection_error {
                        debug!("Connection error ignored: {} {}", req.verb, req.endpoint);
                        return RestOutcome::failed(ResponseCode::RestIgnoreConnectionError, attempts);
                    }
                    if retries_left > 0 {
                        retries_left -= 1;
                        trace!(
                            "Connection error on {} {}, retrying ({} left)",
                            req.verb, req.endpoint, retries_left
                        );
                        thread::sleep(self.config.retry_backoff);
                        continue;
                    }
                    error!("Connection error, will not retry: {} {}: {:?}", req.verb, req.endpoint, err);
                    debug!("{}", Backtrace::capture());
                    return RestOutcome::failed(ResponseCode::RestConnectionError, attempts);
                }
                Failure::Http => {
                    error!("HTTP error occurred: {} {}: {:?}", req.verb, req.endpoint, err);
                    debug!("{}", Backtrace::capture());
                    return RestOutcome::failed(ResponseCode::RestHttpError, attempts);
                }
                Failure::Unknown => {
                    error!("Other error occurred: {} {}: {:?}", req.verb, req.endpoint, err);
                    debug!("{}", Backtrace::capture());
                    return RestOutcome::failed(ResponseCode::RestUnknownError, attempts);
                }
            }
        }
    }

    /// Fire and forget. Never blocks; the request runs on its own thread once its
    /// throttled launch time arrives.
    pub fn async_request(&self, req: RestRequest) -> ResponseCode {
        let delay = self.reserve_launch_slot();
        let client = self.clone();

        let spawned = thread::Builder::new()
            .name("render-link-rest".to_string())
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                let outcome = client.sync_request(&req);
                if !outcome.is_success() {
                    warn!("Threaded request failed {}: {} {}", outcome.code, req.verb, req.endpoint);
                }
            });

        match spawned {
            Ok(_) => ResponseCode::Accepted,
            Err(e) => {
                error!("Failed to spawn request thread: {}", e);
                ResponseCode::RestUnknownError
            }
        }
    }

    /// Book the next async launch time and return how long to wait for it.
    pub(crate) fn reserve_launch_slot(&self) -> Duration {
        let mut next = self.next_launch.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now > *next {
            *next = now + self.config.throttle;
            Duration::ZERO
        } else {
            let wait = *next - now;
            *next += self.config.throttle;
            wait
        }
    }

    fn send_once(&self, req: &RestRequest) -> Result<ureq::Response, ureq::Error> {
        let request = self
            .agent
            .request(req.verb.as_str(), &req.endpoint)
            .timeout(req.timeout);

        if req.verb.sends_body() {
            match &req.body {
                Some(body) => request.send_json(body),
                None => request.send_json(serde_json::json!({})),
            }
        } else {
            request.call()
        }
    }

    fn check_status(req: &RestRequest, response: ureq::Response, attempts: u32) -> RestOutcome {
        let status = response.status();
        let body = match response.into_string() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to read response body from {}: {}", req.endpoint, e);
                None
            }
        };
        Self::check_status_code(req, status, body, attempts)
    }

    fn check_status_code(req: &RestRequest, status: u16, body: Option<String>, attempts: u32) -> RestOutcome {
        let code = if req.verb.accepts(status) {
            ResponseCode::Success
        } else {
            error!("Error: {} on {} {}", status, req.verb, req.endpoint);
            req.verb.failure_code()
        };
        RestOutcome { code, status: Some(status), body, attempts }
    }

    fn classify(err: &ureq::Transport) -> Failure {
        use ureq::ErrorKind;
        match err.kind() {
            ErrorKind::Io if Self::is_timeout(err) => Failure::Unknown,
            ErrorKind::ConnectionFailed | ErrorKind::Dns | ErrorKind::Io => Failure::Connection,
            ErrorKind::InvalidUrl
            | ErrorKind::UnknownScheme
            | ErrorKind::BadStatus
            | ErrorKind::BadHeader
            | ErrorKind::TooManyRedirects
            | ErrorKind::HTTP => Failure::Http,
            _ => Failure::Unknown,
        }
    }

    fn is_timeout(err: &ureq::Transport) -> bool {
        std::error::Error::source(err)
            .and_then(|source| source.downcast_ref::<std::io::Error>())
            .map(|io| matches!(io.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouille::{Request, Response};
    use std::net::TcpListener;

    fn test_client(throttle_ms: u64) -> RestClient {
        RestClient::new(RestConfig {
            timeout: Duration::from_secs(2),
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
            throttle: Duration::from_millis(throttle_ms),
        })
    }

    /// A port nothing listens on
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn serve<F>(handler: F) -> (u16, std::sync::mpsc::Sender<()>)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let server = rouille::Server::new("127.0.0.1:0", handler).unwrap();
        let port = server.server_addr().port();
        let (_handle, stop) = server.stoppable();
        (port, stop)
    }

    fn status_server() -> (u16, std::sync::mpsc::Sender<()>) {
        serve(|request| {
            let status: u16 = request
                .url()
                .trim_start_matches('/')
                .parse()
                .unwrap_or(500);
            if status == 204 {
                Response::empty_204()
            } else {
                Response::text(r#"{"id": "7"}"#).with_status_code(status)
            }
        })
    }

    #[test]
    fn test_verb_success_table() {
        assert!(Verb::Post.accepts(201));
        assert!(!Verb::Put.accepts(201));
        assert!(Verb::Patch.accepts(204));
        assert!(Verb::Get.accepts(204));
        assert!(!Verb::Delete.accepts(204));
        assert_eq!(Verb::Delete.failure_code(), ResponseCode::RestDeleteError);
    }

    #[test]
    fn test_sync_request_status_mapping() {
        let (port, stop) = status_server();
        let client = test_client(5);
        let url = |status: u16| format!("http://127.0.0.1:{}/{}", port, status);

        let out = client.sync_request(&client.request(Verb::Post, url(201)));
        assert_eq!(out.code, ResponseCode::Success);
        assert_eq!(out.json_field("id").unwrap(), serde_json::json!("7"));

        let out = client.sync_request(&client.request(Verb::Patch, url(204)));
        assert_eq!(out.code, ResponseCode::Success);

        let out = client.sync_request(&client.request(Verb::Get, url(201)));
        assert_eq!(out.code, ResponseCode::RestGetError);
        assert_eq!(out.status, Some(201));

        let out = client.sync_request(&client.request(Verb::Delete, url(404)));
        assert_eq!(out.code, ResponseCode::RestDeleteError);
        assert_eq!(out.status, Some(404));
        assert_eq!(out.attempts, 1);

        let _ = stop.send(());
    }

    #[test]
    fn test_connection_error_retries_then_fails() {
        let client = test_client(5);
        let url = format!("http://127.0.0.1:{}/v1/system/active", closed_port());
        let out = client.sync_request(&client.request(Verb::Get, url).max_retries(2));
        assert_eq!(out.code, ResponseCode::RestConnectionError);
        assert_eq!(out.attempts, 3);
    }

    #[test]
    fn test_connection_error_ignored_without_retry() {
        let client = test_client(5);
        let url = format!("http://127.0.0.1:{}/v1/system/end", closed_port());
        let req = client
            .request(Verb::Patch, url)
            .max_retries(3)
            .ignore_connection_error(true);
        let out = client.sync_request(&req);
        assert_eq!(out.code, ResponseCode::RestIgnoreConnectionError);
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_launch_slots_are_spaced() {
        let client = test_client(50);
        let first = client.reserve_launch_slot();
        let second = client.reserve_launch_slot();
        let third = client.reserve_launch_slot();

        assert_eq!(first, Duration::ZERO);
        assert!(second > Duration::from_millis(40) && second <= Duration::from_millis(50));
        assert!(third > Duration::from_millis(90) && third <= Duration::from_millis(100));
    }

    #[test]
    fn test_async_requests_accepted_immediately_and_throttled() {
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&arrivals);
        let (port, stop) = serve(move |_request| {
            recorded.lock().unwrap().push(Instant::now());
            Response::empty_204()
        });

        let client = test_client(60);
        let started = Instant::now();
        for _ in 0..4 {
            let req = client.request(Verb::Patch, format!("http://127.0.0.1:{}/render", port));
            assert_eq!(client.async_request(req), ResponseCode::Accepted);
        }
        assert!(started.elapsed() < Duration::from_millis(60));

        let deadline = Instant::now() + Duration::from_secs(5);
        while arrivals.lock().unwrap().len() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let mut times = arrivals.lock().unwrap().clone();
        assert_eq!(times.len(), 4);
        times.sort();
        // Launches are booked 60ms apart; allow some scheduling jitter
        assert!(times[3] - times[0] >= Duration::from_millis(150));
        assert!(times[0] - started < Duration::from_millis(500));

        let _ = stop.send(());
    }
}
