//! Response codes and REST outcomes.
//!
//! # Key types
//!
//! - [`ResponseCode`] - every result the link can report, with a stable numeric value
//! - [`RestOutcome`] - the `(status, response)` pair returned by a synchronous request
//!
//! # Used by
//!
//! - `rest/client.rs` - builds outcomes
//! - `engine.rs` - extracts JSON fields from outcomes
//! - `server/listener.rs` - start/stop/remove errors

use serde_json::Value;

/// Result codes shared by the REST client, the engine API and the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    ServerStartError,
    ServerStopError,
    ListenerRemoveError,
    RestPostError,
    RestDeleteError,
    RestPutError,
    RestPatchError,
    RestGetError,
    RestHttpError,
    RestConnectionError,
    RestIgnoreConnectionError,
    RestUnknownError,
    ResponseJsonKeyError,
    ResponseJsonError,
    ServerAlreadyRunning,
    ServerNotRunning,
    EngineNotRunning,
    /// Async request accepted; the result is never reported back
    Accepted,
}

impl ResponseCode {
    /// Numeric value used in log lines (`[-16] ...`)
    pub fn value(self) -> i32 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::ServerStartError => -1,
            ResponseCode::ServerStopError => -2,
            ResponseCode::ListenerRemoveError => -6,
            ResponseCode::RestPostError => -9,
            ResponseCode::RestDeleteError => -10,
            ResponseCode::RestPutError => -11,
            ResponseCode::RestPatchError => -12,
            ResponseCode::RestGetError => -13,
            ResponseCode::RestHttpError => -15,
            ResponseCode::RestConnectionError => -16,
            ResponseCode::RestIgnoreConnectionError => -17,
            ResponseCode::RestUnknownError => -18,
            ResponseCode::ResponseJsonKeyError => -33,
            ResponseCode::ResponseJsonError => -35,
            ResponseCode::ServerAlreadyRunning => -52,
            ResponseCode::ServerNotRunning => -53,
            ResponseCode::EngineNotRunning => -25,
            ResponseCode::Accepted => 1,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResponseCode::Success | ResponseCode::Accepted)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ResponseCode::Success => "success",
            ResponseCode::ServerStartError => "listener failed to start",
            ResponseCode::ServerStopError => "listener failed to stop",
            ResponseCode::ListenerRemoveError => "listener not registered",
            ResponseCode::RestPostError => "POST rejected by engine",
            ResponseCode::RestDeleteError => "DELETE rejected by engine",
            ResponseCode::RestPutError => "PUT rejected by engine",
            ResponseCode::RestPatchError => "PATCH rejected by engine",
            ResponseCode::RestGetError => "GET rejected by engine",
            ResponseCode::RestHttpError => "HTTP protocol error",
            ResponseCode::RestConnectionError => "connection error",
            ResponseCode::RestIgnoreConnectionError => "connection error ignored",
            ResponseCode::RestUnknownError => "unknown request error",
            ResponseCode::ResponseJsonKeyError => "response is missing the expected key",
            ResponseCode::ResponseJsonError => "response is not valid JSON",
            ResponseCode::ServerAlreadyRunning => "listener already running",
            ResponseCode::ServerNotRunning => "listener not running",
            ResponseCode::EngineNotRunning => "engine not running",
            ResponseCode::Accepted => "accepted",
        };
        write!(f, "[{}] {}", self.value(), text)
    }
}

impl std::error::Error for ResponseCode {}

/// Outcome of one synchronous request (after retries).
#[derive(Debug, Clone)]
pub struct RestOutcome {
    pub code: ResponseCode,
    /// HTTP status, when the engine answered at all
    pub status: Option<u16>,
    /// Raw response body
    pub body: Option<String>,
    /// Number of times the request hit the wire
    pub attempts: u32,
}

impl RestOutcome {
    pub fn failed(code: ResponseCode, attempts: u32) -> Self {
        Self { code, status: None, body: None, attempts }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }

    /// Parse the body and pull out `key`.
    pub fn json_field(&self, key: &str) -> Result<Value, ResponseCode> {
        let body = self.body.as_deref().unwrap_or("");
        let parsed: Value = serde_json::from_str(body).map_err(|_| ResponseCode::ResponseJsonError)?;
        match parsed.get(key) {
            Some(value) => Ok(value.clone()),
            None => Err(ResponseCode::ResponseJsonKeyError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(body: &str) -> RestOutcome {
        RestOutcome {
            code: ResponseCode::Success,
            status: Some(200),
            body: Some(body.to_string()),
            attempts: 1,
        }
    }

    #[test]
    fn test_json_field_present() {
        let out = outcome(r#"{"id": "abc", "other": 1}"#);
        assert_eq!(out.json_field("id").unwrap(), Value::String("abc".into()));
    }

    #[test]
    fn test_json_field_missing_key() {
        let out = outcome(r#"{"other": 1}"#);
        assert_eq!(out.json_field("id"), Err(ResponseCode::ResponseJsonKeyError));
    }

    #[test]
    fn test_json_field_bad_body() {
        assert_eq!(outcome("not json").json_field("id"), Err(ResponseCode::ResponseJsonError));
        let empty = RestOutcome::failed(ResponseCode::Success, 1);
        assert_eq!(empty.json_field("id"), Err(ResponseCode::ResponseJsonError));
    }

    #[test]
    fn test_accepted_counts_as_success() {
        assert!(ResponseCode::Accepted.is_success());
        assert!(!ResponseCode::RestConnectionError.is_success());
        assert_eq!(ResponseCode::RestConnectionError.to_string(), "[-16] connection error");
    }
}
