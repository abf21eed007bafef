//! HTTP transport abstraction.
//!
//! The engine never performs network I/O itself; it drives an
//! [`HttpTransport`] implementation supplied by the embedding application.
//! A scriptable [`MockTransport`] is provided for tests.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use url::Url;

/// HTTP method for a replication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET request.
    Get,
    /// POST request.
    Post,
    /// PUT request.
    Put,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        };
        f.write_str(name)
    }
}

/// Request body payload.
#[derive(Debug, Clone)]
pub enum HttpBody {
    /// A JSON document, sent as `application/json`.
    Json(Value),
    /// Raw bytes with an explicit content type (multipart uploads).
    Bytes {
        /// Value for the `Content-Type` header.
        content_type: String,
        /// The body bytes.
        data: Vec<u8>,
    },
}

/// A buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// `Content-Type` header value, if present.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Builds a JSON response; useful for mocks.
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".into()),
            body: value.to_string().into_bytes(),
        }
    }

    /// Builds a bodiless response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// Parses the body as JSON.
    pub fn json_body(&self) -> ReplicationResult<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ReplicationError::Protocol(format!("invalid JSON response body: {e}")))
    }
}

/// Blocking HTTP client used by the replication engine.
///
/// Implement this trait to plug in an actual HTTP stack (reqwest, ureq,
/// hyper, ...). Calls may block; the engine always invokes them from worker
/// threads and outside of any engine lock.
pub trait HttpTransport: Send + Sync {
    /// Executes a request and returns the buffered response.
    ///
    /// Non-2xx statuses are returned as responses, not errors; `Err` is
    /// reserved for transport-level failures.
    fn execute(
        &self,
        method: HttpMethod,
        url: &Url,
        headers: &[(String, String)],
        body: Option<HttpBody>,
    ) -> ReplicationResult<HttpResponse>;

    /// Cancels requests currently in flight on this transport, making them
    /// return a transport error as soon as possible.
    fn cancel_all(&self) {}
}

/// A request captured by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method.
    pub method: HttpMethod,
    /// Full request URL.
    pub url: Url,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<HttpBody>,
}

impl RecordedRequest {
    /// The URL's path component.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The JSON body, if the request carried one.
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Some(HttpBody::Json(value)) => Some(value),
            _ => None,
        }
    }

    /// Value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

type MockHandler =
    Box<dyn Fn(&RecordedRequest) -> ReplicationResult<HttpResponse> + Send + Sync>;

/// A transport that routes every request through a handler closure and
/// records it for later inspection.
pub struct MockTransport {
    handler: MockHandler,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Creates a mock transport with the given handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> ReplicationResult<HttpResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// All requests seen so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl HttpTransport for MockTransport {
    fn execute(
        &self,
        method: HttpMethod,
        url: &Url,
        headers: &[(String, String)],
        body: Option<HttpBody>,
    ) -> ReplicationResult<HttpResponse> {
        let request = RecordedRequest {
            method,
            url: url.clone(),
            headers: headers.to_vec(),
            body,
        };
        self.requests.lock().push(request.clone());
        (self.handler)(&request)
    }
}
