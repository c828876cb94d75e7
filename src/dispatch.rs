//! Outbound HTTP dispatch: the collaborator interface the task workers call,
//! its reqwest implementation, and construction of the dispatch request
//! (URL, method, `X-CloudTasks-*` / `X-AppEngine-*` headers) from task state.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::names;
use crate::proto::{duration_from_proto, HttpMethod, MessageType, Task};
use crate::routing;

/// Default per-attempt deadline when the task does not carry one.
pub const DEFAULT_DISPATCH_DEADLINE: Duration = Duration::from_secs(10);

/// One fully resolved outbound attempt.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub deadline: Duration,
}

/// Outcome of a single attempt. `code` is the HTTP status, or `None` when no
/// response was received (connect failure, timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub code: Option<u16>,
}

impl DispatchOutcome {
    pub fn success(&self) -> bool {
        matches!(self.code, Some(code) if (200..300).contains(&code))
    }

    /// The canonical rpc code recorded on the task's attempt bookkeeping.
    /// Any 5xx counts as UNAVAILABLE, like a transport failure.
    pub fn rpc_code(&self) -> i32 {
        match self.code {
            None => 14,                             // UNAVAILABLE
            Some(code) if (200..300).contains(&code) => 0,
            Some(code) if (500..600).contains(&code) => 14,
            Some(400) => 3,                         // INVALID_ARGUMENT
            Some(403) => 7,                         // PERMISSION_DENIED
            Some(404) => 5,                         // NOT_FOUND
            Some(409) => 10,                        // ABORTED
            Some(429) => 8,                         // RESOURCE_EXHAUSTED
            Some(499) => 1,                         // CANCELLED
            Some(_) => 2,                           // UNKNOWN
        }
    }

    pub fn rpc_message(&self) -> String {
        match self.code {
            Some(code) => format!("HTTP status code {}", code),
            None => "failed to dispatch HTTP request".to_string(),
        }
    }
}

/// Sends one HTTP attempt and reports the status code. The emulator core only
/// depends on this seam; tests substitute their own implementations.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome;
}

/// Production dispatcher backed by a shared reqwest client.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let method = reqwest_method(request.method);
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.deadline)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => DispatchOutcome {
                code: Some(response.status().as_u16()),
            },
            Err(err) => {
                debug!("Dispatch to {} failed: {}", request.url, err);
                DispatchOutcome { code: None }
            }
        }
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Post | HttpMethod::Unspecified => reqwest::Method::POST,
    }
}

/// Builds the outbound request for the task's next attempt.
///
/// Counter headers reflect the state *before* the attempt:
/// `TaskExecutionCount` is the count of completed dispatches
/// (`dispatch_count`), `TaskRetryCount` the count of non-2xx dispatches
/// (`response_count`). Emulator headers win over caller-supplied ones.
pub fn build_request(state: &Task) -> Option<DispatchRequest> {
    let deadline = state
        .dispatch_deadline
        .as_ref()
        .map(duration_from_proto)
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_DISPATCH_DEADLINE);

    let (url, method, user_headers, body, prefix) = match state.message_type.as_ref()? {
        MessageType::HttpRequest(http) => (
            http.url.clone(),
            http.http_method(),
            &http.headers,
            http.body.clone(),
            "X-CloudTasks-",
        ),
        MessageType::AppEngineHttpRequest(aer) => {
            let host = aer
                .app_engine_routing
                .as_ref()
                .map(|r| r.host.clone())
                .unwrap_or_default();
            (
                format!("{}{}", host, aer.relative_uri),
                aer.http_method(),
                &aer.headers,
                aer.body.clone(),
                "X-AppEngine-",
            )
        }
    };

    let mut headers: HashMap<String, String> = user_headers.clone();

    let queue_name = names::queue_of_task(&state.name).unwrap_or_default();
    headers.insert(
        format!("{}TaskName", prefix),
        names::short_id(&state.name).to_string(),
    );
    headers.insert(
        format!("{}QueueName", prefix),
        names::short_id(queue_name).to_string(),
    );
    headers.insert(
        format!("{}TaskRetryCount", prefix),
        state.response_count.to_string(),
    );
    headers.insert(
        format!("{}TaskExecutionCount", prefix),
        state.dispatch_count.to_string(),
    );
    let eta = state.schedule_time.clone().unwrap_or_default();
    headers.insert(
        format!("{}TaskETA", prefix),
        format!("{}.{:09}", eta.seconds, eta.nanos),
    );

    Some(DispatchRequest {
        url,
        method,
        headers,
        body,
        deadline,
    })
}

/// Fills dispatch-relevant defaults on a freshly created task: POST for HTTP
/// targets, `/` and the resolved routing host for AppEngine targets.
pub fn normalize_target(state: &mut Task, queue_name: &str) {
    match state.message_type.as_mut() {
        Some(MessageType::HttpRequest(http)) => {
            if http.http_method() == HttpMethod::Unspecified {
                http.set_http_method(HttpMethod::Post);
            }
        }
        Some(MessageType::AppEngineHttpRequest(aer)) => {
            if aer.http_method() == HttpMethod::Unspecified {
                aer.set_http_method(HttpMethod::Post);
            }
            if aer.relative_uri.is_empty() {
                aer.relative_uri = "/".to_string();
            }
            let project = names::project_of(queue_name).unwrap_or_default();
            let host = routing::resolve_host(project, aer.app_engine_routing.as_ref());
            let routing = aer.app_engine_routing.get_or_insert_with(Default::default);
            routing.host = host;
        }
        None => {}
    }
}
