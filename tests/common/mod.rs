//! Shared helpers for the end-to-end tests: a capture server that plays the
//! task target, plus request builders for queues and tasks.
#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::any;
use axum::Router;
use tokio::sync::mpsc;

use cloud_tasks_emulator::proto::google::cloud::tasks::v2::{
    CreateQueueRequest, CreateTaskRequest,
};
use cloud_tasks_emulator::proto::{
    CloudTasksClient, HttpRequest, MessageType, Queue, Task,
};
use tonic::transport::Channel;

pub const PARENT: &str = "projects/TestProject/locations/TestLocation";

pub fn queue_name(id: &str) -> String {
    format!("{}/queues/{}", PARENT, id)
}

#[allow(dead_code)]
pub fn http_task(url: &str) -> Task {
    named_http_task("", url)
}

pub fn named_http_task(name: &str, url: &str) -> Task {
    Task {
        name: name.to_string(),
        message_type: Some(MessageType::HttpRequest(HttpRequest {
            url: url.to_string(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub async fn create_test_queue(client: &mut CloudTasksClient<Channel>, id: &str) -> Queue {
    client
        .create_queue(CreateQueueRequest {
            parent: PARENT.to_string(),
            queue: Some(Queue {
                name: queue_name(id),
                ..Default::default()
            }),
        })
        .await
        .expect("create queue")
        .into_inner()
}

#[allow(dead_code)]
pub async fn create_task(
    client: &mut CloudTasksClient<Channel>,
    queue: &str,
    task: Task,
) -> Task {
    client
        .create_task(CreateTaskRequest {
            parent: queue.to_string(),
            task: Some(task),
            response_view: 0,
        })
        .await
        .expect("create task")
        .into_inner()
}

#[allow(dead_code)]
pub fn assert_status(err: &tonic::Status, code: tonic::Code, message_prefix: &str) {
    assert_eq!(err.code(), code, "unexpected status: {:?}", err);
    assert!(
        err.message().starts_with(message_prefix),
        "message {:?} does not start with {:?}",
        err.message(),
        message_prefix
    );
}

/// One request the capture server received, with lowercased header names.
pub struct CapturedRequest {
    #[allow(dead_code)]
    pub path: String,
    headers: HashMap<String, String>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

type Tx = mpsc::UnboundedSender<CapturedRequest>;

/// Local HTTP server with a `/success` (200) and `/not_found` (404) route;
/// every request it receives lands on the channel.
pub struct TestTarget {
    pub url: String,
    rx: mpsc::UnboundedReceiver<CapturedRequest>,
}

impl TestTarget {
    pub async fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/success", any(success))
            .route("/not_found", any(not_found))
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind target port");
        let addr = listener.local_addr().expect("target address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("target server");
        });
        Self {
            url: format!("http://{}", addr),
            rx,
        }
    }

    pub async fn await_request_within(&mut self, timeout: Duration) -> Option<CapturedRequest> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            // Give the emulator a few ticks to process the response; the
            // request hits the channel before the handler answers.
            Ok(request) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                request
            }
            Err(_) => None,
        }
    }

    pub async fn await_request(&mut self) -> CapturedRequest {
        self.await_request_within(Duration::from_secs(1))
            .await
            .expect("timed out waiting for HTTP request")
    }

    #[allow(dead_code)]
    pub async fn assert_silent_for(&mut self, timeout: Duration) {
        assert!(
            self.await_request_within(timeout).await.is_none(),
            "received an HTTP request that should not have been dispatched"
        );
    }
}

fn record(tx: &Tx, path: &str, headers: &HeaderMap) {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let _ = tx.send(CapturedRequest {
        path: path.to_string(),
        headers,
    });
}

async fn success(State(tx): State<Tx>, headers: HeaderMap) -> StatusCode {
    record(&tx, "/success", &headers);
    StatusCode::OK
}

async fn not_found(State(tx): State<Tx>, headers: HeaderMap) -> StatusCode {
    record(&tx, "/not_found", &headers);
    StatusCode::NOT_FOUND
}
