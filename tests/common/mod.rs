//! Shared utilities for integration testing.

// Each test binary compiles its own copy; not every binary uses
// every helper.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use http::{Request, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use relay_core::forwarder::ForwardErrorKind;
use relay_core::telemetry::{ContentTransfer, ForwarderStage, TelemetryListener};
use relay_core::BoxError;

/// Every event the forwarding core emits, in arrival order.
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum Event {
    Start,
    Invoke(String, String, String),
    Stage(ForwarderStage),
    Transferring(bool),
    Transferred(bool, u64),
    Stop(u16),
    Failed(ForwardErrorKind),
}

/// Telemetry listener that records everything for assertions.
pub struct RecordingTelemetry {
    events: Mutex<Vec<Event>>,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl TelemetryListener for RecordingTelemetry {
    fn on_proxy_start(&self) {
        self.push(Event::Start);
    }

    fn on_proxy_invoke(&self, cluster_id: &str, route_id: &str, destination_id: &str) {
        self.push(Event::Invoke(
            cluster_id.to_string(),
            route_id.to_string(),
            destination_id.to_string(),
        ));
    }

    fn on_stage(&self, stage: ForwarderStage) {
        self.push(Event::Stage(stage));
    }

    fn on_content_transferring(&self, transfer: &ContentTransfer) {
        self.push(Event::Transferring(transfer.is_request));
    }

    fn on_content_transferred(&self, transfer: &ContentTransfer) {
        self.push(Event::Transferred(transfer.is_request, transfer.total_bytes));
    }

    fn on_proxy_stop(&self, status: StatusCode) {
        self.push(Event::Stop(status.as_u16()));
    }

    fn on_proxy_failed(&self, kind: ForwardErrorKind) {
        self.push(Event::Failed(kind));
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

/// Destination stub: a programmable in-process HTTP client.
pub struct StubClient {
    handler: Arc<dyn Fn(Request<Body>) -> HandlerFuture + Send + Sync>,
}

impl StubClient {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |request| Box::pin(handler(request))),
        }
    }
}

impl relay_core::ForwardHttpClient for StubClient {
    fn send(
        &self,
        request: Request<Body>,
    ) -> impl Future<Output = Result<Response<Body>, BoxError>> + Send {
        let handler = Arc::clone(&self.handler);
        async move { handler(request).await }
    }
}

/// Start a simple mock backend that returns a fixed response.
#[allow(dead_code)]
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}
