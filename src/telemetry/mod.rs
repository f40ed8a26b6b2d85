//! Telemetry event emission.
//!
//! # Responsibilities
//! - Define the event surface of the forwarding engine
//! - Guarantee exactly one terminal event per request trace
//! - Ship a default sink backed by the `metrics` facade
//!
//! # Design Decisions
//! - Listeners are injected (`Arc<dyn TelemetryListener>`); the core never
//!   decides how events are consumed
//! - Progress events are throttled to at most one per second per pump
//! - Listener callbacks are synchronous and must not block

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::forwarder::ForwardErrorKind;

/// States a forwarded request moves through. One stage event is emitted
/// per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderStage {
    /// Inbound request accepted and snapshotted.
    ReceivedRequest,
    /// Outbound request handed to the HTTP client.
    SentRequest,
    /// Response headers arrived from the destination.
    ReceivedResponse,
    /// Response body transfer to the client is starting.
    ResponseContentTransferStart,
    /// The request switched protocols (101) and raw pumps are running.
    ResponseUpgrade,
    /// All transfer for this request has finished.
    Completed,
}

impl ForwarderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwarderStage::ReceivedRequest => "received_request",
            ForwarderStage::SentRequest => "sent_request",
            ForwarderStage::ReceivedResponse => "received_response",
            ForwarderStage::ResponseContentTransferStart => "response_content_transfer_start",
            ForwarderStage::ResponseUpgrade => "response_upgrade",
            ForwarderStage::Completed => "completed",
        }
    }
}

/// Accounting snapshot for one body pump.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentTransfer {
    /// True for the request (client → destination) direction.
    pub is_request: bool,
    /// Bytes moved so far.
    pub total_bytes: u64,
    /// Completed read operations so far.
    pub iops: u64,
    /// Time spent waiting on reads.
    pub read_time: Duration,
    /// Time spent waiting on writes.
    pub write_time: Duration,
    /// Time from pump start to the first completed read.
    pub first_read_time: Duration,
}

/// Sink for the events the forwarding core emits. All methods default to
/// no-ops so listeners implement only what they consume.
pub trait TelemetryListener: Send + Sync {
    /// A forwarding operation began.
    fn on_proxy_start(&self) {}

    /// Destination metadata for the forwarding operation.
    fn on_proxy_invoke(&self, _cluster_id: &str, _route_id: &str, _destination_id: &str) {}

    /// A state transition inside the engine.
    fn on_stage(&self, _stage: ForwarderStage) {}

    /// Periodic progress for an active body pump (at most 1 Hz).
    fn on_content_transferring(&self, _transfer: &ContentTransfer) {}

    /// Final accounting for a body pump, emitted exactly once.
    fn on_content_transferred(&self, _transfer: &ContentTransfer) {}

    /// The forwarding operation completed with the given status.
    fn on_proxy_stop(&self, _status: StatusCode) {}

    /// The forwarding operation failed.
    fn on_proxy_failed(&self, _kind: ForwardErrorKind) {}
}

/// A listener that discards everything.
pub struct NoopTelemetry;

impl TelemetryListener for NoopTelemetry {}

/// Default sink: counters and histograms via the `metrics` facade, plus
/// trace-level logging.
pub struct MetricsTelemetry;

impl TelemetryListener for MetricsTelemetry {
    fn on_proxy_start(&self) {
        counter!("proxy_forward_total").increment(1);
    }

    fn on_proxy_invoke(&self, cluster_id: &str, route_id: &str, destination_id: &str) {
        tracing::trace!(
            cluster_id,
            route_id,
            destination_id,
            "Forwarding to destination"
        );
    }

    fn on_stage(&self, stage: ForwarderStage) {
        tracing::trace!(stage = stage.as_str(), "Forwarder stage");
    }

    fn on_content_transferring(&self, transfer: &ContentTransfer) {
        tracing::trace!(
            is_request = transfer.is_request,
            total_bytes = transfer.total_bytes,
            "Content transferring"
        );
    }

    fn on_content_transferred(&self, transfer: &ContentTransfer) {
        let direction = if transfer.is_request { "request" } else { "response" };
        counter!("proxy_body_bytes_total", "direction" => direction).increment(transfer.total_bytes);
        histogram!("proxy_body_read_seconds", "direction" => direction)
            .record(transfer.read_time.as_secs_f64());
        histogram!("proxy_body_write_seconds", "direction" => direction)
            .record(transfer.write_time.as_secs_f64());
    }

    fn on_proxy_stop(&self, status: StatusCode) {
        counter!("proxy_forward_completed_total", "status" => status.as_u16().to_string())
            .increment(1);
    }

    fn on_proxy_failed(&self, kind: ForwardErrorKind) {
        counter!("proxy_forward_failed_total", "kind" => kind.as_str()).increment(1);
    }
}

/// Initialize the Prometheus exporter and its scrape endpoint.
pub fn install_metrics_exporter(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Per-request trace guard. Fans stage events out to the listener and
/// guarantees that exactly one terminal event (stop or failed) closes
/// the trace, no matter how many paths race to report completion.
pub(crate) struct RequestTrace {
    listener: Arc<dyn TelemetryListener>,
    closed: AtomicBool,
}

impl RequestTrace {
    pub(crate) fn new(listener: Arc<dyn TelemetryListener>) -> Self {
        listener.on_proxy_start();
        Self {
            listener,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn invoke(&self, cluster_id: &str, route_id: &str, destination_id: &str) {
        self.listener.on_proxy_invoke(cluster_id, route_id, destination_id);
    }

    pub(crate) fn stage(&self, stage: ForwarderStage) {
        self.listener.on_stage(stage);
    }

    pub(crate) fn stop(&self, status: StatusCode) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.listener.on_proxy_stop(status);
        }
    }

    pub(crate) fn failed(&self, kind: ForwardErrorKind) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.listener.on_proxy_failed(kind);
        }
    }
}
