//! Protocol-upgrade (101) relay.
//!
//! # Responsibilities
//! - Acquire both raw duplex streams after the 101 goes out
//! - Run one pump per direction until each side ends
//! - Half-close each direction on its own EOF
//! - Map pump failures to the upgrade error kinds
//!
//! # Design Decisions
//! - Both pumps share one activity token: traffic in either direction
//!   keeps the connection alive
//! - The first pump to fail fixes the error kind; the other side is
//!   torn down by the shared cancellation

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::copy::activity::ActivityTimeoutToken;
use crate::copy::copier::{StreamCopier, StreamCopyResult};
use crate::forwarder::context::UpgradeHandle;
use crate::forwarder::error::{ErrorSlot, ForwardErrorKind};
use crate::telemetry::{ForwarderStage, RequestTrace, TelemetryListener};

fn request_pump_kind(result: StreamCopyResult) -> Option<ForwardErrorKind> {
    match result {
        StreamCopyResult::Success => None,
        StreamCopyResult::InputError => Some(ForwardErrorKind::UpgradeRequestClient),
        StreamCopyResult::OutputError => Some(ForwardErrorKind::UpgradeRequestDestination),
        StreamCopyResult::Canceled => Some(ForwardErrorKind::UpgradeRequestCanceled),
    }
}

fn response_pump_kind(result: StreamCopyResult) -> Option<ForwardErrorKind> {
    match result {
        StreamCopyResult::Success => None,
        StreamCopyResult::InputError => Some(ForwardErrorKind::UpgradeResponseDestination),
        StreamCopyResult::OutputError => Some(ForwardErrorKind::UpgradeResponseClient),
        StreamCopyResult::Canceled => Some(ForwardErrorKind::UpgradeResponseCanceled),
    }
}

/// Drive an upgraded connection to completion. Runs detached from the
/// response path: the 101 must reach the client before either raw
/// stream exists.
pub(crate) async fn run_upgrade_pumps(
    inbound: UpgradeHandle,
    outbound: UpgradeHandle,
    window: Duration,
    request_cancel: CancellationToken,
    telemetry: Arc<dyn TelemetryListener>,
    trace: Arc<RequestTrace>,
    slot: Arc<ErrorSlot>,
) {
    let streams = tokio::select! {
        _ = request_cancel.cancelled() => {
            slot.set(ForwardErrorKind::UpgradeRequestCanceled, None);
            trace.failed(ForwardErrorKind::UpgradeRequestCanceled);
            return;
        }
        streams = async {
            tokio::join!(inbound.into_stream(), outbound.into_stream())
        } => streams,
    };

    let (client_stream, destination_stream) = match streams {
        (Ok(client), Ok(destination)) => (client, destination),
        (Err(e), _) => {
            let kind = ForwardErrorKind::UpgradeRequestClient;
            tracing::warn!(error = %e, "Inbound upgrade stream unavailable");
            slot.set(kind, Some(Arc::new(e)));
            trace.failed(kind);
            return;
        }
        (_, Err(e)) => {
            let kind = ForwardErrorKind::UpgradeRequestDestination;
            tracing::warn!(error = %e, "Outbound upgrade stream unavailable");
            slot.set(kind, Some(Arc::new(e)));
            trace.failed(kind);
            return;
        }
    };

    trace.stage(ForwarderStage::ResponseUpgrade);

    let (mut client_read, mut client_write) = tokio::io::split(client_stream);
    let (mut destination_read, mut destination_write) = tokio::io::split(destination_stream);

    let activity = ActivityTimeoutToken::new(&request_cancel, window);

    let request_pump = async {
        let copier = StreamCopier::new(Arc::clone(&telemetry), true);
        let (result, error) = copier
            .copy(&mut client_read, &mut destination_write, &activity)
            .await;
        match request_pump_kind(result) {
            None => {
                // Client side ended; half-close our write direction and
                // let the destination finish on its own terms.
                let _ = destination_write.shutdown().await;
            }
            Some(kind) => {
                slot.set(kind, error.map(|e| Arc::new(e) as _));
                // Tear the other direction down too.
                activity.token().cancel();
            }
        }
    };

    let response_pump = async {
        let copier = StreamCopier::new(Arc::clone(&telemetry), false);
        let (result, error) = copier
            .copy(&mut destination_read, &mut client_write, &activity)
            .await;
        match response_pump_kind(result) {
            None => {
                let _ = client_write.shutdown().await;
            }
            Some(kind) => {
                slot.set(kind, error.map(|e| Arc::new(e) as _));
                activity.token().cancel();
            }
        }
    };

    tokio::join!(request_pump, response_pump);

    match slot.kind() {
        ForwardErrorKind::None => {
            trace.stage(ForwarderStage::Completed);
            trace.stop(StatusCode::SWITCHING_PROTOCOLS);
        }
        kind => trace.failed(kind),
    }
}
