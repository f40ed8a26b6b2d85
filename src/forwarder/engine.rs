//! The forwarding engine.
//!
//! # Data Flow
//! ```text
//! RequestContext
//!     → snapshot inbound, decide body/version/upgrade
//!     → build outbound head (URI, headers, transforms)
//!     → send via ForwardHttpClient (full duplex, cancellable)
//!     → 101: hand both raw streams to the upgrade pumps
//!     → else: filter + transform response headers,
//!             prefetch first body frame, commit, supervise the rest
//! ```
//!
//! # Design Decisions
//! - `forward` never fails: every error becomes a synthesized status
//!   plus an error feature on the response extensions
//! - Status policy: failures before the response is committed map to
//!   502, except client-caused body failures which map to 400; after
//!   commit the status is frozen and the body stream is aborted

use std::sync::Arc;

use axum::body::Body;
use http::{Request, Response, StatusCode, Version};

use crate::client::ForwardHttpClient;
use crate::config::ForwarderConfig;
use crate::copy::activity::ActivityTimeoutToken;
use crate::copy::body::{ResponseBodyParams, StreamCopyBody, StreamCopyHandle};
use crate::copy::copier::StreamCopyResult;
use crate::forwarder::context::{InboundSnapshot, RequestContext, UpgradeHandle};
use crate::forwarder::error::{ErrorSlot, ForwardErrorKind};
use crate::forwarder::headers::restore_upgrade_headers;
use crate::forwarder::request::{build_outbound_head, is_upgrade_request, needs_outbound_body};
use crate::forwarder::response::{
    build_response_headers, prefetch_first_frame, synthesize_error_response, FirstFrame,
    ReasonPhrase,
};
use crate::forwarder::upgrade::run_upgrade_pumps;
use crate::telemetry::{ForwarderStage, MetricsTelemetry, RequestTrace, TelemetryListener};
use crate::transform::TransformPipeline;
use crate::BoxError;

enum SendOutcome {
    Response(Response<Body>),
    Canceled,
    Failed(BoxError),
}

/// Drives proxied requests from acceptance to completion.
///
/// The forwarder is stateless across requests and safe to share; all
/// per-request state lives in the [`RequestContext`].
pub struct HttpForwarder {
    config: ForwarderConfig,
    telemetry: Arc<dyn TelemetryListener>,
}

impl HttpForwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            config,
            telemetry: Arc::new(MetricsTelemetry),
        }
    }

    /// Replace the default metrics sink.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryListener>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Forward one request. Never returns an error: failures surface as
    /// the response status plus an error feature extension (see
    /// [`error_feature`](crate::forwarder::error_feature)).
    pub async fn forward<C>(&self, ctx: RequestContext, client: &C) -> Response<Body>
    where
        C: ForwardHttpClient,
    {
        let RequestContext {
            request,
            destination,
            transforms,
            scheme,
            client_addr,
            path_base,
            request_cancel,
            content_cancel,
        } = ctx;

        let trace = Arc::new(RequestTrace::new(Arc::clone(&self.telemetry)));
        trace.invoke(
            &destination.cluster_id,
            &destination.route_id,
            &destination.destination_id,
        );
        let slot = Arc::new(ErrorSlot::new());

        let (mut parts, inbound_body) = request.into_parts();
        let inbound_upgrade = parts.extensions.remove::<UpgradeHandle>().or_else(|| {
            parts
                .extensions
                .remove::<hyper::upgrade::OnUpgrade>()
                .map(UpgradeHandle::from_hyper)
        });

        let snapshot = InboundSnapshot::new(&parts, &scheme, client_addr, path_base);
        trace.stage(ForwarderStage::ReceivedRequest);

        let upgrade_eligible = inbound_upgrade.is_some() && is_upgrade_request(&snapshot.headers);

        let head = match build_outbound_head(&snapshot, &destination, &transforms, upgrade_eligible)
        {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(error = %e, "Outbound URI composition failed");
                let kind = ForwardErrorKind::Request;
                slot.set(kind, Some(Arc::new(e)));
                trace.failed(kind);
                return synthesize_error_response(StatusCode::BAD_GATEWAY, &transforms, slot);
            }
        };

        let mut upload_handle: Option<StreamCopyHandle> = None;
        let outbound_body = if needs_outbound_body(&snapshot.method, &snapshot.headers) {
            // HTTP/1.1 uploads follow the request token: the client's own
            // cancellation is already the right signal there. HTTP/2+
            // uploads must survive the outer timeout, so they follow the
            // content token instead.
            let parent = if head.version == Version::HTTP_11 {
                &request_cancel
            } else {
                &content_cancel
            };
            let activity = ActivityTimeoutToken::new(parent, self.config.activity_timeout());
            let (body, handle) =
                StreamCopyBody::upload(inbound_body, activity, Arc::clone(&self.telemetry));
            upload_handle = Some(handle);
            Body::new(body)
        } else {
            Body::empty()
        };

        let mut outbound = Request::new(outbound_body);
        *outbound.method_mut() = head.method;
        *outbound.uri_mut() = head.uri;
        *outbound.version_mut() = head.version;
        *outbound.headers_mut() = head.headers;

        trace.stage(ForwarderStage::SentRequest);

        let outcome = tokio::select! {
            _ = request_cancel.cancelled() => SendOutcome::Canceled,
            result = client.send(outbound) => match result {
                Ok(response) => SendOutcome::Response(response),
                Err(e) => SendOutcome::Failed(e),
            },
        };

        let mut response = match outcome {
            SendOutcome::Response(response) => response,
            SendOutcome::Canceled => {
                return self.send_failure(None, upload_handle.as_ref(), true, &transforms, slot, &trace);
            }
            SendOutcome::Failed(e) => {
                let canceled = request_cancel.is_cancelled();
                return self.send_failure(Some(e), upload_handle.as_ref(), canceled, &transforms, slot, &trace);
            }
        };

        trace.stage(ForwarderStage::ReceivedResponse);
        let status = response.status();

        if status == StatusCode::SWITCHING_PROTOCOLS {
            if let (true, Some(inbound_upgrade)) = (upgrade_eligible, inbound_upgrade) {
                return self.start_upgrade(
                    response,
                    inbound_upgrade,
                    &transforms,
                    request_cancel,
                    slot,
                    trace,
                );
            }
        }

        let reason = response.extensions_mut().remove::<ReasonPhrase>();
        let (dest_parts, dest_body) = response.into_parts();
        let headers = build_response_headers(&dest_parts.headers, status, &transforms);

        let mut out = Response::new(Body::empty());
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        out.extensions_mut().insert(Arc::clone(&slot));
        if let Some(reason) = reason {
            out.extensions_mut().insert(reason);
        }

        trace.stage(ForwarderStage::ResponseContentTransferStart);

        let activity = ActivityTimeoutToken::new(&request_cancel, self.config.activity_timeout());
        let mut dest_body = dest_body;
        match prefetch_first_frame(&mut dest_body, &activity).await {
            FirstFrame::Eof => {
                trace.stage(ForwarderStage::Completed);
                trace.stop(status);
                out
            }
            FirstFrame::Frame(frame) => {
                let supervised = StreamCopyBody::response(
                    dest_body,
                    frame,
                    activity,
                    Arc::clone(&self.telemetry),
                    ResponseBodyParams {
                        trace: Arc::clone(&trace),
                        error_slot: Arc::clone(&slot),
                        status,
                        transforms: Arc::clone(&transforms),
                    },
                );
                *out.body_mut() = Body::new(supervised);
                out
            }
            FirstFrame::Failed(e) => {
                // Nothing reached the client yet; the response is still
                // recoverable.
                tracing::warn!(error = %e, "Destination body failed before first byte");
                let kind = ForwardErrorKind::ResponseBodyDestination;
                slot.set(kind, Some(Arc::from(e)));
                trace.failed(kind);
                synthesize_error_response(StatusCode::BAD_GATEWAY, &transforms, slot)
            }
            FirstFrame::Canceled => {
                let kind = ForwardErrorKind::ResponseBodyCanceled;
                slot.set(kind, None);
                trace.failed(kind);
                synthesize_error_response(StatusCode::BAD_GATEWAY, &transforms, slot)
            }
        }
    }

    fn send_failure(
        &self,
        error: Option<BoxError>,
        upload: Option<&StreamCopyHandle>,
        canceled: bool,
        transforms: &TransformPipeline,
        slot: Arc<ErrorSlot>,
        trace: &RequestTrace,
    ) -> Response<Body> {
        let kind = classify_send_failure(canceled, upload);
        if let Some(e) = &error {
            tracing::warn!(error = %e, kind = kind.as_str(), "Forwarding failed before response");
        } else {
            tracing::debug!(kind = kind.as_str(), "Forwarding canceled before response");
        }

        let upload_error = upload
            .and_then(|h| h.outcome())
            .and_then(|outcome| outcome.error);
        let source = upload_error.or_else(|| error.map(Arc::from));
        slot.set(kind, source);
        trace.failed(kind);

        let status = if kind.is_client_fault() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::BAD_GATEWAY
        };
        synthesize_error_response(status, transforms, slot)
    }

    fn start_upgrade(
        &self,
        mut response: Response<Body>,
        inbound_upgrade: UpgradeHandle,
        transforms: &TransformPipeline,
        request_cancel: tokio_util::sync::CancellationToken,
        slot: Arc<ErrorSlot>,
        trace: Arc<RequestTrace>,
    ) -> Response<Body> {
        let outbound_upgrade = response.extensions_mut().remove::<UpgradeHandle>().or_else(|| {
            response
                .extensions_mut()
                .remove::<hyper::upgrade::OnUpgrade>()
                .map(UpgradeHandle::from_hyper)
        });

        let Some(outbound_upgrade) = outbound_upgrade else {
            tracing::warn!("Destination returned 101 without an upgradable stream");
            let kind = ForwardErrorKind::UpgradeRequestDestination;
            slot.set(kind, None);
            trace.failed(kind);
            return synthesize_error_response(StatusCode::BAD_GATEWAY, transforms, slot);
        };

        let status = response.status();
        let mut headers = build_response_headers(response.headers(), status, transforms);
        restore_upgrade_headers(response.headers(), &mut headers);

        let reason = response.extensions_mut().remove::<ReasonPhrase>();

        // The raw streams only exist after the 101 reaches the client,
        // so the pumps run detached from the response path.
        tokio::spawn(run_upgrade_pumps(
            inbound_upgrade,
            outbound_upgrade,
            self.config.upgrade_activity_timeout(),
            request_cancel,
            Arc::clone(&self.telemetry),
            Arc::clone(&trace),
            Arc::clone(&slot),
        ));

        let mut out = Response::new(Body::empty());
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        out.extensions_mut().insert(slot);
        if let Some(reason) = reason {
            out.extensions_mut().insert(reason);
        }
        out
    }
}

/// Map an HTTP-client failure (or cancellation) that happened before
/// response headers arrived. A failed upload promotes the kind to the
/// matching request-body variant.
fn classify_send_failure(canceled: bool, upload: Option<&StreamCopyHandle>) -> ForwardErrorKind {
    if let Some(handle) = upload {
        if let Some(outcome) = handle.outcome() {
            match outcome.result {
                StreamCopyResult::InputError => return ForwardErrorKind::RequestBodyClient,
                StreamCopyResult::OutputError => return ForwardErrorKind::RequestBodyDestination,
                StreamCopyResult::Canceled if !outcome.abandoned => {
                    return ForwardErrorKind::RequestBodyCanceled;
                }
                StreamCopyResult::Canceled if !canceled => {
                    // The client tore the upload down on its own: the
                    // destination side stopped accepting the body.
                    return ForwardErrorKind::RequestBodyDestination;
                }
                StreamCopyResult::Canceled | StreamCopyResult::Success => {}
            }
        }
    }
    if canceled {
        ForwardErrorKind::RequestCanceled
    } else {
        ForwardErrorKind::Request
    }
}
