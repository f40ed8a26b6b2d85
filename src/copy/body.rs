//! Body-level pump for request upload and response passthrough.
//!
//! # Responsibilities
//! - Stream the inbound request body to the outbound HTTP client
//! - Stream the destination response body to the inbound client
//! - Supervise both with the activity timeout and linked cancellation
//! - Account bytes/iops/latency and publish a completion outcome
//!
//! # Design Decisions
//! - The adapter is pull-based: the HTTP stack on the consuming side
//!   drives it, which gives full-duplex transfer for free (hyper sends
//!   request headers before polling the body, so the response can be
//!   received while the upload is still running)
//! - The upload starts exactly once, at the first poll; the `started`
//!   flag is observable before completion through the handle
//! - The consuming side's time shows up as the gap between a yielded
//!   frame and the next poll, which is what the write-time accounting
//!   records

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http::StatusCode;
use http_body::{Frame, SizeHint};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::copy::activity::ActivityTimeoutToken;
use crate::copy::copier::StreamCopyResult;
use crate::forwarder::error::{ErrorSlot, ForwardErrorKind};
use crate::telemetry::{ContentTransfer, ForwarderStage, RequestTrace, TelemetryListener};
use crate::transform::TransformPipeline;
use crate::BoxError;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal outcome of a body-level pump, shared with observers.
#[derive(Clone)]
pub struct CopyOutcome {
    pub result: StreamCopyResult,
    pub error: Option<Arc<dyn std::error::Error + Send + Sync>>,
    /// True when the consuming side stopped polling mid-transfer instead
    /// of the pump itself finishing or being canceled. For an upload this
    /// means the HTTP client gave up while the body was still flowing.
    pub abandoned: bool,
}

impl fmt::Debug for CopyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOutcome")
            .field("result", &self.result)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .field("abandoned", &self.abandoned)
            .finish()
    }
}

/// Observer for an in-flight body pump: the `started` flag plus a
/// completion channel that resolves when the pump finishes, whether it
/// succeeded or not.
#[derive(Clone)]
pub struct StreamCopyHandle {
    started: Arc<AtomicBool>,
    outcome: watch::Receiver<Option<CopyOutcome>>,
}

impl StreamCopyHandle {
    /// True once the consumer pulled the first frame.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The outcome, if the pump already finished.
    pub fn outcome(&self) -> Option<CopyOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the pump to finish.
    pub async fn finished(&mut self) -> CopyOutcome {
        loop {
            if let Some(outcome) = self.outcome.borrow_and_update().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                // Publisher vanished without an outcome; the pump was
                // torn down before completion.
                return CopyOutcome {
                    result: StreamCopyResult::Canceled,
                    error: None,
                    abandoned: true,
                };
            }
        }
    }
}

/// Wrapper that lets one error instance be both recorded in the error
/// feature and propagated down the body stream.
pub(crate) struct SharedError(pub(crate) Arc<dyn std::error::Error + Send + Sync>);

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Response-side wiring: where to report completion and failure.
pub(crate) struct ResponseBodyParams {
    pub(crate) trace: Arc<RequestTrace>,
    pub(crate) error_slot: Arc<ErrorSlot>,
    pub(crate) status: StatusCode,
    pub(crate) transforms: Arc<TransformPipeline>,
}

enum Role {
    Upload,
    Response(ResponseBodyParams),
}

/// A one-way streaming body that pumps an inner body to whichever HTTP
/// stack polls it, under activity-timeout supervision.
pub struct StreamCopyBody {
    inner: Body,
    first_frame: Option<Frame<Bytes>>,
    activity: ActivityTimeoutToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    telemetry: Arc<dyn TelemetryListener>,
    role: Role,

    started: Arc<AtomicBool>,
    outcome_tx: watch::Sender<Option<CopyOutcome>>,
    finished: bool,

    transfer: ContentTransfer,
    started_at: Option<Instant>,
    read_start: Option<Instant>,
    last_yield: Option<Instant>,
    last_progress: Option<Instant>,
}

impl StreamCopyBody {
    /// Upload content for the outbound request. Returns the body and the
    /// handle the engine uses to classify client-send failures.
    pub(crate) fn upload(
        inner: Body,
        activity: ActivityTimeoutToken,
        telemetry: Arc<dyn TelemetryListener>,
    ) -> (Self, StreamCopyHandle) {
        let body = Self::new(inner, None, activity, telemetry, Role::Upload, true);
        let handle = StreamCopyHandle {
            started: Arc::clone(&body.started),
            outcome: body.outcome_tx.subscribe(),
        };
        (body, handle)
    }

    /// Supervised passthrough of the destination response body, seeded
    /// with the frame the engine prefetched before committing headers.
    pub(crate) fn response(
        inner: Body,
        first_frame: Frame<Bytes>,
        activity: ActivityTimeoutToken,
        telemetry: Arc<dyn TelemetryListener>,
        params: ResponseBodyParams,
    ) -> Self {
        Self::new(
            inner,
            Some(first_frame),
            activity,
            telemetry,
            Role::Response(params),
            false,
        )
    }

    fn new(
        inner: Body,
        first_frame: Option<Frame<Bytes>>,
        activity: ActivityTimeoutToken,
        telemetry: Arc<dyn TelemetryListener>,
        role: Role,
        is_request: bool,
    ) -> Self {
        let cancelled = Box::pin(activity.token().clone().cancelled_owned());
        let (outcome_tx, _) = watch::channel(None);
        Self {
            inner,
            first_frame,
            activity,
            cancelled,
            telemetry,
            role,
            started: Arc::new(AtomicBool::new(false)),
            outcome_tx,
            finished: false,
            transfer: ContentTransfer {
                is_request,
                ..Default::default()
            },
            started_at: None,
            read_start: None,
            last_yield: None,
            last_progress: None,
        }
    }

    fn finish(
        &mut self,
        result: StreamCopyResult,
        error: Option<Arc<dyn std::error::Error + Send + Sync>>,
        abandoned: bool,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.telemetry.on_content_transferred(&self.transfer);

        if let Role::Response(params) = &self.role {
            match result {
                StreamCopyResult::Success => {
                    params.trace.stage(ForwarderStage::Completed);
                    params.trace.stop(params.status);
                }
                StreamCopyResult::Canceled => {
                    // An abandonment without a fired token means the
                    // client side stopped accepting the body.
                    let kind = if abandoned {
                        ForwardErrorKind::ResponseBodyClient
                    } else {
                        ForwardErrorKind::ResponseBodyCanceled
                    };
                    params.error_slot.set(kind, error.clone());
                    params.trace.failed(kind);
                }
                StreamCopyResult::InputError => {
                    let kind = ForwardErrorKind::ResponseBodyDestination;
                    params.error_slot.set(kind, error.clone());
                    params.trace.failed(kind);
                }
                StreamCopyResult::OutputError => {
                    let kind = ForwardErrorKind::ResponseBodyClient;
                    params.error_slot.set(kind, error.clone());
                    params.trace.failed(kind);
                }
            }
        }

        self.outcome_tx
            .send_replace(Some(CopyOutcome {
                result,
                error,
                abandoned,
            }));
    }

    fn process_frame(&mut self, frame: Frame<Bytes>) -> Frame<Bytes> {
        if let Some(data) = frame.data_ref() {
            if self.transfer.iops == 0 {
                if let Some(at) = self.started_at {
                    self.transfer.first_read_time = at.elapsed();
                }
            }
            self.transfer.iops += 1;
            self.transfer.total_bytes += data.len() as u64;
            self.activity.reset_timeout();

            let now = Instant::now();
            match self.last_progress {
                Some(at) if now.duration_since(at) < PROGRESS_INTERVAL => {}
                _ => {
                    self.last_progress = Some(now);
                    self.telemetry.on_content_transferring(&self.transfer);
                }
            }
            return frame;
        }

        // Trailer frame: response-trailer transforms run here, after the
        // body transfer ended.
        match frame.into_trailers() {
            Ok(mut trailers) => {
                if let Role::Response(params) = &self.role {
                    params.transforms.apply_trailers(&mut trailers);
                }
                Frame::trailers(trailers)
            }
            Err(frame) => frame,
        }
    }

    fn cancel_error(&self) -> std::io::Error {
        if self.activity.timed_out() {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "body transfer activity timeout")
        } else {
            std::io::Error::new(std::io::ErrorKind::Interrupted, "body transfer canceled")
        }
    }
}

impl http_body::Body for StreamCopyBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        if !this.started.swap(true, Ordering::AcqRel) {
            this.started_at = Some(Instant::now());
        }

        if let Some(at) = this.last_yield.take() {
            this.transfer.write_time += at.elapsed();
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            let err: Arc<dyn std::error::Error + Send + Sync> = Arc::new(this.cancel_error());
            this.finish(StreamCopyResult::Canceled, Some(Arc::clone(&err)), false);
            return Poll::Ready(Some(Err(Box::new(SharedError(err)))));
        }

        if let Some(frame) = this.first_frame.take() {
            let frame = this.process_frame(frame);
            this.last_yield = Some(Instant::now());
            return Poll::Ready(Some(Ok(frame)));
        }

        if this.read_start.is_none() {
            this.read_start = Some(Instant::now());
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                if let Some(at) = this.read_start.take() {
                    this.transfer.read_time += at.elapsed();
                }
                this.finish(StreamCopyResult::Success, None, false);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(at) = this.read_start.take() {
                    this.transfer.read_time += at.elapsed();
                }
                let frame = this.process_frame(frame);
                this.last_yield = Some(Instant::now());
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(at) = this.read_start.take() {
                    this.transfer.read_time += at.elapsed();
                }
                let err: Arc<dyn std::error::Error + Send + Sync> = Arc::new(e);
                this.finish(StreamCopyResult::InputError, Some(Arc::clone(&err)), false);
                Poll::Ready(Some(Err(Box::new(SharedError(err)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || (self.first_frame.is_none() && self.inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        let mut hint = self.inner.size_hint();
        if let Some(frame) = &self.first_frame {
            if let Some(data) = frame.data_ref() {
                let extra = data.len() as u64;
                hint.set_lower(hint.lower() + extra);
                if let Some(upper) = hint.upper() {
                    hint.set_upper(upper + extra);
                }
            }
        }
        hint
    }
}

impl Drop for StreamCopyBody {
    fn drop(&mut self) {
        // The consumer walked away mid-transfer (client abort, failed
        // send). Publish a terminal outcome so observers never hang; a
        // genuine cancellation keeps its identity, anything else is an
        // abandonment by the consuming side.
        if !self.finished && self.started.load(Ordering::Acquire) {
            let abandoned = !self.activity.token().is_cancelled();
            self.finish(StreamCopyResult::Canceled, None, abandoned);
        }
    }
}
