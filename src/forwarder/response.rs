//! Response assembly.
//!
//! # Responsibilities
//! - Filter and transform destination response headers
//! - Carry the reason phrase across (as an extension; `http::Response`
//!   does not model reason phrases)
//! - Prefetch the first body frame so pre-commit failures can still
//!   synthesize a clean 502
//! - Synthesize error responses for pre-commit failures

use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use http::header::HeaderMap;
use http::{Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;

use crate::copy::activity::ActivityTimeoutToken;
use crate::forwarder::error::ErrorSlot;
use crate::forwarder::headers::copy_headers;
use crate::transform::{ResponseTransformContext, TransformPipeline};
use crate::BoxError;

/// Reason phrase of the destination response, relayed verbatim as a
/// typed extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(pub String);

/// Outcome of pulling the first frame of the destination body before
/// committing response headers.
pub(crate) enum FirstFrame {
    /// The body was empty.
    Eof,
    /// The body produced a frame; seed the supervised passthrough.
    Frame(Frame<Bytes>),
    /// The destination failed before any byte reached the client.
    Failed(BoxError),
    /// Cancellation or inactivity fired first.
    Canceled,
}

/// Pull exactly one frame under activity supervision.
pub(crate) async fn prefetch_first_frame(
    body: &mut Body,
    activity: &ActivityTimeoutToken,
) -> FirstFrame {
    tokio::select! {
        _ = activity.token().cancelled() => FirstFrame::Canceled,
        frame = body.frame() => match frame {
            None => FirstFrame::Eof,
            Some(Ok(frame)) => FirstFrame::Frame(frame),
            Some(Err(e)) => FirstFrame::Failed(Box::new(e)),
        },
    }
}

/// Filter the destination's headers through the hop-by-hop set and run
/// the response transforms that apply to a relayed response.
pub(crate) fn build_response_headers(
    src: &HeaderMap,
    status: StatusCode,
    transforms: &TransformPipeline,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    copy_headers(src, &mut headers);
    transforms.apply_response(&mut ResponseTransformContext {
        status,
        headers: &mut headers,
        success: true,
    });
    headers
}

/// Build a bodiless error response for a failure that happened before
/// the response headers were committed. Only `Always` transforms run.
pub(crate) fn synthesize_error_response(
    status: StatusCode,
    transforms: &TransformPipeline,
    slot: Arc<ErrorSlot>,
) -> Response<Body> {
    let mut headers = HeaderMap::new();
    transforms.apply_response(&mut ResponseTransformContext {
        status,
        headers: &mut headers,
        success: false,
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response.extensions_mut().insert(slot);
    response
}
