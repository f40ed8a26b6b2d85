//! Header/URI transform model.
//!
//! # Data Flow
//! ```text
//! outbound request construction:
//!     header copy (hop-by-hop filtered)
//!     → request transforms, in registration order
//!     → outbound headers + URI final
//!
//! response assembly:
//!     header copy (hop-by-hop filtered)
//!     → response transforms (Always ∪ Success, by outcome)
//!
//! end of response body:
//!     trailer transforms over the trailer header bag
//! ```
//!
//! # Design Decisions
//! - Transforms are synchronous and immutable after pipeline
//!   construction, so a pipeline is safe to share across requests
//! - Order-sensitive: each transform sees the output of the previous one
//! - Closures implement the transform traits directly

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Uri};

use crate::config::TransformConfig;
use crate::forwarder::context::InboundSnapshot;

pub mod forwarded;

pub use forwarded::{OriginalHostTransform, XForwardedTransform};

/// Mutable view of the outbound request under construction.
pub struct RequestTransformContext<'a> {
    /// Snapshot of the inbound request (read-only).
    pub inbound: &'a InboundSnapshot,
    /// Outbound request headers.
    pub headers: &'a mut HeaderMap,
    /// Outbound request URI.
    pub uri: &'a mut Uri,
}

/// Mutable view of the response being assembled for the client.
pub struct ResponseTransformContext<'a> {
    /// Status of the response going to the client.
    pub status: StatusCode,
    /// Response headers.
    pub headers: &'a mut HeaderMap,
    /// False when the engine is synthesizing an error response instead
    /// of relaying the destination's.
    pub success: bool,
}

/// Mutates the outbound request.
pub trait RequestTransform: Send + Sync {
    fn apply(&self, ctx: &mut RequestTransformContext<'_>);
}

/// Mutates the response headed back to the client.
pub trait ResponseTransform: Send + Sync {
    fn apply(&self, ctx: &mut ResponseTransformContext<'_>);
}

/// Mutates the response trailer bag after the body transfer ends.
pub trait TrailerTransform: Send + Sync {
    fn apply(&self, trailers: &mut HeaderMap);
}

impl<F> RequestTransform for F
where
    F: Fn(&mut RequestTransformContext<'_>) + Send + Sync,
{
    fn apply(&self, ctx: &mut RequestTransformContext<'_>) {
        self(ctx)
    }
}

impl<F> ResponseTransform for F
where
    F: Fn(&mut ResponseTransformContext<'_>) + Send + Sync,
{
    fn apply(&self, ctx: &mut ResponseTransformContext<'_>) {
        self(ctx)
    }
}

impl<F> TrailerTransform for F
where
    F: Fn(&mut HeaderMap) + Send + Sync,
{
    fn apply(&self, trailers: &mut HeaderMap) {
        self(trailers)
    }
}

/// When a response transform runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCondition {
    /// Only when the destination's response is being relayed.
    Success,
    /// On every response, including synthesized error responses.
    Always,
}

/// Ordered, immutable transform sequence applied to every request the
/// engine forwards.
pub struct TransformPipeline {
    copy_request_headers: bool,
    request: Vec<Box<dyn RequestTransform>>,
    response: Vec<(ResponseCondition, Box<dyn ResponseTransform>)>,
    trailer: Vec<Box<dyn TrailerTransform>>,
}

impl TransformPipeline {
    pub fn builder() -> TransformPipelineBuilder {
        TransformPipelineBuilder::new()
    }

    /// Build a pipeline from configuration: header-copy suppression,
    /// original-host restoration, and `X-Forwarded-*` defaults.
    pub fn from_config(config: &TransformConfig) -> Self {
        let mut builder = Self::builder().copy_request_headers(config.copy_request_headers);
        if config.use_original_host {
            builder = builder.request(OriginalHostTransform);
        }
        if config.x_forwarded.any() {
            builder = builder.request(XForwardedTransform::new(config.x_forwarded.clone()));
        }
        builder.build()
    }

    pub(crate) fn copy_request_headers(&self) -> bool {
        self.copy_request_headers
    }

    pub(crate) fn apply_request(&self, ctx: &mut RequestTransformContext<'_>) {
        for transform in &self.request {
            transform.apply(ctx);
        }
    }

    pub(crate) fn apply_response(&self, ctx: &mut ResponseTransformContext<'_>) {
        for (condition, transform) in &self.response {
            if ctx.success || *condition == ResponseCondition::Always {
                transform.apply(ctx);
            }
        }
    }

    pub(crate) fn apply_trailers(&self, trailers: &mut HeaderMap) {
        for transform in &self.trailer {
            transform.apply(trailers);
        }
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::from_config(&TransformConfig::default())
    }
}

/// Builder for [`TransformPipeline`].
pub struct TransformPipelineBuilder {
    copy_request_headers: bool,
    request: Vec<Box<dyn RequestTransform>>,
    response: Vec<(ResponseCondition, Box<dyn ResponseTransform>)>,
    trailer: Vec<Box<dyn TrailerTransform>>,
}

impl TransformPipelineBuilder {
    fn new() -> Self {
        Self {
            copy_request_headers: true,
            request: Vec::new(),
            response: Vec::new(),
            trailer: Vec::new(),
        }
    }

    /// Copy inbound headers by default (true) or start from an empty
    /// outbound header set (false).
    pub fn copy_request_headers(mut self, copy: bool) -> Self {
        self.copy_request_headers = copy;
        self
    }

    /// Append a request transform.
    pub fn request<T: RequestTransform + 'static>(mut self, transform: T) -> Self {
        self.request.push(Box::new(transform));
        self
    }

    /// Append a response transform with a run condition.
    pub fn response<T: ResponseTransform + 'static>(
        mut self,
        condition: ResponseCondition,
        transform: T,
    ) -> Self {
        self.response.push((condition, Box::new(transform)));
        self
    }

    /// Append a trailer transform.
    pub fn trailer<T: TrailerTransform + 'static>(mut self, transform: T) -> Self {
        self.trailer.push(Box::new(transform));
        self
    }

    pub fn build(self) -> TransformPipeline {
        TransformPipeline {
            copy_request_headers: self.copy_request_headers,
            request: self.request,
            response: self.response,
            trailer: self.trailer,
        }
    }
}

/// Append a value to a header, keeping any existing values.
pub fn append_header(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    headers.append(name, value);
}

/// Replace every value of a header.
pub fn set_header(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    headers.insert(name, value);
}

/// Remove every value of a header.
pub fn remove_header(headers: &mut HeaderMap, name: &HeaderName) {
    headers.remove(name);
}
