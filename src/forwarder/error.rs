//! Failure taxonomy for forwarded requests.
//!
//! Every failure the engine can hit maps to exactly one kind, keyed off
//! the request's state when the error occurred and the side that failed.
//! Upstream layers read the kind to pick a status code and error
//! metadata; the engine itself never propagates an error to its caller.

use std::fmt;
use std::sync::{Arc, OnceLock};

/// Closed set of forwarding failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardErrorKind {
    /// No failure.
    None,
    /// The HTTP client failed before response headers arrived.
    Request,
    /// The request was canceled before response headers arrived.
    RequestCanceled,
    /// The request body upload was canceled.
    RequestBodyCanceled,
    /// Reading the request body from the client failed.
    RequestBodyClient,
    /// Writing the request body to the destination failed.
    RequestBodyDestination,
    /// The response body transfer was canceled.
    ResponseBodyCanceled,
    /// Writing the response body to the client failed.
    ResponseBodyClient,
    /// Reading the response body from the destination failed.
    ResponseBodyDestination,
    /// The client→destination upgrade pump was canceled.
    UpgradeRequestCanceled,
    /// The client→destination upgrade pump failed on the client side.
    UpgradeRequestClient,
    /// The client→destination upgrade pump failed on the destination side.
    UpgradeRequestDestination,
    /// The destination→client upgrade pump was canceled.
    UpgradeResponseCanceled,
    /// The destination→client upgrade pump failed on the client side.
    UpgradeResponseClient,
    /// The destination→client upgrade pump failed on the destination side.
    UpgradeResponseDestination,
}

impl ForwardErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardErrorKind::None => "none",
            ForwardErrorKind::Request => "request",
            ForwardErrorKind::RequestCanceled => "request_canceled",
            ForwardErrorKind::RequestBodyCanceled => "request_body_canceled",
            ForwardErrorKind::RequestBodyClient => "request_body_client",
            ForwardErrorKind::RequestBodyDestination => "request_body_destination",
            ForwardErrorKind::ResponseBodyCanceled => "response_body_canceled",
            ForwardErrorKind::ResponseBodyClient => "response_body_client",
            ForwardErrorKind::ResponseBodyDestination => "response_body_destination",
            ForwardErrorKind::UpgradeRequestCanceled => "upgrade_request_canceled",
            ForwardErrorKind::UpgradeRequestClient => "upgrade_request_client",
            ForwardErrorKind::UpgradeRequestDestination => "upgrade_request_destination",
            ForwardErrorKind::UpgradeResponseCanceled => "upgrade_response_canceled",
            ForwardErrorKind::UpgradeResponseClient => "upgrade_response_client",
            ForwardErrorKind::UpgradeResponseDestination => "upgrade_response_destination",
        }
    }

    /// True for the kinds caused by the client side of the exchange.
    /// These surface as 400 rather than 502 when headers are still open.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, ForwardErrorKind::RequestBodyClient)
    }
}

impl fmt::Display for ForwardErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure metadata attached to the inbound response for downstream
/// middleware to inspect.
#[derive(Clone)]
pub struct ErrorFeature {
    pub kind: ForwardErrorKind,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Debug for ErrorFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorFeature")
            .field("kind", &self.kind)
            .field("source", &self.source.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Single-assignment slot for the error feature. Shared between the
/// engine and the body pumps, which may fail long after the response
/// headers went out; the first failure wins.
#[derive(Default)]
pub struct ErrorSlot(OnceLock<ErrorFeature>);

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(
        &self,
        kind: ForwardErrorKind,
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    ) {
        let _ = self.0.set(ErrorFeature { kind, source });
    }

    /// The recorded failure, if any.
    pub fn get(&self) -> Option<ErrorFeature> {
        self.0.get().cloned()
    }

    /// The recorded failure kind, or `None` if the request succeeded.
    pub fn kind(&self) -> ForwardErrorKind {
        self.0
            .get()
            .map(|f| f.kind)
            .unwrap_or(ForwardErrorKind::None)
    }
}

/// Read the error feature off a forwarded response.
pub fn error_feature<B>(response: &http::Response<B>) -> Option<ErrorFeature> {
    response
        .extensions()
        .get::<Arc<ErrorSlot>>()
        .and_then(|slot| slot.get())
}
