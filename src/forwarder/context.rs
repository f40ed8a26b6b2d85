//! Per-request context types.
//!
//! # Responsibilities
//! - Snapshot the inbound request for transforms and builders
//! - Carry the chosen destination and its telemetry identifiers
//! - Carry the cancellation tokens and the upgrade capability

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use http::header::HeaderMap;
use http::{Method, Request, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::transform::TransformPipeline;

/// Raw bidirectional byte stream, as produced by a protocol upgrade.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Boxed duplex stream.
pub type BoxedDuplex = Box<dyn DuplexStream>;

type UpgradeFuture = Pin<Box<dyn Future<Output = io::Result<BoxedDuplex>> + Send>>;

/// Deferred access to a raw duplex stream. On the inbound side the host
/// server produces one per upgrade-capable request; on the outbound side
/// the HTTP client attaches one to a 101 response.
///
/// Cloning shares the underlying stream; the first consumer takes it.
#[derive(Clone)]
pub struct UpgradeHandle {
    inner: Arc<Mutex<Option<UpgradeFuture>>>,
}

impl UpgradeHandle {
    /// Wrap a pending hyper upgrade.
    pub fn from_hyper(on_upgrade: hyper::upgrade::OnUpgrade) -> Self {
        Self::from_future(async move {
            match on_upgrade.await {
                Ok(upgraded) => Ok(Box::new(TokioIo::new(upgraded)) as BoxedDuplex),
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        })
    }

    /// Wrap an already-available duplex stream (tests, custom hosts).
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_future(async move { Ok(Box::new(io) as BoxedDuplex) })
    }

    fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = io::Result<BoxedDuplex>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(fut)))),
        }
    }

    /// Resolve to the raw stream. Fails if it was already taken.
    pub(crate) async fn into_stream(self) -> io::Result<BoxedDuplex> {
        let fut = self
            .inner
            .lock()
            .expect("upgrade handle mutex poisoned")
            .take();
        match fut {
            Some(fut) => fut.await,
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "upgrade stream already taken",
            )),
        }
    }
}

/// Read-only snapshot of the inbound request, taken before any outbound
/// mutation happens. Transforms see this exact view no matter where in
/// the pipeline they run.
#[derive(Debug, Clone)]
pub struct InboundSnapshot {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Scheme the client used to reach the proxy.
    pub scheme: String,
    /// Authority the client addressed (URI authority or `Host` header).
    pub authority: Option<String>,
    pub client_addr: Option<SocketAddr>,
    /// Path prefix the host stripped before routing, dropped from the
    /// outbound URI.
    pub path_base: Option<String>,
}

impl InboundSnapshot {
    pub(crate) fn new(
        parts: &http::request::Parts,
        scheme: &str,
        client_addr: Option<SocketAddr>,
        path_base: Option<String>,
    ) -> Self {
        let authority = parts.uri.authority().map(|a| a.to_string()).or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            scheme: scheme.to_string(),
            authority,
            client_addr,
            path_base,
        }
    }
}

/// The upstream target for one request: the base URI plus the routing
/// identifiers telemetry wants to see.
#[derive(Debug, Clone)]
pub struct ForwardDestination {
    /// Base URI; the outbound URI is this prefix joined with the inbound
    /// path (minus path-base) and query.
    pub prefix: Uri,
    pub cluster_id: String,
    pub route_id: String,
    pub destination_id: String,
}

impl ForwardDestination {
    pub fn new(prefix: Uri) -> Self {
        Self {
            prefix,
            cluster_id: String::new(),
            route_id: String::new(),
            destination_id: String::new(),
        }
    }

    pub fn with_ids(
        mut self,
        cluster_id: impl Into<String>,
        route_id: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Self {
        self.cluster_id = cluster_id.into();
        self.route_id = route_id.into();
        self.destination_id = destination_id.into();
        self
    }
}

/// Everything the engine needs to forward one request.
pub struct RequestContext {
    pub request: Request<Body>,
    pub destination: ForwardDestination,
    pub transforms: Arc<TransformPipeline>,
    /// Scheme the client used to reach the proxy (for `X-Forwarded-Proto`).
    pub scheme: String,
    pub client_addr: Option<SocketAddr>,
    /// Path prefix the host stripped before routing.
    pub path_base: Option<String>,
    /// Fires on inbound-connection abort or request-timeout expiry.
    pub request_cancel: CancellationToken,
    /// Fires on inbound-connection abort only.
    pub content_cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(request: Request<Body>, destination: ForwardDestination) -> Self {
        Self {
            request,
            destination,
            transforms: Arc::new(TransformPipeline::default()),
            scheme: "http".to_string(),
            client_addr: None,
            path_base: None,
            request_cancel: CancellationToken::new(),
            content_cancel: CancellationToken::new(),
        }
    }

    pub fn with_transforms(mut self, transforms: Arc<TransformPipeline>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_path_base(mut self, path_base: impl Into<String>) -> Self {
        self.path_base = Some(path_base.into());
        self
    }

    pub fn with_cancellation(
        mut self,
        request_cancel: CancellationToken,
        content_cancel: CancellationToken,
    ) -> Self {
        self.request_cancel = request_cancel;
        self.content_cancel = content_cancel;
        self
    }
}
