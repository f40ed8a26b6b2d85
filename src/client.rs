//! Outbound HTTP client contract and the hyper-backed implementation.
//!
//! # Responsibilities
//! - Define what the engine needs from an HTTP client: a single send
//!   that supports full-duplex streaming and surfaces upgrades
//! - Provide a pooled hyper client as the production implementation
//!
//! # Design Decisions
//! - A 101 response carries its raw duplex as a pending-upgrade
//!   extension, mirroring how hyper itself hands out upgrades
//! - The engine owns cancellation; the client just sends

use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::BoxError;

/// Sends one outbound request and returns the destination's response.
///
/// Implementations must support full-duplex streaming: the response
/// (headers and body) must become available while the request body is
/// still being written. On a 101 response the raw duplex stream must be
/// reachable through the response extensions, either as an
/// [`UpgradeHandle`](crate::forwarder::UpgradeHandle) or as hyper's
/// `OnUpgrade`.
pub trait ForwardHttpClient: Send + Sync {
    fn send(
        &self,
        request: Request<Body>,
    ) -> impl Future<Output = Result<Response<Body>, BoxError>> + Send;
}

/// Production client over the pooled hyper client, shared safely across
/// concurrent requests.
#[derive(Clone)]
pub struct HyperForwardClient {
    inner: Client<HttpConnector, Body>,
}

impl HyperForwardClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        connector.set_nodelay(true);

        let inner = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        Self { inner }
    }

    /// The engine's preferred version is advisory; the real version is
    /// negotiated per connection. Plain-scheme HTTP/2 preferences are
    /// downgraded so the pooled client does not reject them outright.
    fn effective_version(uri: &Uri, version: Version) -> Version {
        match version {
            Version::HTTP_2 if uri.scheme_str() == Some("http") => Version::HTTP_11,
            other => other,
        }
    }
}

impl Default for HyperForwardClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardHttpClient for HyperForwardClient {
    fn send(
        &self,
        mut request: Request<Body>,
    ) -> impl Future<Output = Result<Response<Body>, BoxError>> + Send {
        let inner = self.inner.clone();
        async move {
            *request.version_mut() = Self::effective_version(request.uri(), request.version());

            let response = inner.request(request).await.map_err(|e| Box::new(e) as BoxError)?;
            // Extensions survive the body swap, so a pending hyper
            // upgrade on a 101 stays reachable for the engine.
            Ok(response.map(Body::new))
        }
    }
}
