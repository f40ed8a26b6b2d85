//! Outbound request construction.
//!
//! # Responsibilities
//! - Decide whether the outbound request carries a body
//! - Compose the target URI from the destination prefix
//! - Pick the outbound HTTP version
//! - Copy headers under the hop-by-hop filter and run request transforms

use http::header::{HeaderMap, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use http::{Method, Uri, Version};

use crate::forwarder::context::{ForwardDestination, InboundSnapshot};
use crate::forwarder::headers::copy_headers;
use crate::transform::{RequestTransformContext, TransformPipeline};

/// Head of the outbound request; the engine attaches the body.
pub(crate) struct OutboundHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// Methods that carry no body unless headers say otherwise. The
/// comparison is case-insensitive so a custom `get` method still counts.
fn is_bodyless_method(method: &Method) -> bool {
    let m = method.as_str();
    m.eq_ignore_ascii_case("GET") || m.eq_ignore_ascii_case("HEAD") || m.eq_ignore_ascii_case("TRACE")
}

fn advertises_body(headers: &HeaderMap) -> bool {
    let declared_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_length.is_some_and(|n| n > 0) {
        return true;
    }

    headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
    })
}

/// Whether the outbound request needs a body. POST/PATCH/PUT/DELETE and
/// any custom method always upload one; GET/HEAD/TRACE only when the
/// inbound advertises content (a zero-length advertisement is not a
/// body indicator).
pub(crate) fn needs_outbound_body(method: &Method, headers: &HeaderMap) -> bool {
    advertises_body(headers) || !is_bodyless_method(method)
}

/// Whether the inbound request asks for a protocol switch.
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
}

/// Outbound HTTP version: 2.0 normally, 1.1 when the inbound is
/// upgrade-eligible (upgrades are an HTTP/1.1 mechanism).
pub(crate) fn outbound_version(upgrade_eligible: bool) -> Version {
    if upgrade_eligible {
        Version::HTTP_11
    } else {
        Version::HTTP_2
    }
}

/// Join the destination prefix with the inbound path (minus path-base)
/// and query, verbatim: no re-encoding, a single `/` at the seam.
pub(crate) fn build_target_uri(
    destination: &Uri,
    path_base: Option<&str>,
    inbound: &Uri,
) -> Result<Uri, http::uri::InvalidUri> {
    let mut target = destination.to_string();
    if target.ends_with('/') {
        target.pop();
    }

    let path = inbound.path();
    let remaining = match path_base {
        Some(base) if !base.is_empty() => path.strip_prefix(base).unwrap_or(path),
        _ => path,
    };
    if !remaining.is_empty() && !remaining.starts_with('/') {
        target.push('/');
    }
    target.push_str(remaining);

    if let Some(query) = inbound.query() {
        target.push('?');
        target.push_str(query);
    }

    target.parse()
}

/// Build the outbound request head: URI, version, filtered headers, and
/// the transform pipeline's output.
pub(crate) fn build_outbound_head(
    snapshot: &InboundSnapshot,
    destination: &ForwardDestination,
    transforms: &TransformPipeline,
    upgrade_eligible: bool,
) -> Result<OutboundHead, http::uri::InvalidUri> {
    let mut uri = build_target_uri(
        &destination.prefix,
        snapshot.path_base.as_deref(),
        &snapshot.uri,
    )?;

    let mut headers = HeaderMap::new();
    if transforms.copy_request_headers() {
        copy_headers(&snapshot.headers, &mut headers);
    }

    transforms.apply_request(&mut RequestTransformContext {
        inbound: snapshot,
        headers: &mut headers,
        uri: &mut uri,
    });

    Ok(OutboundHead {
        method: snapshot.method.clone(),
        uri,
        version: outbound_version(upgrade_eligible),
        headers,
    })
}
