//! Hop-by-hop header filtering and header copying.
//!
//! # Design Decisions
//! - The filter set is fixed at compile time
//! - Any `:`-prefixed name is refused defensively, whatever the inbound
//!   HTTP version
//! - `Host` is cleared by default; a transform restores it when wanted

use http::header::{HeaderMap, HeaderName, CONNECTION, HOST, UPGRADE};

/// Headers whose scope is a single network hop. Never forwarded.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// True when the header may be copied to the other side of the proxy.
fn is_forwardable(name: &HeaderName) -> bool {
    !is_hop_by_hop(name) && !name.as_str().starts_with(':') && *name != HOST
}

/// Copy every forwardable header, preserving multi-value order.
pub fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src {
        if is_forwardable(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Re-add the upgrade negotiation headers a 101 response needs after the
/// hop-by-hop filter stripped them.
pub fn restore_upgrade_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    if let Some(value) = src.get(UPGRADE) {
        dst.insert(UPGRADE, value.clone());
    }
    dst.insert(CONNECTION, http::HeaderValue::from_static("upgrade"));
}
