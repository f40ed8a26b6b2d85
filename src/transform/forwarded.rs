//! Built-in request transforms: `X-Forwarded-*` defaults and original
//! host restoration.

use http::header::{HeaderName, HeaderValue, HOST};

use crate::config::XForwardedConfig;
use crate::transform::{RequestTransform, RequestTransformContext};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_PATH_BASE: HeaderName = HeaderName::from_static("x-forwarded-pathbase");

/// Appends `X-Forwarded-For` / `-Host` / `-Proto` / `-PathBase` with the
/// inbound connection's values. Existing values are kept; the proxy adds
/// its own observation at the end of the list.
pub struct XForwardedTransform {
    config: XForwardedConfig,
}

impl XForwardedTransform {
    pub fn new(config: XForwardedConfig) -> Self {
        Self { config }
    }
}

impl RequestTransform for XForwardedTransform {
    fn apply(&self, ctx: &mut RequestTransformContext<'_>) {
        if self.config.client_for {
            if let Some(addr) = ctx.inbound.client_addr {
                if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                    ctx.headers.append(X_FORWARDED_FOR, value);
                }
            }
        }
        if self.config.host {
            if let Some(authority) = &ctx.inbound.authority {
                if let Ok(value) = HeaderValue::from_str(authority) {
                    ctx.headers.append(X_FORWARDED_HOST, value);
                }
            }
        }
        if self.config.proto {
            if let Ok(value) = HeaderValue::from_str(&ctx.inbound.scheme) {
                ctx.headers.append(X_FORWARDED_PROTO, value);
            }
        }
        if self.config.path_base {
            if let Some(path_base) = &ctx.inbound.path_base {
                if let Ok(value) = HeaderValue::from_str(path_base) {
                    ctx.headers.append(X_FORWARDED_PATH_BASE, value);
                }
            }
        }
    }
}

/// Restores the inbound `Host` header on the outbound request. Without
/// this transform the engine clears `Host` and the client derives it
/// from the destination URI.
pub struct OriginalHostTransform;

impl RequestTransform for OriginalHostTransform {
    fn apply(&self, ctx: &mut RequestTransformContext<'_>) {
        if let Some(authority) = &ctx.inbound.authority {
            if let Ok(value) = HeaderValue::from_str(authority) {
                ctx.headers.insert(HOST, value);
            }
        }
    }
}
