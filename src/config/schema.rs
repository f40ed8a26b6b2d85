//! Configuration schema definitions.
//!
//! This module defines the configuration structure for the forwarding
//! core. All types derive Serde traits for deserialization from config
//! files; every field has a default so a minimal config works.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the forwarding core.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyCoreConfig {
    /// Forwarding engine settings.
    pub forwarder: ForwarderConfig,

    /// Header/URI transform settings.
    pub transforms: TransformConfig,
}

/// Forwarding engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Inactivity window for body pumps in seconds. A pump with no
    /// completed read or write inside this window is aborted.
    pub activity_timeout_secs: u64,

    /// Inactivity window for upgraded (101) connections in seconds.
    pub upgrade_activity_timeout_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: 100,
            upgrade_activity_timeout_secs: 100,
        }
    }
}

impl ForwarderConfig {
    /// Inactivity window for normal body pumps.
    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }

    /// Inactivity window for upgraded connections.
    pub fn upgrade_activity_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_activity_timeout_secs)
    }
}

/// Transform pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Copy inbound headers to the outbound request (minus hop-by-hop
    /// and pseudo-headers). When false, only transform-added headers go
    /// out; configured `X-Forwarded-*` defaults still apply.
    pub copy_request_headers: bool,

    /// Restore the inbound `Host` header on the outbound request.
    /// By default `Host` is cleared so the client derives it from the
    /// destination URI.
    pub use_original_host: bool,

    /// `X-Forwarded-*` defaults.
    pub x_forwarded: XForwardedConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            copy_request_headers: true,
            use_original_host: false,
            x_forwarded: XForwardedConfig::default(),
        }
    }
}

/// Enable flags for the `X-Forwarded-*` request headers. Values are
/// appended to any inbound value, never overwritten.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct XForwardedConfig {
    /// Append the client IP to `X-Forwarded-For`.
    #[serde(rename = "for")]
    pub client_for: bool,

    /// Append the inbound authority to `X-Forwarded-Host`.
    pub host: bool,

    /// Append the inbound scheme to `X-Forwarded-Proto`.
    pub proto: bool,

    /// Append the stripped path prefix to `X-Forwarded-PathBase`.
    pub path_base: bool,
}

impl XForwardedConfig {
    /// Enable all four headers.
    pub fn all() -> Self {
        Self {
            client_for: true,
            host: true,
            proto: true,
            path_base: true,
        }
    }

    /// True if any header is enabled.
    pub fn any(&self) -> bool {
        self.client_for || self.host || self.proto || self.path_base
    }
}
