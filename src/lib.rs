//! Relay Core — HTTP Reverse Proxy Forwarding Engine
//!
//! The request-forwarding core of a reverse proxy, plus the periodic
//! scheduler that drives control loops such as destination health probing.
//! Routing, load balancing, configuration-driven hosting, and TLS live in
//! the layers above; this crate owns the path a single request takes from
//! acceptance to completion.
//!
//! # Architecture Overview
//!
//! ```text
//!   inbound request
//!        │
//!        ▼
//!   ┌──────────────┐   ┌───────────────┐   ┌─────────────────┐
//!   │  forwarder   │──▶│  transform    │──▶│  outbound HTTP  │
//!   │  (builders,  │   │  pipeline     │   │  client         │
//!   │   dispatch)  │   └───────────────┘   └────────┬────────┘
//!   └──────┬───────┘                                │
//!          │          ┌───────────────┐             │
//!          ├─────────▶│  copy         │◀────────────┘
//!          │          │  (body pumps, │
//!          │          │   activity    │
//!          │          │   timeouts)   │
//!          ▼          └───────────────┘
//!   inbound response
//!
//!   ┌──────────────────────────────────────────────────────┐
//!   │               Cross-Cutting Concerns                 │
//!   │  ┌─────────┐ ┌───────────┐ ┌───────────┐ ┌────────┐ │
//!   │  │ config  │ │ telemetry │ │ scheduler │ │ client │ │
//!   │  └─────────┘ └───────────┘ └───────────┘ └────────┘ │
//!   └──────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod client;
pub mod config;
pub mod copy;
pub mod forwarder;
pub mod transform;

// Control loops
pub mod scheduler;

// Cross-cutting concerns
pub mod telemetry;

/// Boxed error type used at subsystem boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use client::{ForwardHttpClient, HyperForwardClient};
pub use config::ProxyCoreConfig;
pub use forwarder::{ForwardErrorKind, HttpForwarder, RequestContext};
pub use scheduler::{ActionScheduler, SchedulerMode};
