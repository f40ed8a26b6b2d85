//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request + chosen destination
//!     → context.rs (snapshot, cancellation, upgrade capability)
//!     → request.rs (body decision, URI, version, header copy)
//!     → transform pipeline
//!     → engine.rs (dispatch via ForwardHttpClient)
//!     → response.rs (filter, transform, prefetch, commit)
//!     → copy subsystem (supervised body movement)
//!     → upgrade.rs when the destination answers 101
//!
//! every failure → error.rs taxonomy + error feature on the response
//! ```
//!
//! # Design Decisions
//! - The engine never errors to its caller; status + error feature are
//!   the whole contract
//! - Routing and destination choice happen outside; the engine receives
//!   exactly one destination prefix

pub mod context;
pub mod engine;
pub mod error;
pub mod headers;
pub mod request;
pub mod response;
pub mod upgrade;

pub use context::{BoxedDuplex, ForwardDestination, InboundSnapshot, RequestContext, UpgradeHandle};
pub use engine::HttpForwarder;
pub use error::{error_feature, ErrorFeature, ErrorSlot, ForwardErrorKind};
pub use headers::is_hop_by_hop;
pub use response::ReasonPhrase;
