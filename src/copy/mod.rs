//! Body movement subsystem.
//!
//! # Data Flow
//! ```text
//! request direction:
//!     inbound body ──▶ body.rs (StreamCopyBody, pull-based)
//!         ──▶ outbound HTTP client
//!
//! response direction:
//!     destination body ──▶ body.rs (StreamCopyBody, pull-based)
//!         ──▶ inbound client
//!
//! upgraded (101) connections:
//!     client duplex ◀──▶ copier.rs (StreamCopier × 2, push-based)
//!         ◀──▶ destination duplex
//!
//! supervision (all pumps):
//!     activity.rs — linked cancellation + inactivity deadline,
//!     rearmed by every successful I/O operation
//!     pool.rs — process-wide 64 KiB buffer pool
//! ```
//!
//! # Design Decisions
//! - One activity token per pump, owned for the pump's lifetime
//! - Failure classification is by failing side (input vs output), with
//!   cancellation as its own terminal state

pub mod activity;
pub mod body;
pub mod copier;
pub mod pool;

pub use activity::ActivityTimeoutToken;
pub use body::{CopyOutcome, StreamCopyBody, StreamCopyHandle};
pub use copier::{StreamCopier, StreamCopyResult};
pub use pool::COPY_BUFFER_SIZE;
