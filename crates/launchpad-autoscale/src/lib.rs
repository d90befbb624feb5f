//! launchpad-autoscale: request-driven replica scaling.
//!
//! Access events flow from the proxy and the metrics endpoint through a
//! bounded channel into the store. The decision loop drains the store on
//! every tick and sizes each service for the concurrency it observed.
//!
//! ```text
//! desired = clamp(ceil(active_requests / concurrency), min, max)
//! ```
//!
//! A window without requests drains as zero and scales a service down to
//! its minimum, possibly zero.

pub mod compaction;
pub mod ingest;
pub mod scaler;

pub use compaction::{compact_until_done, run_compaction};
pub use ingest::{spawn_workers, AccessReceiver, AccessRecorder};
pub use scaler::Autoscaler;
