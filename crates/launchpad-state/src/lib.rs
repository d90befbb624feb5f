//! launchpad-state: embedded autoscale store for the Launchpad runner.
//!
//! Backed by [redb](https://docs.rs/redb). Holds one
//! `ActiveRequestRecord` per service identity: the ingestion workers add to
//! it, the decision loop drains it. The file is a cache; deleting it loses
//! at most one scaling window of observations.
//!
//! `ScaleStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::ScaleStore;
pub use types::*;
