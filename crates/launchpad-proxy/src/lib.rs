//! launchpad-proxy: cold-start proxy for scaled-to-zero services.
//!
//! A scaled-to-zero virtual service points at this proxy and tags each
//! request with `x-og-*` headers naming the original destination. The proxy
//! scales the service up, waits for a ready replica and forwards the
//! request, retrying while the mesh still answers 404 or 503.

pub mod debounce;
pub mod forward;
pub mod headers;

pub use debounce::Debouncer;
pub use forward::{router, ProxyState};
pub use headers::{RoutingError, RoutingHeaders};
