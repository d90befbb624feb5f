pub mod config;
pub mod model;

pub use config::{AuthConfig, AutoscaleConfig, DriverConfig, ProxyConfig, RunnerConfig};
pub use model::*;
