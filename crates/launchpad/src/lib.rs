//! launchpad: the runner process, as a library for the binary and tests.

pub mod runner;

pub use runner::{run, Runner};
