//! tiercache - two-tier build cache daemon
//!
//! Answers the build tool's cache requests from a local directory and
//! shares results through the GitHub Actions cache.

pub mod atomic;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flight;
pub mod index;
pub mod local;
pub mod logging;
pub mod protocol;
pub mod remote;

#[cfg(test)]
mod testing;

pub use coordinator::{Coordinator, Lookup};
pub use error::{ProxyError, ProxyResult};
