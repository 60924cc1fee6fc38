//! CLI command implementations

pub mod config;
pub mod serve;

pub use config::execute as config;
pub use serve::execute as serve;
