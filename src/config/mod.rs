//! Configuration
//!
//! Shared types, error taxonomy, and JSON configuration loading.

pub mod loader;
pub mod types;

pub use loader::{CacheConfig, S3Config, SandboxConfig};
