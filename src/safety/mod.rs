//! Safety and cleanup
//!
//! Ensures every execution returns the host to its baseline: no jail
//! directory, no mounts, no cgroup scope left behind.

pub mod cleanup;

pub use cleanup::{BaselineChecker, CleanupGuard, CleanupManager, ResourceType};
