//! Filesystem isolation and mount management
//!
//! Builds the per-execution jail and binds host directories into it with
//! tracking for deterministic teardown.

pub mod bind;
pub mod jail;

pub use bind::MountSet;
pub use jail::Jail;
