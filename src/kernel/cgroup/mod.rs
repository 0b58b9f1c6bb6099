//! Cgroup resource governance
//!
//! Per-execution cgroup v2 scopes carrying the memory ceiling.

pub mod backend;
pub mod v2;

pub use backend::{detect_cgroup_v2, CgroupBackend};
pub use v2::CgroupV2;
