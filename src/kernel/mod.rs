//! Thin wrappers around Linux kernel primitives.
//!
//! Dependency direction: mount -> cgroup -> namespace. The process side
//! (clone, ptrace, wait) lives in [`crate::exec`].

pub mod cgroup;
pub mod mount;
pub mod namespace;
