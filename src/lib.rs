//! tamarun: run untrusted scripts in a disposable jail
//! Each script gets its own chroot, read-only host mounts, fresh namespaces and a cgroup v2 memory ceiling
//!
//! # Architecture
//!
//! This crate is organized by Linux kernel primitive families:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: UTS, PID, mount, network and user namespaces, id maps
//! - [`kernel::cgroup`]: Per-execution cgroup v2 scope with a memory ceiling
//! - [`kernel::mount`]: Jail directory and read-only bind mounts
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launch`]: clone + chroot + PTRACE_TRACEME, stopping at exec
//! - [`exec::lifecycle`]: Type-state ordering of pause, assign, release, wait
//! - [`exec::supervisor`]: One execution end to end
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::cleanup`]: Resource ledger released in reverse on every path
//!
//! ## Scripts ([`store`], [`core`])
//! - [`store`]: Content digests, cache state and blob storage
//! - [`core::runner`]: Upload, fetch by digest, execute
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: `tamarun.json` loading and validation
//! - [`config::types`]: Shared type definitions and the error enum
//!
//! # Guarantees
//!
//! 1. **Paused before limited** - the interpreter runs no instruction before it joins its cgroup
//! 2. **Nothing leaks** - jail, mounts and cgroup are gone after every run
//! 3. **Types prevent errors** - releasing an unassigned process does not compile

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Script orchestration
pub mod core;

// Content-addressed storage
pub mod store;

// Safety & Cleanup
pub mod safety;

// Configuration
pub mod config;

// CLI entrypoint wiring for the tamarun binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use exec::Supervisor;
