//! Execution control
//!
//! Orchestrates kernel primitives into a supervised, traced execution with
//! type-state enforcement of the pause, assign, release ordering.

pub mod launch;
pub mod lifecycle;
pub mod supervisor;

pub use lifecycle::{GroupAssigned, Released, Started, TracedProcess};
pub use supervisor::{LifecycleProbe, Supervisor};
