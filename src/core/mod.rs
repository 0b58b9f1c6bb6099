//! Script orchestration above the sandbox.
//!
//! Core owns the content-addressed flow: upload a script, fetch it back by
//! digest, hand it to an executor.

pub mod runner;

pub use runner::{ScriptExecutor, ScriptRunner, Upload};
