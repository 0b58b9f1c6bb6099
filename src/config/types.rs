/// Core types and structures for the tamarun sandbox
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Unique token naming one execution.
///
/// The id namespaces both the jail directory and the cgroup scope, so two
/// live executions must never share one. Fresh ids come from UUID v4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExecutionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// A single run: consumed once by the supervisor, never persisted.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub id: ExecutionId,
    pub script: String,
}

impl ExecutionRequest {
    /// Create a request with a freshly generated id
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            script: script.into(),
        }
    }

    pub fn with_id(id: ExecutionId, script: impl Into<String>) -> Self {
        Self {
            id,
            script: script.into(),
        }
    }
}

/// Lifecycle states of the traced interpreter process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    /// Stopped by the kernel at exec, before any interpreter instruction ran
    Started,
    GroupAssigned,
    Released,
    Exited,
    Failed,
}

/// How the interpreter process terminated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

impl ExitKind {
    pub fn success(&self) -> bool {
        matches!(self, ExitKind::Exited(0))
    }

    /// Shell-style exit code: 128+signal for signals, 124 for timeouts
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitKind::Exited(code) => *code,
            ExitKind::Signaled(sig) => 128 + sig,
            ExitKind::TimedOut => 124,
        }
    }
}

/// Result of a completed execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub id: ExecutionId,
    pub pid: i32,
    pub status: ExitKind,
    /// False when the run went ahead without its memory ceiling
    pub memory_limited: bool,
    /// OOM kills recorded by the cgroup, when it could be read
    pub oom_kills: Option<u64>,
    /// Peak memory of the scope in bytes, when it could be read
    pub memory_peak_bytes: Option<u64>,
    pub wall_time_ms: u64,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }
}

/// What to do when the memory ceiling cannot be put in place
/// (cgroup creation, `memory.max` write, or `cgroup.procs` write failed)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitFailurePolicy {
    /// Fail the run; a paused process is killed before it executes anything
    #[default]
    Abort,
    /// Continue without the memory ceiling
    Proceed,
}

/// Host directory exposed read-only inside the jail
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    /// Source directory on the host
    pub source: PathBuf,
    /// Target inside the jail; defaults to the source path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Skip silently when the source does not exist on this host
    #[serde(default)]
    pub optional: bool,
}

impl MountBinding {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: None,
            optional: false,
        }
    }

    pub fn optional(source: impl Into<PathBuf>) -> Self {
        Self {
            optional: true,
            ..Self::new(source)
        }
    }

    /// Absolute target path as seen from inside the jail
    pub fn jail_target(&self) -> &Path {
        self.target.as_deref().unwrap_or(&self.source)
    }

    /// Parse a binding from "source", "source=target" or "source=target:optional"
    pub fn parse(binding_str: &str) -> Result<Self> {
        let (path_part, options) = match binding_str.split_once(':') {
            Some((paths, options)) => (paths, options),
            None => (binding_str, ""),
        };

        let (source, target) = match path_part.split_once('=') {
            Some((source, target)) => {
                if source.is_empty() || target.is_empty() || target.contains('=') {
                    return Err(SandboxError::Config(format!(
                        "Invalid mount binding '{}'. Use: source or source=target[:optional]",
                        binding_str
                    )));
                }
                (PathBuf::from(source), Some(PathBuf::from(target)))
            }
            None => (PathBuf::from(path_part), None),
        };

        let mut optional = false;
        for option in options.split(',') {
            match option.trim() {
                "optional" | "maybe" => optional = true,
                "ro" | "" => {}
                other => {
                    return Err(SandboxError::Config(format!(
                        "Unknown mount binding option: {}",
                        other
                    )))
                }
            }
        }

        let binding = MountBinding {
            source,
            target,
            optional,
        };
        binding.validate()?;
        Ok(binding)
    }

    /// Both ends must be absolute and the target must stay inside the jail
    pub fn validate(&self) -> Result<()> {
        if !self.source.is_absolute() {
            return Err(SandboxError::Config(format!(
                "Mount source must be absolute: {}",
                self.source.display()
            )));
        }

        let target = self.jail_target();
        if !target.is_absolute() {
            return Err(SandboxError::Config(format!(
                "Mount target must be absolute: {}",
                target.display()
            )));
        }
        if target
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SandboxError::Config(format!(
                "Mount target escapes the jail: {}",
                target.display()
            )));
        }
        if target == Path::new("/") {
            return Err(SandboxError::Config(
                "Mount target cannot be the jail root".to_string(),
            ));
        }

        Ok(())
    }
}

/// Error types for the sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Jail setup failed at {path}: {source}")]
    Jail {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bind mount of {path} failed: {reason}")]
    Mount { path: PathBuf, reason: String },

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Ptrace error: {0}")]
    Ptrace(String),

    #[error("Wait error: {0}")]
    Wait(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lifecycle probe rejected {state:?}: {reason}")]
    Probe { state: ProcessState, reason: String },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_ids_are_unique() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_exit_kind_codes() {
        assert!(ExitKind::Exited(0).success());
        assert!(!ExitKind::Exited(1).success());
        assert!(!ExitKind::Signaled(9).success());
        assert_eq!(ExitKind::Exited(3).exit_code(), 3);
        assert_eq!(ExitKind::Signaled(9).exit_code(), 137);
        assert_eq!(ExitKind::TimedOut.exit_code(), 124);
    }

    #[test]
    fn test_mount_binding_parse() {
        let plain = MountBinding::parse("/usr").unwrap();
        assert_eq!(plain.source, PathBuf::from("/usr"));
        assert_eq!(plain.jail_target(), Path::new("/usr"));
        assert!(!plain.optional);

        let mapped = MountBinding::parse("/opt/python=/usr/local:optional").unwrap();
        assert_eq!(mapped.jail_target(), Path::new("/usr/local"));
        assert!(mapped.optional);
    }

    #[test]
    fn test_mount_binding_rejects_bad_input() {
        assert!(MountBinding::parse("usr").is_err());
        assert!(MountBinding::parse("/usr=/../etc").is_err());
        assert!(MountBinding::parse("/usr=/").is_err());
        assert!(MountBinding::parse("/usr:rw").is_err());
        assert!(MountBinding::parse("=/usr").is_err());
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&LimitFailurePolicy::Proceed).unwrap();
        assert_eq!(json, "\"proceed\"");
        let parsed: LimitFailurePolicy = serde_json::from_str("\"abort\"").unwrap();
        assert_eq!(parsed, LimitFailurePolicy::Abort);
    }
}
