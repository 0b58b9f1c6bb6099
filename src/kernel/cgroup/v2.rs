/// Cgroup v2 backend implementation
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::CgroupBackend;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Cgroup v2 backend rooted at a directory of the unified hierarchy
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        CgroupV2 {
            base_path: base_path.into(),
        }
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    /// Make sure child scopes get a `memory.max`; best-effort
    pub fn ensure_memory_controller(&self) {
        let control = self.base_path.join("cgroup.subtree_control");
        let enabled = match fs::read_to_string(&control) {
            Ok(content) => content.split_whitespace().any(|c| c == "memory"),
            Err(e) => {
                log::debug!("Cannot read {}: {}", control.display(), e);
                return;
            }
        };

        if !enabled {
            if let Err(e) = fs::write(&control, "+memory") {
                log::warn!(
                    "Failed to enable memory controller in {}: {}",
                    control.display(),
                    e
                );
            } else {
                log::info!("Enabled memory controller in {}", control.display());
            }
        }
    }

    fn read_u64(path: &Path) -> Result<u64> {
        let content = fs::read_to_string(path).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to read {}: {}", path.display(), e))
        })?;

        content.trim().parse::<u64>().map_err(|e| {
            SandboxError::Cgroup(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);

        fs::create_dir(&path).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        // Kill the whole scope on OOM rather than one task of it
        let oom_group_path = path.join("memory.oom.group");
        if oom_group_path.exists() {
            if let Err(e) = fs::write(&oom_group_path, "1") {
                log::warn!("Failed to set memory.oom.group: {}", e);
            }
        }

        Ok(())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);

        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Cgroup(format!(
                "Failed to remove cgroup {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        let procs_path = self.instance_path(instance_id).join("cgroup.procs");

        fs::write(&procs_path, pid.to_string()).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to attach process {} to cgroup: {}",
                pid, e
            ))
        })?;

        Ok(())
    }

    fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()> {
        let path = self.instance_path(instance_id);

        fs::write(path.join("memory.max"), limit_bytes.to_string())
            .map_err(|e| SandboxError::Cgroup(format!("Failed to set memory limit: {}", e)))?;

        // Without this the kernel may swap instead of enforcing the ceiling
        let swap_path = path.join("memory.swap.max");
        if swap_path.exists() {
            if let Err(e) = fs::write(&swap_path, "0") {
                log::warn!("Failed to disable swap for {}: {}", instance_id, e);
            }
        }

        Ok(())
    }

    fn procs(&self, instance_id: &str) -> Result<Vec<u32>> {
        let procs_path = self.instance_path(instance_id).join("cgroup.procs");
        let content = fs::read_to_string(&procs_path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to read cgroup.procs: {}", e)))?;

        Ok(content
            .split_whitespace()
            .filter_map(|pid| pid.parse::<u32>().ok())
            .collect())
    }

    /// memory.peak (kernel 5.19+) with fallback to memory.current
    fn get_memory_peak(&self, instance_id: &str) -> Result<u64> {
        let path = self.instance_path(instance_id);
        let peak_path = path.join("memory.peak");

        if peak_path.exists() {
            return Self::read_u64(&peak_path);
        }
        Self::read_u64(&path.join("memory.current"))
    }

    fn get_oom_kill_count(&self, instance_id: &str) -> Result<u64> {
        let events_path = self.instance_path(instance_id).join("memory.events");

        if !events_path.exists() {
            return Ok(0);
        }

        let content = fs::read_to_string(&events_path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to read memory.events: {}", e)))?;

        Ok(content
            .lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(key, _)| *key == "oom_kill")
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())
            .unwrap_or(0))
    }

    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }
}
