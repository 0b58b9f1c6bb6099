//! Execution supervisor.
//!
//! Drives one execution end to end: jail, mounts, cgroup scope, traced
//! spawn, cgroup assignment, release, wait. All host resources go through a
//! [`CleanupGuard`] created before the first of them exists, so teardown
//! runs on every exit path.

use crate::config::loader::SandboxConfig;
use crate::config::types::{
    ExecutionId, ExecutionOutcome, ExecutionRequest, ExitKind, LimitFailurePolicy, ProcessState,
    Result, SandboxError,
};
use crate::exec::launch::{spawn_traced, LaunchSpec};
use crate::exec::lifecycle::{GroupAssigned, Started, TracedProcess};
use crate::kernel::cgroup::{detect_cgroup_v2, CgroupBackend, CgroupV2};
use crate::kernel::mount::{Jail, MountSet};
use crate::kernel::namespace::NamespaceIsolation;
use crate::safety::{BaselineChecker, CleanupGuard, ResourceType};
use nix::unistd::{getgid, getuid, Gid, Uid};
use std::sync::Arc;
use std::time::Instant;

/// Observer of lifecycle transitions.
///
/// Returning an error aborts the execution at that point, which lets tests
/// inspect host state mid-run and inject faults.
pub trait LifecycleProbe: Send + Sync {
    fn on_transition(&self, state: ProcessState, pid: Option<i32>) -> std::result::Result<(), String>;
}

/// Runs scripts in isolated, memory-limited jails
pub struct Supervisor {
    config: SandboxConfig,
    namespaces: NamespaceIsolation,
    cgroup: Arc<dyn CgroupBackend>,
    probe: Option<Arc<dyn LifecycleProbe>>,
    host_uid: Uid,
    host_gid: Gid,
}

impl Supervisor {
    /// Supervisor backed by the cgroup v2 hierarchy at `config.cgroup_root`
    pub fn new(mut config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        config.canonicalize_jail_root()?;

        if !detect_cgroup_v2(&config.cgroup_root) {
            log::warn!(
                "{} is not a cgroup v2 hierarchy; memory limits will fail",
                config.cgroup_root.display()
            );
        }
        let cgroup = CgroupV2::new(config.cgroup_root.clone());
        cgroup.ensure_memory_controller();

        Ok(Self::with_backend(config, Arc::new(cgroup)))
    }

    /// Supervisor with an explicit cgroup backend; the config is otherwise
    /// trusted as given
    pub fn with_backend(mut config: SandboxConfig, cgroup: Arc<dyn CgroupBackend>) -> Self {
        // An unresolvable root fails later in Jail::build with the real error
        if let Err(e) = config.canonicalize_jail_root() {
            log::warn!("{}", e);
        }
        log::debug!(
            "Supervisor using {} backend, jails under {}",
            cgroup.backend_name(),
            config.jail_root.display()
        );
        let namespaces = NamespaceIsolation::new_default(config.hostname.clone());
        Self {
            config,
            namespaces,
            cgroup,
            probe: None,
            host_uid: getuid(),
            host_gid: getgid(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LifecycleProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one script and tear down everything it created
    pub fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        let id = request.id;
        log::info!("Starting execution {}", id);

        let mut guard = CleanupGuard::new(id.to_string());
        let result = self.execute(&request, &mut guard);

        if let Err(e) = &result {
            log::error!("Execution {} failed: {}", id, e);
            // The run already failed; the probe cannot make it worse
            let _ = self.notify(ProcessState::Failed, None);
        }

        for leftover in guard.finish() {
            log::error!("Execution {}: {}", id, leftover);
        }

        if self.config.verify_teardown {
            let checker = BaselineChecker::new(&self.config.jail_root, &self.config.cgroup_root);
            if let Err(e) = checker.verify_clean(&id.to_string()) {
                log::error!("{}", e);
            }
        }

        result
    }

    fn execute(
        &self,
        request: &ExecutionRequest,
        guard: &mut CleanupGuard,
    ) -> Result<ExecutionOutcome> {
        let id = request.id;
        let instance = id.to_string();

        let jail = Jail::build(
            &self.config.jail_root,
            &id,
            &request.script,
            &self.config.script_extension,
            guard,
        )?;
        let mounts = MountSet::apply(&jail, &self.config.mounts, guard)?;
        log::debug!("Execution {}: {} mount(s) applied", id, mounts.len());

        let limit_ready = self.prepare_cgroup(&instance, guard)?;
        let spec = LaunchSpec::prepare(&self.config, &jail, &self.namespaces)?;
        self.notify(ProcessState::Created, None)?;

        let started_at = Instant::now();
        let process = spawn_traced(&spec, &self.namespaces, self.host_uid, self.host_gid)?;
        let pid = process.pid().as_raw();
        self.notify(ProcessState::Started, Some(pid))?;

        let process = self.assign(process, &instance, limit_ready)?;
        self.notify(ProcessState::GroupAssigned, Some(pid))?;

        let process = match process.release() {
            Ok(released) => released,
            Err(failed) => {
                if let Err(e) = failed.process.kill() {
                    log::error!("Failed to kill undetached process {}: {}", pid, e);
                }
                return Err(failed.error);
            }
        };
        let memory_limited = process.memory_limited();
        self.notify(ProcessState::Released, Some(pid))?;

        let status = process.wait(self.config.wall_timeout())?;
        let wall_time = started_at.elapsed();
        log::info!("Execution {} finished: {:?} in {:?}", id, status, wall_time);
        self.notify(ProcessState::Exited, Some(pid))?;

        Ok(self.outcome(id, pid, status, memory_limited, wall_time.as_millis() as u64))
    }

    /// Create the scope and write its ceiling; `Ok(false)` means the run
    /// continues unlimited under [`LimitFailurePolicy::Proceed`]
    fn prepare_cgroup(&self, instance: &str, guard: &mut CleanupGuard) -> Result<bool> {
        if let Err(e) = self.cgroup.create(instance) {
            return self.limit_failure(e);
        }
        guard.record(ResourceType::Cgroup, self.cgroup.get_cgroup_path(instance));

        match self
            .cgroup
            .set_memory_limit(instance, self.config.memory_limit_bytes)
        {
            Ok(()) => Ok(true),
            Err(e) => self.limit_failure(e),
        }
    }

    fn limit_failure(&self, error: SandboxError) -> Result<bool> {
        match self.config.limit_failure_policy {
            LimitFailurePolicy::Abort => Err(error),
            LimitFailurePolicy::Proceed => {
                log::warn!("Memory limit unavailable, proceeding without it: {}", error);
                Ok(false)
            }
        }
    }

    fn assign(
        &self,
        process: TracedProcess<Started>,
        instance: &str,
        limit_ready: bool,
    ) -> Result<TracedProcess<GroupAssigned>> {
        if !limit_ready {
            return Ok(process.skip_cgroup());
        }

        match process.assign_to_cgroup(self.cgroup.as_ref(), instance) {
            Ok(assigned) => Ok(assigned),
            Err(failed) => match self.config.limit_failure_policy {
                LimitFailurePolicy::Abort => {
                    if let Err(e) = failed.process.kill() {
                        log::error!("Failed to kill unassigned process: {}", e);
                    }
                    Err(failed.error)
                }
                LimitFailurePolicy::Proceed => {
                    log::warn!("Membership write failed, proceeding: {}", failed.error);
                    Ok(failed.process.skip_cgroup())
                }
            },
        }
    }

    fn outcome(
        &self,
        id: ExecutionId,
        pid: i32,
        status: ExitKind,
        memory_limited: bool,
        wall_time_ms: u64,
    ) -> ExecutionOutcome {
        let instance = id.to_string();
        let (oom_kills, memory_peak_bytes) = if memory_limited {
            (
                self.cgroup.get_oom_kill_count(&instance).ok(),
                self.cgroup.get_memory_peak(&instance).ok(),
            )
        } else {
            (None, None)
        };

        ExecutionOutcome {
            id,
            pid,
            status,
            memory_limited,
            oom_kills,
            memory_peak_bytes,
            wall_time_ms,
        }
    }

    fn notify(&self, state: ProcessState, pid: Option<i32>) -> Result<()> {
        log::debug!("Lifecycle: {:?} (pid {:?})", state, pid);
        match &self.probe {
            Some(probe) => probe
                .on_transition(state, pid)
                .map_err(|reason| SandboxError::Probe { state, reason }),
            None => Ok(()),
        }
    }
}
