//! Mount failure must abort the run before spawn and leave nothing behind.
//!
//! Runs unprivileged too: without root the first bind already fails, with
//! root the second (missing) source does. Either way the run fails with a
//! mount error and teardown empties the jail root.

use std::path::PathBuf;
use std::sync::Arc;
use tamarun::config::loader::SandboxConfig;
use tamarun::config::types::{ExecutionRequest, MountBinding, ProcessState, SandboxError};
use tamarun::exec::{LifecycleProbe, Supervisor};
use tamarun::kernel::cgroup::CgroupV2;
use tamarun::safety::cleanup::mounts_under;

struct NoSpawn;

impl LifecycleProbe for NoSpawn {
    fn on_transition(&self, state: ProcessState, _pid: Option<i32>) -> Result<(), String> {
        assert_eq!(state, ProcessState::Failed, "nothing may start after a mount failure");
        Ok(())
    }
}

#[test]
fn test_mount_failure_tears_down_jail() {
    let scratch = tempfile::tempdir().unwrap();
    let jail_root = scratch.path().join("jails");
    let cgroup_root = scratch.path().join("cgroup");
    std::fs::create_dir_all(&jail_root).unwrap();
    std::fs::create_dir_all(&cgroup_root).unwrap();

    let mut config = SandboxConfig::default();
    config.jail_root = jail_root.clone();
    config.cgroup_root = cgroup_root.clone();
    config.mounts = vec![
        MountBinding::new("/bin"),
        MountBinding::new("/tamarun/definitely/missing"),
    ];

    let supervisor =
        Supervisor::with_backend(config, Arc::new(CgroupV2::new(cgroup_root.clone())))
            .with_probe(Arc::new(NoSpawn));

    let result = supervisor.run(ExecutionRequest::new("print('never runs')"));
    assert!(
        matches!(result, Err(SandboxError::Mount { .. })),
        "expected mount error, got {:?}",
        result
    );

    assert_eq!(std::fs::read_dir(&jail_root).unwrap().count(), 0);
    assert!(mounts_under(&jail_root).unwrap().is_empty());
    // Mounts come before the cgroup, so no scope was ever created
    assert_eq!(std::fs::read_dir(&cgroup_root).unwrap().count(), 0);
}

#[test]
fn test_optional_missing_mount_does_not_fail_setup() {
    let scratch = tempfile::tempdir().unwrap();
    let jail_root = scratch.path().join("jails");
    std::fs::create_dir_all(&jail_root).unwrap();

    let mut config = SandboxConfig::default();
    config.jail_root = jail_root.clone();
    // Missing cgroup root: the run fails right after the mount stage
    config.cgroup_root = scratch.path().join("no-cgroup");
    config.mounts = vec![MountBinding::optional("/tamarun/definitely/missing")];

    let supervisor =
        Supervisor::with_backend(config, Arc::new(CgroupV2::new(scratch.path().join("no-cgroup"))));
    let result = supervisor.run(ExecutionRequest::new("print(1)"));

    assert!(matches!(result, Err(SandboxError::Cgroup(_))));
    assert_eq!(std::fs::read_dir(&jail_root).unwrap().count(), 0);
}

#[test]
fn test_symlinked_jail_root_is_torn_down() {
    let scratch = tempfile::tempdir().unwrap();
    let real_root = scratch.path().join("jails-real");
    let link_root = scratch.path().join("jails");
    let data = scratch.path().join("data");
    std::fs::create_dir_all(&real_root).unwrap();
    std::fs::create_dir_all(&data).unwrap();
    std::os::unix::fs::symlink(&real_root, &link_root).unwrap();

    let mut config = SandboxConfig::default();
    config.jail_root = link_root;
    config.cgroup_root = scratch.path().join("no-cgroup");
    config.mounts = vec![MountBinding {
        source: data,
        target: Some(PathBuf::from("/data")),
        optional: false,
    }];

    let supervisor =
        Supervisor::with_backend(config, Arc::new(CgroupV2::new(scratch.path().join("no-cgroup"))));
    assert_eq!(
        supervisor.config().jail_root,
        std::fs::canonicalize(&real_root).unwrap()
    );

    // With root the bind succeeds and the missing cgroup root fails the run
    // afterwards; without root the bind itself fails
    let result = supervisor.run(ExecutionRequest::new("print(1)"));
    if nix::unistd::geteuid().is_root() {
        assert!(matches!(result, Err(SandboxError::Cgroup(_))), "{:?}", result);
    } else {
        assert!(matches!(result, Err(SandboxError::Mount { .. })), "{:?}", result);
    }

    assert!(mounts_under(&real_root).unwrap().is_empty());
    assert_eq!(std::fs::read_dir(&real_root).unwrap().count(), 0);
}

#[test]
fn test_relative_jail_root_is_rejected() {
    let mut config = SandboxConfig::default();
    config.jail_root = PathBuf::from("jails");

    let result = Supervisor::new(config);
    assert!(matches!(result, Err(SandboxError::Config(_))));
}
