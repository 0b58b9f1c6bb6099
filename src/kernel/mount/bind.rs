/// Read-only bind mounts of host directories into a jail
use crate::config::types::{MountBinding, Result, SandboxError};
use crate::kernel::mount::jail::Jail;
use crate::safety::{CleanupGuard, ResourceType};
use nix::mount::{mount, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};

/// Mounts applied for one execution, in application order.
///
/// Each mount is recorded with the cleanup guard before the next one is
/// attempted, so teardown unmounts exactly what was mounted.
#[derive(Debug, Default)]
pub struct MountSet {
    /// Host-side mount points inside the jail
    targets: Vec<PathBuf>,
}

impl MountSet {
    /// Apply `bindings` in order; stop at the first failure
    pub fn apply(
        jail: &Jail,
        bindings: &[MountBinding],
        guard: &mut CleanupGuard,
    ) -> Result<Self> {
        let mut set = MountSet::default();

        for binding in bindings {
            if !binding.source.exists() {
                if binding.optional {
                    log::debug!(
                        "Skipping optional mount, source missing: {}",
                        binding.source.display()
                    );
                    continue;
                }
                return Err(SandboxError::Mount {
                    path: binding.source.clone(),
                    reason: "source does not exist".to_string(),
                });
            }

            let target = jail.host_path(binding.jail_target());
            set.bind_one(&binding.source, &target, guard)?;
        }

        log::info!(
            "Applied {} read-only mount(s) under {}",
            set.targets.len(),
            jail.root().display()
        );
        Ok(set)
    }

    fn bind_one(&mut self, source: &Path, target: &Path, guard: &mut CleanupGuard) -> Result<()> {
        if !source.is_dir() {
            return Err(SandboxError::Mount {
                path: source.to_path_buf(),
                reason: "source is not a directory".to_string(),
            });
        }

        fs::create_dir_all(target).map_err(|e| SandboxError::Mount {
            path: source.to_path_buf(),
            reason: format!("failed to create target {}: {}", target.display(), e),
        })?;

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| SandboxError::Mount {
            path: source.to_path_buf(),
            reason: format!("bind to {} failed: {}", target.display(), e),
        })?;

        guard.record(ResourceType::Mount, target.to_path_buf());
        self.targets.push(target.to_path_buf());

        // MS_RDONLY is ignored on the initial bind; it only sticks on remount.
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REMOUNT
                | MsFlags::MS_BIND
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| SandboxError::Mount {
            path: source.to_path_buf(),
            reason: format!("read-only remount of {} failed: {}", target.display(), e),
        })?;

        log::debug!(
            "Bound {} read-only at {}",
            source.display(),
            target.display()
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ExecutionId;

    #[test]
    fn test_optional_missing_source_is_skipped() {
        let scratch = tempfile::tempdir().unwrap();
        let mut guard = CleanupGuard::new("optional-mount");
        let jail = Jail::build(scratch.path(), &ExecutionId::new(), "", "py", &mut guard).unwrap();

        let bindings = vec![MountBinding::optional("/definitely/not/here/tamarun")];
        let set = MountSet::apply(&jail, &bindings, &mut guard).unwrap();

        assert!(set.is_empty());
        assert!(guard.ledger().get_by_type(ResourceType::Mount).is_empty());
    }

    #[test]
    fn test_required_missing_source_names_path() {
        let scratch = tempfile::tempdir().unwrap();
        let mut guard = CleanupGuard::new("required-mount");
        let jail = Jail::build(scratch.path(), &ExecutionId::new(), "", "py", &mut guard).unwrap();

        let bindings = vec![MountBinding::new("/definitely/not/here/tamarun")];
        match MountSet::apply(&jail, &bindings, &mut guard) {
            Err(SandboxError::Mount { path, .. }) => {
                assert_eq!(path, PathBuf::from("/definitely/not/here/tamarun"))
            }
            other => panic!("expected mount error, got {:?}", other),
        }

        let root = jail.root().to_path_buf();
        drop(guard);
        assert!(!root.exists());
    }

    #[test]
    fn test_file_source_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("plain-file");
        fs::write(&file, "x").unwrap();

        let jails = tempfile::tempdir().unwrap();
        let mut guard = CleanupGuard::new("file-source");
        let jail = Jail::build(jails.path(), &ExecutionId::new(), "", "py", &mut guard).unwrap();

        let bindings = vec![MountBinding::new(file.clone())];
        let err = MountSet::apply(&jail, &bindings, &mut guard).unwrap_err();
        assert!(matches!(err, SandboxError::Mount { path, .. } if path == file));
    }
}
