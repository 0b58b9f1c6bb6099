/// Per-execution jail directory
use crate::config::types::{ExecutionId, Result, SandboxError};
use crate::safety::{CleanupGuard, ResourceType};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Directory inside the jail holding the script; also the working directory
pub const APP_DIR: &str = "app";

/// Filesystem tree that becomes the interpreter's root.
///
/// Lives at `<jail_root>/<execution id>` and holds the script at
/// `app/main.<ext>`. The directory is recorded for teardown as soon as it
/// exists, so a failed script write never leaves a half-built jail.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
    script_path: PathBuf,
}

impl Jail {
    pub fn build(
        jail_root: &Path,
        id: &ExecutionId,
        script: &str,
        extension: &str,
        guard: &mut CleanupGuard,
    ) -> Result<Self> {
        let root = jail_root.join(id.to_string());

        // create_dir (not create_dir_all) so an id collision fails loudly
        // instead of two executions sharing one tree.
        DirBuilder::new()
            .mode(0o755)
            .create(&root)
            .map_err(|e| jail_error(&root, e))?;
        guard.record(ResourceType::Jail, root.clone());

        let app_dir = root.join(APP_DIR);
        DirBuilder::new()
            .mode(0o755)
            .create(&app_dir)
            .map_err(|e| jail_error(&app_dir, e))?;

        let script_path = app_dir.join(format!("main.{}", extension));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&script_path)
            .map_err(|e| jail_error(&script_path, e))?;
        file.write_all(script.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| jail_error(&script_path, e))?;

        log::debug!(
            "Built jail {} ({} byte script)",
            root.display(),
            script.len()
        );

        Ok(Self { root, script_path })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host-side path of the script file
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Map an absolute path inside the jail to its host-side location
    pub fn host_path(&self, jail_path: &Path) -> PathBuf {
        self.root
            .join(jail_path.strip_prefix("/").unwrap_or(jail_path))
    }

    pub fn exists(&self) -> bool {
        fs::metadata(&self.root).map(|m| m.is_dir()).unwrap_or(false)
    }
}

fn jail_error(path: &Path, source: std::io::Error) -> SandboxError {
    SandboxError::Jail {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_build_writes_script() {
        let scratch = tempfile::tempdir().unwrap();
        let id = ExecutionId::new();
        let mut guard = CleanupGuard::new("jail-test");

        let jail = Jail::build(scratch.path(), &id, "print('hi')", "py", &mut guard).unwrap();

        assert_eq!(jail.root(), scratch.path().join(id.to_string()));
        assert_eq!(jail.script_path(), jail.root().join("app/main.py"));
        assert_eq!(fs::read_to_string(jail.script_path()).unwrap(), "print('hi')");

        let mode = fs::metadata(jail.script_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert_eq!(guard.ledger().get_by_type(ResourceType::Jail).len(), 1);

        guard.finish();
        assert!(!jail.exists());
    }

    #[test]
    fn test_host_path_mapping() {
        let scratch = tempfile::tempdir().unwrap();
        let id = ExecutionId::new();
        let mut guard = CleanupGuard::new("jail-map-test");
        let jail = Jail::build(scratch.path(), &id, "", "sh", &mut guard).unwrap();

        assert_eq!(
            jail.host_path(Path::new("/usr/lib")),
            jail.root().join("usr/lib")
        );
        assert_eq!(
            jail.host_path(Path::new("/app/main.sh")),
            jail.script_path()
        );
    }

    #[test]
    fn test_colliding_id_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let id = ExecutionId::new();
        let mut first_guard = CleanupGuard::new("first");
        let first = Jail::build(scratch.path(), &id, "a", "py", &mut first_guard).unwrap();

        let mut second_guard = CleanupGuard::new("second");
        let err = Jail::build(scratch.path(), &id, "b", "py", &mut second_guard).unwrap_err();
        assert!(matches!(err, SandboxError::Jail { .. }));

        // The failed build recorded nothing, so the live jail survives it
        assert!(second_guard.ledger().is_empty());
        drop(second_guard);
        assert!(first.exists());
        assert_eq!(fs::read_to_string(first.script_path()).unwrap(), "a");
    }

    #[test]
    fn test_missing_jail_root_fails_cleanly() {
        let scratch = tempfile::tempdir().unwrap();
        let missing = scratch.path().join("does-not-exist");
        let mut guard = CleanupGuard::new("missing-root");

        let err = Jail::build(&missing, &ExecutionId::new(), "x", "py", &mut guard).unwrap_err();
        assert!(matches!(err, SandboxError::Jail { .. }));
        assert!(guard.ledger().is_empty());
    }
}
