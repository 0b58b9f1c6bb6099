/// Cleanup and resource management
///
/// Every resource an execution creates is recorded in a ledger immediately
/// after creation. Teardown walks the ledger in reverse, so an execution
/// releases its cgroup, then its mounts, then its jail directory, no matter
/// how far setup got.
use crate::config::types::{Result, SandboxError};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use std::fs;
use std::path::{Path, PathBuf};

/// Resource types that need cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Jail,
    Mount,
    Cgroup,
}

/// Resource ledger entry
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub resource_type: ResourceType,
    pub path: PathBuf,
    pub created_at: std::time::SystemTime,
}

/// Resources recorded in creation order
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<ResourceEntry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called immediately after successful creation
    pub fn record(&mut self, resource_type: ResourceType, path: PathBuf) {
        let entry = ResourceEntry {
            resource_type,
            path,
            created_at: std::time::SystemTime::now(),
        };

        debug!("Recording resource: {:?}", entry);
        self.entries.push(entry);
    }

    pub fn get_by_type(&self, resource_type: ResourceType) -> Vec<&ResourceEntry> {
        self.entries
            .iter()
            .filter(|e| e.resource_type == resource_type)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    fn drain_reverse(&mut self) -> Vec<ResourceEntry> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }
}

/// Cleanup manager with idempotent operations.
///
/// Once released, an entry leaves the ledger; entries that fail stay out of
/// it as well, and are reported through [`CleanupManager::errors`].
#[derive(Debug, Default)]
pub struct CleanupManager {
    ledger: ResourceLedger,
    cleanup_errors: Vec<String>,
}

impl CleanupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resource(&mut self, resource_type: ResourceType, path: PathBuf) {
        self.ledger.record(resource_type, path);
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Release all resources in reverse creation order.
    ///
    /// Every entry is attempted even if an earlier one fails. Returns the
    /// number of resources that could not be released.
    pub fn cleanup_all(&mut self) -> usize {
        if self.ledger.is_empty() {
            return 0;
        }

        info!("Starting cleanup of {} resources", self.ledger.count());
        let mut failed = 0;

        for entry in self.ledger.drain_reverse() {
            match Self::cleanup_resource(&entry) {
                Ok(()) => debug!("Released {:?} {}", entry.resource_type, entry.path.display()),
                Err(e) => {
                    let msg = format!(
                        "Failed to release {:?} {}: {}",
                        entry.resource_type,
                        entry.path.display(),
                        e
                    );
                    warn!("{}", msg);
                    self.cleanup_errors.push(msg);
                    failed += 1;
                }
            }
        }

        if failed == 0 {
            info!("Cleanup complete");
        }
        failed
    }

    fn cleanup_resource(entry: &ResourceEntry) -> Result<()> {
        match entry.resource_type {
            ResourceType::Mount => cleanup_mount(&entry.path),
            ResourceType::Cgroup => cleanup_cgroup(&entry.path),
            ResourceType::Jail => cleanup_jail(&entry.path),
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.cleanup_errors
    }

    pub fn has_errors(&self) -> bool {
        !self.cleanup_errors.is_empty()
    }
}

/// Scoped owner of one execution's resources.
///
/// Created before the first resource exists; releases everything it holds
/// when dropped, on success and on every error path alike.
#[derive(Debug)]
pub struct CleanupGuard {
    label: String,
    manager: CleanupManager,
}

impl CleanupGuard {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            manager: CleanupManager::new(),
        }
    }

    pub fn record(&mut self, resource_type: ResourceType, path: PathBuf) {
        self.manager.record_resource(resource_type, path);
    }

    pub fn ledger(&self) -> &ResourceLedger {
        self.manager.ledger()
    }

    /// Release now and report leftover failures; dropping afterwards is a no-op
    pub fn finish(mut self) -> Vec<String> {
        self.release();
        std::mem::take(&mut self.manager.cleanup_errors)
    }

    fn release(&mut self) {
        let failed = self.manager.cleanup_all();
        if failed > 0 {
            error!(
                "Teardown of {} left {} resource(s) behind",
                self.label, failed
            );
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn cleanup_mount(path: &Path) -> Result<()> {
    debug!("Unmounting: {}", path.display());
    match umount2(path, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(Errno::EBUSY) => {
            warn!("{} busy, detaching lazily", path.display());
            umount2(path, MntFlags::MNT_DETACH).map_err(|e| SandboxError::Mount {
                path: path.to_path_buf(),
                reason: format!("lazy unmount failed: {}", e),
            })
        }
        // Not a mount point (EINVAL) or already gone with its jail (ENOENT)
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
            debug!("Mount already cleaned: {}", path.display());
            Ok(())
        }
        // Unprivileged callers get EPERM even for paths that are not mounted
        Err(Errno::EPERM) if matches!(is_mounted(path), Ok(false)) => Ok(()),
        Err(e) => Err(SandboxError::Mount {
            path: path.to_path_buf(),
            reason: format!("unmount failed: {}", e),
        }),
    }
}

const CGROUP_REMOVE_ATTEMPTS: u32 = 50;
const CGROUP_REMOVE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(10);

fn cleanup_cgroup(path: &Path) -> Result<()> {
    let mut killed = false;

    for attempt in 1..=CGROUP_REMOVE_ATTEMPTS {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cgroup already cleaned: {}", path.display());
                return Ok(());
            }
            // Members still exiting; an empty scope becomes removable shortly
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < CGROUP_REMOVE_ATTEMPTS => {
                if !killed {
                    let kill_file = path.join("cgroup.kill");
                    if kill_file.exists() {
                        if let Err(e) = fs::write(&kill_file, "1") {
                            warn!("Failed to write {}: {}", kill_file.display(), e);
                        }
                    }
                    killed = true;
                }
                std::thread::sleep(CGROUP_REMOVE_BACKOFF);
            }
            Err(e) => {
                return Err(SandboxError::Cgroup(format!(
                    "Failed to remove cgroup {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }

    Err(SandboxError::Cgroup(format!(
        "Cgroup {} still busy after {} attempts",
        path.display(),
        CGROUP_REMOVE_ATTEMPTS
    )))
}

fn cleanup_jail(path: &Path) -> Result<()> {
    if !path.exists() {
        debug!("Jail already cleaned: {}", path.display());
        return Ok(());
    }

    // Removing a tree that still has host directories bound into it would
    // walk into the host filesystem.
    let remaining = mounts_under(path)?;
    if !remaining.is_empty() {
        return Err(SandboxError::Mount {
            path: path.to_path_buf(),
            reason: format!(
                "refusing to remove jail with {} mount(s) still attached: {:?}",
                remaining.len(),
                remaining
            ),
        });
    }

    debug!("Removing jail: {}", path.display());
    fs::remove_dir_all(path).map_err(|e| SandboxError::Jail {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Mount points from /proc/self/mounts, with octal escapes decoded
pub fn current_mount_points() -> Result<Vec<PathBuf>> {
    let mounts = fs::read_to_string("/proc/self/mounts").map_err(|e| {
        SandboxError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read /proc/self/mounts: {}", e),
        ))
    })?;

    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(decode_mount_field(field)))
        .collect())
}

/// The kernel reports mount points by canonical absolute path
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// Check if path is a mount point
pub fn is_mounted(path: &Path) -> Result<bool> {
    let path = canonical(path);
    Ok(current_mount_points()?.iter().any(|p| *p == path))
}

/// Mount points at or below `root`
pub fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    let root = canonical(root);
    Ok(current_mount_points()?
        .into_iter()
        .filter(|p| p.starts_with(&root))
        .collect())
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Host-clean check for a finished execution
pub struct BaselineChecker {
    jail_root: PathBuf,
    cgroup_root: PathBuf,
}

impl BaselineChecker {
    pub fn new(jail_root: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            jail_root: jail_root.into(),
            cgroup_root: cgroup_root.into(),
        }
    }

    /// Everything still on the host that belongs to `execution_id`
    pub fn leftovers(&self, execution_id: &str) -> Result<Vec<String>> {
        let jail = self.jail_root.join(execution_id);
        let cgroup = self.cgroup_root.join(execution_id);
        let mut violations = Vec::new();

        if jail.exists() {
            violations.push(format!("Leftover jail: {}", jail.display()));
        }
        for mount in mounts_under(&jail)? {
            violations.push(format!("Leftover mount: {}", mount.display()));
        }
        if cgroup.exists() {
            violations.push(format!("Leftover cgroup: {}", cgroup.display()));
        }

        Ok(violations)
    }

    /// Verify nothing of `execution_id` survived teardown
    pub fn verify_clean(&self, execution_id: &str) -> Result<()> {
        let violations = self.leftovers(execution_id)?;
        if violations.is_empty() {
            debug!("Baseline verification passed for {}", execution_id);
            return Ok(());
        }

        error!("Baseline violations detected: {:?}", violations);
        Err(SandboxError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "Host-clean baseline violated for {}: {}",
                execution_id,
                violations.join("; ")
            ),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ledger() {
        let mut ledger = ResourceLedger::new();
        assert!(ledger.is_empty());

        ledger.record(ResourceType::Jail, PathBuf::from("/tmp/jail"));
        ledger.record(ResourceType::Mount, PathBuf::from("/tmp/jail/usr"));

        assert_eq!(ledger.count(), 2);
        assert_eq!(ledger.get_by_type(ResourceType::Mount).len(), 1);

        let reversed = ledger.drain_reverse();
        assert_eq!(reversed[0].resource_type, ResourceType::Mount);
        assert_eq!(reversed[1].resource_type, ResourceType::Jail);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_guard_removes_jail_on_drop() {
        let scratch = tempfile::tempdir().unwrap();
        let jail = scratch.path().join("jail");
        fs::create_dir_all(jail.join("app")).unwrap();
        fs::write(jail.join("app/main.py"), "print(1)").unwrap();

        {
            let mut guard = CleanupGuard::new("drop-test");
            guard.record(ResourceType::Jail, jail.clone());
        }

        assert!(!jail.exists());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let cgroup = scratch.path().join("scope");
        fs::create_dir(&cgroup).unwrap();

        let mut manager = CleanupManager::new();
        manager.record_resource(ResourceType::Cgroup, cgroup.clone());
        manager.record_resource(ResourceType::Mount, scratch.path().join("never-mounted"));
        assert_eq!(manager.cleanup_all(), 0);
        assert!(!cgroup.exists());

        // Second pass has nothing left to do
        assert_eq!(manager.cleanup_all(), 0);
        assert!(!manager.has_errors());
    }

    #[test]
    fn test_finish_reports_no_errors_for_missing_resources() {
        let scratch = tempfile::tempdir().unwrap();
        let mut guard = CleanupGuard::new("finish-test");
        guard.record(ResourceType::Jail, scratch.path().join("gone"));
        guard.record(ResourceType::Cgroup, scratch.path().join("gone-too"));
        assert!(guard.finish().is_empty());
    }

    #[test]
    fn test_mount_lookup_resolves_symlinks() {
        let scratch = tempfile::tempdir().unwrap();
        let link = scratch.path().join("proc-link");
        std::os::unix::fs::symlink("/proc", &link).unwrap();

        // /proc is a mount point on every Linux host; only its canonical
        // name appears in /proc/self/mounts
        assert!(is_mounted(&link).unwrap());
        assert!(mounts_under(&link)
            .unwrap()
            .contains(&PathBuf::from("/proc")));
    }

    #[test]
    fn test_jail_with_mount_behind_symlink_is_kept() {
        let scratch = tempfile::tempdir().unwrap();
        let link = scratch.path().join("jail-link");
        std::os::unix::fs::symlink("/proc", &link).unwrap();

        // Removal must refuse: a mount sits under the resolved path
        let err = cleanup_jail(&link).unwrap_err();
        assert!(matches!(err, SandboxError::Mount { .. }));
        assert!(Path::new("/proc/self").exists());
    }

    #[test]
    fn test_decode_mount_field() {
        assert_eq!(decode_mount_field("/tmp/a\\040b"), "/tmp/a b");
        assert_eq!(decode_mount_field("/plain/path"), "/plain/path");
        assert_eq!(decode_mount_field("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn test_baseline_checker_reports_leftovers() {
        let jails = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let checker = BaselineChecker::new(jails.path(), cgroups.path());

        assert!(checker.verify_clean("run-1").is_ok());

        fs::create_dir(jails.path().join("run-1")).unwrap();
        fs::create_dir(cgroups.path().join("run-1")).unwrap();
        let leftovers = checker.leftovers("run-1").unwrap();
        assert_eq!(leftovers.len(), 2);
        assert!(checker.verify_clean("run-1").is_err());
    }
}
