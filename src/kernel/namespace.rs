/// Namespace isolation for the interpreter process
/// Provides UTS, PID, mount, network and user namespace flags plus the
/// identity mapping of the invoking user to root inside the user namespace.
use crate::config::types::{Result, SandboxError};

use nix::sched::CloneFlags;
use nix::unistd::{Gid, Pid, Uid};
use std::fmt;
use std::fs;

/// Namespace isolation controller
#[derive(Debug, Clone)]
pub struct NamespaceIsolation {
    enable_uts_namespace: bool,
    enable_pid_namespace: bool,
    enable_mount_namespace: bool,
    enable_network_namespace: bool,
    enable_user_namespace: bool,
    hostname: String,
}

/// One line of a uid_map / gid_map file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

impl IdMap {
    /// Map a single host id to 0 inside the namespace
    pub fn root_for(outside: u32) -> Self {
        Self {
            inside: 0,
            outside,
            count: 1,
        }
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.inside, self.outside, self.count)
    }
}

impl NamespaceIsolation {
    pub fn new(
        enable_uts: bool,
        enable_pid: bool,
        enable_mount: bool,
        enable_network: bool,
        enable_user: bool,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            enable_uts_namespace: enable_uts,
            enable_pid_namespace: enable_pid,
            enable_mount_namespace: enable_mount,
            enable_network_namespace: enable_network,
            enable_user_namespace: enable_user,
            hostname: hostname.into(),
        }
    }

    /// Every namespace the jail needs: UTS, PID, mount, network, user
    pub fn new_default(hostname: impl Into<String>) -> Self {
        Self::new(true, true, true, true, true, hostname)
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    /// Flags passed to clone(2) for the interpreter process
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.enable_uts_namespace {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.enable_pid_namespace {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.enable_mount_namespace {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.enable_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        flags
    }

    pub fn hostname(&self) -> Option<&str> {
        if self.enable_uts_namespace {
            Some(&self.hostname)
        } else {
            None
        }
    }

    pub fn get_enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = Vec::new();

        if self.enable_uts_namespace {
            namespaces.push("UTS");
        }
        if self.enable_pid_namespace {
            namespaces.push("PID");
        }
        if self.enable_mount_namespace {
            namespaces.push("Mount");
        }
        if self.enable_network_namespace {
            namespaces.push("Network");
        }
        if self.enable_user_namespace {
            namespaces.push("User");
        }

        namespaces
    }

    /// Map the invoking user and group to 0 inside the child's user namespace.
    ///
    /// Runs in the parent while the child is blocked before exec. setgroups
    /// must be denied before an unprivileged writer may set gid_map.
    pub fn write_id_maps(&self, child: Pid, host_uid: Uid, host_gid: Gid) -> Result<()> {
        if !self.enable_user_namespace {
            return Ok(());
        }

        let proc_dir = format!("/proc/{}", child.as_raw());

        write_proc_file(&format!("{}/setgroups", proc_dir), "deny")?;
        write_proc_file(
            &format!("{}/gid_map", proc_dir),
            &IdMap::root_for(host_gid.as_raw()).to_string(),
        )?;
        write_proc_file(
            &format!("{}/uid_map", proc_dir),
            &IdMap::root_for(host_uid.as_raw()).to_string(),
        )?;

        log::debug!(
            "Mapped uid {} / gid {} to 0 in user namespace of {}",
            host_uid,
            host_gid,
            child
        );
        Ok(())
    }
}

fn write_proc_file(path: &str, content: &str) -> Result<()> {
    fs::write(path, content)
        .map_err(|e| SandboxError::Namespace(format!("Failed to write {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags_cover_all_namespaces() {
        let ns = NamespaceIsolation::new_default("jail");
        let flags = ns.clone_flags();

        for flag in [
            CloneFlags::CLONE_NEWUTS,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWUSER,
        ] {
            assert!(flags.contains(flag), "missing {:?}", flag);
        }
        assert!(!flags.contains(CloneFlags::CLONE_NEWIPC));
        assert_eq!(ns.get_enabled_namespaces().len(), 5);
        assert_eq!(ns.hostname(), Some("jail"));
    }

    #[test]
    fn test_disabled_uts_has_no_hostname() {
        let ns = NamespaceIsolation::new(false, true, true, true, false, "jail");
        assert!(ns.hostname().is_none());
        assert!(!ns.clone_flags().contains(CloneFlags::CLONE_NEWUTS));
        assert!(!ns.clone_flags().contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_id_map_format() {
        assert_eq!(IdMap::root_for(1000).to_string(), "0 1000 1\n");
    }

    #[test]
    fn test_id_maps_skipped_without_user_namespace() {
        let ns = NamespaceIsolation::new(true, true, true, true, false, "jail");
        // Pid 0 would never be writable; skipping must not touch /proc
        assert!(ns
            .write_id_maps(Pid::from_raw(0), Uid::from_raw(1000), Gid::from_raw(1000))
            .is_ok());
    }

    #[test]
    fn test_namespace_support_probe() {
        let _ = NamespaceIsolation::is_supported();
    }
}
