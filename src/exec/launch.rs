/// Interpreter launch: clone into fresh namespaces, chroot into the jail,
/// and stop at exec under ptrace.
///
/// Child-side sequence (after clone, before exec):
/// 1. close the parent's pipe ends, request SIGKILL on parent death
/// 2. block until the parent has written uid_map / gid_map
/// 3. set the hostname (best effort)
/// 4. chroot to the jail, chdir to /app
/// 5. PTRACE_TRACEME, then execve; the kernel stops the child with SIGTRAP
///
/// Everything the child touches is prepared before clone so the child does
/// not allocate. Failures before exec travel back as (stage, errno) over a
/// close-on-exec pipe; a clean exec closes it with nothing written.
use crate::config::loader::SandboxConfig;
use crate::config::types::{Result, SandboxError};
use crate::exec::lifecycle::{kill_and_reap, Started, TracedProcess};
use crate::kernel::mount::Jail;
use crate::kernel::namespace::NamespaceIsolation;
use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, sethostname, Gid, Pid, Uid};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString, OsString};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const CHILD_STACK_SIZE: usize = 2 * 1024 * 1024;
const CHILD_FAILURE_EXIT: isize = 127;

/// Child setup step that failed, as reported over the error pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChildStage {
    Sync = 1,
    ParentDeathSignal = 2,
    Chroot = 3,
    Chdir = 4,
    TraceMe = 5,
    Exec = 6,
}

impl ChildStage {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Sync),
            2 => Some(Self::ParentDeathSignal),
            3 => Some(Self::Chroot),
            4 => Some(Self::Chdir),
            5 => Some(Self::TraceMe),
            6 => Some(Self::Exec),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Sync => "waiting for id maps",
            Self::ParentDeathSignal => "prctl(PR_SET_PDEATHSIG)",
            Self::Chroot => "chroot into jail",
            Self::Chdir => "chdir to /app",
            Self::TraceMe => "ptrace(PTRACE_TRACEME)",
            Self::Exec => "execve interpreter",
        }
    }
}

/// Everything the cloned child needs, converted to C strings up front
#[derive(Debug)]
pub struct LaunchSpec {
    root: CString,
    workdir: CString,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    hostname: Option<String>,
}

impl LaunchSpec {
    /// Resolve the interpreter and build argv/envp for one jail
    pub fn prepare(config: &SandboxConfig, jail: &Jail, namespaces: &NamespaceIsolation) -> Result<Self> {
        let program = resolve_interpreter(&config.interpreter)?;

        if !jail.host_path(&program).exists() {
            return Err(SandboxError::Spawn(format!(
                "Interpreter {} is not visible inside the jail; check the mount list",
                program.display()
            )));
        }

        let script = config.script_path_in_jail();
        let workdir = script.parent().unwrap_or(Path::new("/")).to_path_buf();

        Ok(Self {
            root: path_cstring(jail.root())?,
            workdir: path_cstring(&workdir)?,
            argv: vec![path_cstring(&program)?, path_cstring(&script)?],
            program: path_cstring(&program)?,
            envp: build_environment(config)?,
            hostname: namespaces.hostname().map(str::to_string),
        })
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }
}

/// Find a bare interpreter name on the host PATH; absolute paths pass through
pub fn resolve_interpreter(name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }
    if name.contains('/') {
        return Err(SandboxError::Config(format!(
            "Interpreter must be a bare name or an absolute path: {}",
            name
        )));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_else(|| OsString::from("/usr/bin:/bin"));
    std::env::split_paths(&path_var)
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
        .ok_or_else(|| SandboxError::Spawn(format!("Interpreter '{}' not found on PATH", name)))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        SandboxError::Config(format!("Path contains NUL byte: {}", path.display()))
    })
}

/// Host environment (optionally) overlaid with the configured variables
fn build_environment(config: &SandboxConfig) -> Result<Vec<CString>> {
    let mut vars: BTreeMap<OsString, OsString> = BTreeMap::new();

    if config.inherit_environment {
        vars.extend(std::env::vars_os());
    }
    for (key, value) in &config.environment {
        vars.insert(OsString::from(key), OsString::from(value));
    }

    vars.into_iter()
        .map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).map_err(|_| {
                SandboxError::Config(format!(
                    "Environment variable {:?} contains NUL byte",
                    key
                ))
            })
        })
        .collect()
}

fn cloexec_pipe(name: &str) -> Result<(File, File)> {
    let mut fds = [-1 as RawFd; 2];
    // SAFETY: fds is a valid two-element array for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(SandboxError::Spawn(format!(
            "pipe({}): {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and owned here.
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn report_child_failure(err_fd: RawFd, stage: ChildStage, errno: Errno) {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&(stage as u32).to_ne_bytes());
    buf[4..].copy_from_slice(&(errno as i32).to_ne_bytes());
    // SAFETY: buf outlives the call; a short or failed write only loses detail.
    unsafe {
        libc::write(err_fd, buf.as_ptr() as *const libc::c_void, buf.len());
    }
}

/// Raw descriptors and pointer arrays handed to the cloned child
struct ChildContext<'a> {
    spec: &'a LaunchSpec,
    argv: &'a [*const libc::c_char],
    envp: &'a [*const libc::c_char],
    sync_read: RawFd,
    sync_write: RawFd,
    err_read: RawFd,
    err_write: RawFd,
}

impl ChildContext<'_> {
    fn run(&self) -> isize {
        // SAFETY: closing the parent's ends in our private descriptor table.
        unsafe {
            libc::close(self.sync_write);
            libc::close(self.err_read);
        }

        // SAFETY: plain prctl with integer arguments.
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } != 0 {
            return self.fail(ChildStage::ParentDeathSignal, Errno::last());
        }

        let mut byte = 0u8;
        loop {
            // SAFETY: reading one byte into a live stack variable.
            let n = unsafe {
                libc::read(self.sync_read, &mut byte as *mut u8 as *mut libc::c_void, 1)
            };
            if n == 1 {
                break;
            }
            let errno = Errno::last();
            if n < 0 && errno == Errno::EINTR {
                continue;
            }
            // EOF: the parent gave up before mapping ids
            return self.fail(ChildStage::Sync, if n == 0 { Errno::EPIPE } else { errno });
        }

        if let Some(hostname) = &self.spec.hostname {
            let _ = sethostname(hostname);
        }

        if let Err(e) = chroot(self.spec.root.as_c_str()) {
            return self.fail(ChildStage::Chroot, e);
        }
        if let Err(e) = chdir(self.spec.workdir.as_c_str()) {
            return self.fail(ChildStage::Chdir, e);
        }
        if let Err(e) = ptrace::traceme() {
            return self.fail(ChildStage::TraceMe, e);
        }

        // SAFETY: program, argv and envp are NUL-terminated C strings and
        // null-terminated pointer arrays that outlive this call.
        unsafe {
            libc::execve(self.spec.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
        }
        self.fail(ChildStage::Exec, Errno::last())
    }

    fn fail(&self, stage: ChildStage, errno: Errno) -> isize {
        report_child_failure(self.err_write, stage, errno);
        CHILD_FAILURE_EXIT
    }
}

fn decode_child_failure(buf: &[u8]) -> Option<(ChildStage, Errno)> {
    if buf.len() < 8 {
        return None;
    }
    let stage = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let errno = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Some((ChildStage::from_raw(stage)?, Errno::from_i32(errno)))
}

/// Start the interpreter inside fresh namespaces, stopped at exec
pub fn spawn_traced(
    spec: &LaunchSpec,
    namespaces: &NamespaceIsolation,
    host_uid: Uid,
    host_gid: Gid,
) -> Result<TracedProcess<Started>> {
    let (sync_read, mut sync_write) = cloexec_pipe("sync")?;
    let (mut err_read, err_write) = cloexec_pipe("error")?;

    let argv = null_terminated(&spec.argv);
    let envp = null_terminated(&spec.envp);
    let context = ChildContext {
        spec,
        argv: &argv,
        envp: &envp,
        sync_read: sync_read.as_raw_fd(),
        sync_write: sync_write.as_raw_fd(),
        err_read: err_read.as_raw_fd(),
        err_write: err_write.as_raw_fd(),
    };

    let mut child_stack = vec![0u8; CHILD_STACK_SIZE];
    let child_cb: Box<dyn FnMut() -> isize + '_> = Box::new(|| context.run());

    // SAFETY: the child runs on its own stack in a copy of our address space
    // and only touches data prepared above before it execs or exits.
    let pid = unsafe {
        clone(
            child_cb,
            &mut child_stack,
            namespaces.clone_flags(),
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| {
        SandboxError::Spawn(format!(
            "clone({:?}) failed: {}",
            namespaces.get_enabled_namespaces(),
            e
        ))
    })?;

    drop(sync_read);
    drop(err_write);
    log::debug!("Cloned interpreter process {}", pid);

    if let Err(e) = namespaces.write_id_maps(pid, host_uid, host_gid) {
        let _ = kill_and_reap(pid);
        return Err(e);
    }

    if let Err(e) = sync_write.write_all(&[1]) {
        let _ = kill_and_reap(pid);
        return Err(SandboxError::Spawn(format!(
            "Failed to release child {}: {}",
            pid, e
        )));
    }
    drop(sync_write);

    let mut report = Vec::with_capacity(8);
    if let Err(e) = err_read.read_to_end(&mut report) {
        let _ = kill_and_reap(pid);
        return Err(SandboxError::Spawn(format!(
            "Failed to read child status: {}",
            e
        )));
    }

    if let Some((stage, errno)) = decode_child_failure(&report) {
        let _ = kill_and_reap(pid);
        return Err(SandboxError::Spawn(format!(
            "{} failed in child {}: {}",
            stage.describe(),
            pid,
            errno.desc()
        )));
    }

    wait_for_exec_stop(pid)
}

fn wait_for_exec_stop(pid: Pid) -> Result<TracedProcess<Started>> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                log::debug!("Process {} stopped at exec", pid);
                return Ok(TracedProcess::stopped_at_exec(pid));
            }
            Ok(WaitStatus::Stopped(_, signal)) => {
                let _ = kill_and_reap(pid);
                return Err(SandboxError::Ptrace(format!(
                    "Process {} stopped by {:?} before exec",
                    pid, signal
                )));
            }
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(SandboxError::Spawn(format!(
                    "Process {} exited with {} before exec",
                    pid, code
                )));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Err(SandboxError::Spawn(format!(
                    "Process {} killed by {:?} before exec",
                    pid, signal
                )));
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SandboxError::Wait(format!("waitpid({}): {}", pid, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_passthrough() {
        assert_eq!(
            resolve_interpreter("/usr/bin/python3").unwrap(),
            PathBuf::from("/usr/bin/python3")
        );
    }

    #[test]
    fn test_resolve_rejects_relative_paths() {
        assert!(matches!(
            resolve_interpreter("bin/python3"),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_missing_interpreter() {
        assert!(matches!(
            resolve_interpreter("tamarun-no-such-interpreter"),
            Err(SandboxError::Spawn(_))
        ));
    }

    #[test]
    fn test_resolve_finds_sh() {
        let resolved = resolve_interpreter("sh").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_environment_overlay() {
        let mut config = SandboxConfig::default();
        config.inherit_environment = false;
        config
            .environment
            .insert("EXTRA".to_string(), "value".to_string());

        let env = build_environment(&config).unwrap();
        let rendered: Vec<&str> = env.iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(rendered, vec!["EXTRA=value", "PYTHONUNBUFFERED=1"]);
    }

    #[test]
    fn test_null_terminated_arrays() {
        let strings = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let ptrs = null_terminated(&strings);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn test_child_failure_roundtrip_decoding() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&(ChildStage::Chroot as u32).to_ne_bytes());
        buf[4..].copy_from_slice(&(Errno::ENOENT as i32).to_ne_bytes());
        assert_eq!(
            decode_child_failure(&buf),
            Some((ChildStage::Chroot, Errno::ENOENT))
        );
        assert_eq!(decode_child_failure(&[]), None);
        assert_eq!(decode_child_failure(&[0u8; 8]), None);
    }

    #[test]
    fn test_prepare_requires_interpreter_inside_jail() {
        let scratch = tempfile::tempdir().unwrap();
        let mut guard = crate::safety::CleanupGuard::new("prepare-test");
        let jail = Jail::build(
            scratch.path(),
            &crate::config::types::ExecutionId::new(),
            "",
            "sh",
            &mut guard,
        )
        .unwrap();

        let mut config = SandboxConfig::default();
        config.interpreter = "/bin/sh".to_string();
        config.script_extension = "sh".to_string();
        let namespaces = NamespaceIsolation::new_default("t");

        // No mounts were applied, so /bin/sh does not exist under the jail
        assert!(matches!(
            LaunchSpec::prepare(&config, &jail, &namespaces),
            Err(SandboxError::Spawn(_))
        ));

        std::fs::create_dir_all(jail.root().join("bin")).unwrap();
        std::fs::write(jail.root().join("bin/sh"), "").unwrap();
        let spec = LaunchSpec::prepare(&config, &jail, &namespaces).unwrap();
        assert_eq!(spec.program().to_str().unwrap(), "/bin/sh");
        assert_eq!(spec.argv()[1].to_str().unwrap(), "/app/main.sh");
        assert!(spec
            .envp()
            .iter()
            .any(|e| e.to_str() == Ok("PYTHONUNBUFFERED=1")));
    }
}
