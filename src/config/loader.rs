/// Configuration loading from tamarun.json
use crate::config::types::{LimitFailurePolicy, MountBinding, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File looked up in the working directory by [`SandboxConfig::load_default`]
pub const DEFAULT_CONFIG_FILE: &str = "tamarun.json";

/// Default memory ceiling: 128 MiB
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 128 * 1024 * 1024;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Host directory under which per-execution jails are created
    pub jail_root: PathBuf,
    /// Host cgroup v2 directory under which per-execution scopes are created
    pub cgroup_root: PathBuf,
    /// Interpreter binary; bare names are resolved on the host PATH
    pub interpreter: String,
    /// Script file extension (`main.<ext>` inside the jail)
    pub script_extension: String,
    /// Extra environment for the interpreter
    pub environment: BTreeMap<String, String>,
    /// Pass the supervisor's own environment through before `environment`
    pub inherit_environment: bool,
    /// Host directories bind-mounted read-only into the jail, in order
    pub mounts: Vec<MountBinding>,
    /// Memory ceiling written to `memory.max`
    pub memory_limit_bytes: u64,
    pub limit_failure_policy: LimitFailurePolicy,
    /// Kill the interpreter after this many seconds; unbounded when unset
    pub wall_timeout_secs: Option<u64>,
    /// Hostname inside the UTS namespace
    pub hostname: String,
    /// Check for leaked jail, mounts and cgroup after teardown
    pub verify_teardown: bool,
    pub cache: CacheConfig,
}

/// Script cache settings used by the CLI when wiring up stores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis URL for cache-state lookups; in-memory when unset
    pub redis_url: Option<String>,
    /// Directory holding script bodies, one file per digest
    pub blob_dir: PathBuf,
    /// Lifetime of cache-state entries
    pub ttl_secs: u64,
    /// S3-compatible object store for script bodies; replaces `blob_dir`
    /// when set and built with `s3-backend`
    pub s3: Option<S3Config>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            blob_dir: std::env::temp_dir().join("tamarun-blobs"),
            ttl_secs: 60,
            s3: None,
        }
    }
}

/// S3-compatible bucket (MinIO or AWS) addressed path-style
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Base URL, e.g. `http://minio.local:9000`
    pub endpoint: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

fn default_bucket() -> String {
    "tamarun".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut environment = BTreeMap::new();
        environment.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            jail_root: std::env::temp_dir(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            interpreter: "python3".to_string(),
            script_extension: "py".to_string(),
            environment,
            inherit_environment: true,
            mounts: vec![
                MountBinding::new("/bin"),
                MountBinding::new("/lib"),
                MountBinding::optional("/lib64"),
                MountBinding::new("/usr"),
                MountBinding::new("/sys"),
            ],
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            limit_failure_policy: LimitFailurePolicy::Abort,
            wall_timeout_secs: None,
            hostname: "tamarun".to_string(),
            verify_teardown: true,
            cache: CacheConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: SandboxConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load ./tamarun.json when present, built-in defaults otherwise
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| SandboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            log::debug!(
                "{} not found in current directory, using defaults",
                DEFAULT_CONFIG_FILE
            );
            return Ok(Self::default());
        }

        log::info!("Loading configuration from {}", config_path.display());
        Self::load_from_file(config_path)
    }

    pub fn wall_timeout(&self) -> Option<Duration> {
        self.wall_timeout_secs.map(Duration::from_secs)
    }

    /// Path of the script as seen from inside the jail
    pub fn script_path_in_jail(&self) -> PathBuf {
        PathBuf::from("/app").join(format!("main.{}", self.script_extension))
    }

    /// Resolve symlinks in `jail_root`.
    ///
    /// Mount points are matched against `/proc/self/mounts`, which lists
    /// canonical paths only.
    pub fn canonicalize_jail_root(&mut self) -> Result<()> {
        self.jail_root = std::fs::canonicalize(&self.jail_root).map_err(|e| {
            SandboxError::Config(format!(
                "Cannot resolve jail_root {}: {}",
                self.jail_root.display(),
                e
            ))
        })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, root) in [("jail_root", &self.jail_root), ("cgroup_root", &self.cgroup_root)] {
            if !root.is_absolute() {
                return Err(SandboxError::Config(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    root.display()
                )));
            }
        }

        if self.interpreter.trim().is_empty() {
            return Err(SandboxError::Config("interpreter must not be empty".to_string()));
        }

        if self.script_extension.is_empty()
            || !self
                .script_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(SandboxError::Config(format!(
                "script_extension must be non-empty ASCII alphanumeric, got '{}'",
                self.script_extension
            )));
        }

        if self.memory_limit_bytes == 0 {
            return Err(SandboxError::Config(
                "memory_limit_bytes must be greater than zero".to_string(),
            ));
        }

        if self.wall_timeout_secs == Some(0) {
            return Err(SandboxError::Config(
                "wall_timeout_secs must be greater than zero when set".to_string(),
            ));
        }

        if self.hostname.is_empty() || self.hostname.len() > 64 {
            return Err(SandboxError::Config(format!(
                "hostname must be 1-64 bytes, got {} bytes",
                self.hostname.len()
            )));
        }

        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(SandboxError::Config(format!(
                    "Invalid environment entry: {:?}",
                    key
                )));
            }
        }

        if let Some(s3) = &self.cache.s3 {
            if s3.endpoint.is_empty() || s3.bucket.is_empty() {
                return Err(SandboxError::Config(
                    "cache.s3 needs a non-empty endpoint and bucket".to_string(),
                ));
            }
        }

        for binding in &self.mounts {
            binding.validate()?;
            if binding.jail_target().starts_with("/app") {
                return Err(SandboxError::Config(format!(
                    "Mount target {} would shadow the script directory",
                    binding.jail_target().display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SandboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory_limit_bytes, 134_217_728);
        assert_eq!(config.script_path_in_jail(), PathBuf::from("/app/main.py"));
        assert_eq!(
            config.environment.get("PYTHONUNBUFFERED").map(String::as_str),
            Some("1")
        );
        assert!(config.wall_timeout().is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"memory_limit_bytes": 1048576, "limit_failure_policy": "proceed",
                "mounts": [{{"source": "/usr"}}, {{"source": "/lib64", "optional": true}}]}}"#
        )
        .unwrap();

        let config = SandboxConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.memory_limit_bytes, 1_048_576);
        assert_eq!(config.limit_failure_policy, LimitFailurePolicy::Proceed);
        assert_eq!(config.mounts.len(), 2);
        assert!(config.mounts[1].optional);
        assert_eq!(config.interpreter, "python3");
        assert!(config.cache.s3.is_none());
    }

    #[test]
    fn test_s3_section_defaults() {
        let config: SandboxConfig = serde_json::from_str(
            r#"{"cache": {"s3": {"endpoint": "http://minio.local:9000",
                "access_key": "ak", "secret_key": "sk"}}}"#,
        )
        .unwrap();
        let s3 = config.cache.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "tamarun");
        assert_eq!(s3.region, "us-east-1");
        assert!(config.validate().is_ok());

        let missing_key = r#"{"cache": {"s3": {"endpoint": "http://minio.local:9000"}}}"#;
        assert!(serde_json::from_str::<SandboxConfig>(missing_key).is_err());

        let mut config = config;
        if let Some(s3) = config.cache.s3.as_mut() {
            s3.endpoint.clear();
        }
        assert!(matches!(config.validate(), Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SandboxConfig::default();
        config.script_extension = "p/y".to_string();
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default();
        config.memory_limit_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default();
        config.wall_timeout_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default();
        config.mounts.push(MountBinding::new("opt"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_roots_rejected() {
        let mut config = SandboxConfig::default();
        config.jail_root = PathBuf::from("jails");
        assert!(matches!(config.validate(), Err(SandboxError::Config(_))));

        let mut config = SandboxConfig::default();
        config.cgroup_root = PathBuf::from("sys/fs/cgroup");
        assert!(matches!(config.validate(), Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_canonicalize_resolves_symlinked_jail_root() {
        let scratch = tempfile::tempdir().unwrap();
        let real = scratch.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = scratch.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut config = SandboxConfig::default();
        config.jail_root = link;
        config.canonicalize_jail_root().unwrap();
        assert_eq!(config.jail_root, std::fs::canonicalize(&real).unwrap());

        config.jail_root = scratch.path().join("missing");
        assert!(config.canonicalize_jail_root().is_err());
    }

    #[test]
    fn test_mount_over_script_dir_rejected() {
        let mut config = SandboxConfig::default();
        config.mounts.push(MountBinding {
            source: PathBuf::from("/opt"),
            target: Some(PathBuf::from("/app/lib")),
            optional: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = SandboxConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }
}
