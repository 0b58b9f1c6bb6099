use crate::config::loader::{SandboxConfig, DEFAULT_CONFIG_FILE};
use crate::config::types::{ExecutionOutcome, ExitKind, MountBinding, SandboxError};
use crate::core::{ScriptExecutor, ScriptRunner};
use crate::exec::Supervisor;
use crate::kernel::cgroup::detect_cgroup_v2;
use crate::kernel::namespace::NamespaceIsolation;
use crate::store::{BlobStore, ContentStore, Digest, FsBlobStore, MemoryContentStore};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON); defaults to ./tamarun.json when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Limits shared by `run` and `exec`
#[derive(Args, Debug, Default)]
struct RunOptions {
    /// Memory limit in MB
    #[arg(long)]
    mem: Option<u64>,
    /// Wall clock time limit in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Extra read-only bind (format: source[=target][:optional])
    #[arg(long = "mount", value_name = "BINDING")]
    mounts: Vec<String>,
    /// Interpreter name or absolute path
    #[arg(long)]
    interpreter: Option<String>,
    /// Print the outcome as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file in a fresh jail
    Run {
        /// Script to execute
        file: PathBuf,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Run a script given inline
    Exec {
        /// Script source as string
        #[arg(long)]
        code: String,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Print the content digest of a file
    Digest {
        file: PathBuf,
    },
    /// Report whether this host can run sandboxed scripts
    Check,
}

/// Parse arguments, dispatch, and exit with the script's status
pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Digest { file } => {
            let body = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}", Digest::of(&body));
            Ok(())
        }
        Commands::Check => {
            let config = load_config(cli.config.as_ref())?;
            let ready = check_host(&config);
            std::process::exit(if ready { 0 } else { 1 });
        }
        Commands::Run { file, options } => {
            let script = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read script {}", file.display()))?;
            execute_script(cli.config.as_ref(), &script, options)
        }
        Commands::Exec { code, options } => execute_script(cli.config.as_ref(), &code, options),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SandboxConfig> {
    let config = match path {
        Some(path) => SandboxConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SandboxConfig::load_default()
            .with_context(|| format!("Failed to load {}", DEFAULT_CONFIG_FILE))?,
    };
    Ok(config)
}

fn apply_overrides(mut config: SandboxConfig, options: &RunOptions) -> Result<SandboxConfig> {
    if let Some(memory_mb) = options.mem {
        config.memory_limit_bytes = memory_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| SandboxError::Config(format!("--mem {} MB is out of range", memory_mb)))?;
    }
    if let Some(seconds) = options.timeout {
        config.wall_timeout_secs = Some(seconds);
    }
    if let Some(interpreter) = &options.interpreter {
        config.interpreter = interpreter.clone();
    }
    for binding in &options.mounts {
        let binding = MountBinding::parse(binding)
            .with_context(|| format!("Invalid --mount '{}'", binding))?;
        config.mounts.push(binding);
    }
    config.validate()?;
    Ok(config)
}

fn build_runner(config: SandboxConfig) -> Result<ScriptRunner> {
    let cache_ttl = config.cache.ttl();
    let content = content_store(&config)?;
    let blobs = blob_store(&config)?;
    log::debug!("Blob store: {}", blobs.backend_name());
    let executor: Arc<dyn ScriptExecutor> = Arc::new(Supervisor::new(config)?);

    Ok(ScriptRunner::new(content, blobs, executor, cache_ttl))
}

#[cfg(feature = "redis-backend")]
fn content_store(config: &SandboxConfig) -> Result<Arc<dyn ContentStore>> {
    match &config.cache.redis_url {
        Some(url) => {
            let store = crate::store::RedisContentStore::open(url)?;
            store
                .ping()
                .with_context(|| format!("Redis at {} is not reachable", url))?;
            log::info!("Using Redis content store at {}", url);
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryContentStore::new())),
    }
}

#[cfg(not(feature = "redis-backend"))]
fn content_store(config: &SandboxConfig) -> Result<Arc<dyn ContentStore>> {
    if config.cache.redis_url.is_some() {
        log::warn!("redis_url is set but tamarun was built without redis-backend");
    }
    Ok(Arc::new(MemoryContentStore::new()))
}

fn fs_blob_store(config: &SandboxConfig) -> Result<Arc<dyn BlobStore>> {
    let dir = &config.cache.blob_dir;
    let store = FsBlobStore::open(dir)
        .with_context(|| format!("Failed to open blob dir {}", dir.display()))?;
    Ok(Arc::new(store))
}

#[cfg(feature = "s3-backend")]
fn blob_store(config: &SandboxConfig) -> Result<Arc<dyn BlobStore>> {
    match &config.cache.s3 {
        Some(s3) => {
            let store = crate::store::S3BlobStore::open(s3)
                .with_context(|| format!("Failed to configure S3 bucket {}", s3.bucket))?;
            log::info!("Using S3 blob store {} at {}", s3.bucket, s3.endpoint);
            Ok(Arc::new(store))
        }
        None => fs_blob_store(config),
    }
}

#[cfg(not(feature = "s3-backend"))]
fn blob_store(config: &SandboxConfig) -> Result<Arc<dyn BlobStore>> {
    if config.cache.s3.is_some() {
        log::warn!("cache.s3 is set but tamarun was built without s3-backend");
    }
    fs_blob_store(config)
}

fn execute_script(config_path: Option<&PathBuf>, script: &str, options: RunOptions) -> Result<()> {
    let config = apply_overrides(load_config(config_path)?, &options)?;

    if !nix::unistd::geteuid().is_root() {
        eprintln!("Warning: tamarun usually needs root for mounts and cgroups");
    }

    let runner = build_runner(config)?;
    let upload = runner.upload(script.as_bytes())?;
    log::info!(
        "Script {} {}",
        upload.digest,
        if upload.stored { "stored" } else { "already cached" }
    );

    let outcome = runner.run(&upload.digest)?;
    report(&outcome, options.json)?;
    std::process::exit(outcome.status.exit_code());
}

fn report(outcome: &ExecutionOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let status = match outcome.status {
        ExitKind::Exited(code) => format!("exited with code {}", code),
        ExitKind::Signaled(signal) => format!("killed by signal {}", signal),
        ExitKind::TimedOut => "timed out".to_string(),
    };
    eprintln!(
        "Execution {} {} after {:?}",
        outcome.id,
        status,
        outcome.wall_time()
    );
    if !outcome.memory_limited {
        eprintln!("Warning: ran without a memory limit");
    }
    if let Some(kills) = outcome.oom_kills.filter(|k| *k > 0) {
        eprintln!("Memory limit exceeded ({} OOM kill(s))", kills);
    }
    Ok(())
}

fn check_host(config: &SandboxConfig) -> bool {
    println!("🔍 Checking host capabilities...");
    println!();

    let mut checks: Vec<(&str, bool, String)> = Vec::new();

    let root = nix::unistd::geteuid().is_root();
    checks.push(("root privileges", root, format!("euid {}", nix::unistd::geteuid())));

    checks.push((
        "namespaces",
        NamespaceIsolation::is_supported(),
        "/proc/self/ns".to_string(),
    ));

    checks.push((
        "cgroup v2",
        detect_cgroup_v2(&config.cgroup_root),
        config.cgroup_root.display().to_string(),
    ));

    match crate::exec::launch::resolve_interpreter(&config.interpreter) {
        Ok(path) => checks.push(("interpreter", true, path.display().to_string())),
        Err(e) => checks.push(("interpreter", false, e.to_string())),
    }

    let jail_root_ok = config.jail_root.is_dir();
    checks.push((
        "jail root",
        jail_root_ok,
        config.jail_root.display().to_string(),
    ));

    for binding in config.mounts.iter().filter(|b| !b.optional) {
        checks.push((
            "mount source",
            binding.source.is_dir(),
            binding.source.display().to_string(),
        ));
    }

    let mut all_ok = true;
    for (name, ok, detail) in &checks {
        if *ok {
            println!("✅ {} - OK ({})", name, detail);
        } else {
            println!("❌ {} - MISSING ({})", name, detail);
            all_ok = false;
        }
    }

    println!();
    if all_ok {
        println!("🎉 Host is ready");
    } else {
        println!("⚠️  Some requirements are missing");
    }
    all_ok
}
