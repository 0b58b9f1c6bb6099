//! Script runner: content-addressed upload, fetch and execution.
//!
//! The runner never builds its collaborators. Stores and the executor are
//! injected, so the same flow runs against Redis and a blob directory in
//! production and against in-memory fakes in tests.

use crate::config::types::{ExecutionOutcome, ExecutionRequest, Result};
use crate::exec::Supervisor;
use crate::store::{BlobStore, CacheState, ContentStore, Digest, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Anything that can run one script to completion
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome>;
}

impl ScriptExecutor for Supervisor {
    fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        self.run(request)
    }
}

/// Uploaded script as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub digest: Digest,
    /// False when the blob was already known and nothing was written
    pub stored: bool,
}

pub struct ScriptRunner {
    content: Arc<dyn ContentStore>,
    blobs: Arc<dyn BlobStore>,
    executor: Arc<dyn ScriptExecutor>,
    cache_ttl: Duration,
}

impl ScriptRunner {
    pub fn new(
        content: Arc<dyn ContentStore>,
        blobs: Arc<dyn BlobStore>,
        executor: Arc<dyn ScriptExecutor>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            content,
            blobs,
            executor,
            cache_ttl,
        }
    }

    /// Store a script body under its digest.
    ///
    /// The content store is advisory: when it is unreachable the blob is
    /// written anyway, since the blob store is the source of truth.
    pub fn upload(&self, script: &[u8]) -> Result<Upload> {
        let digest = Digest::of(script);

        let state = match self.content.get(&digest) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Content store lookup for {} failed: {}", digest, e);
                None
            }
        };

        if state == Some(CacheState::Cached) && self.blobs.exists(&digest)? {
            log::debug!("Script {} already cached", digest);
            return Ok(Upload {
                digest,
                stored: false,
            });
        }

        log::info!("Caching script {} ({} bytes)", digest, script.len());
        self.mark(&digest, CacheState::Pending);
        self.blobs.put(&digest, script)?;
        self.mark(&digest, CacheState::Cached);

        Ok(Upload {
            digest,
            stored: true,
        })
    }

    fn mark(&self, digest: &Digest, state: CacheState) {
        if let Err(e) = self.content.set(digest, state, self.cache_ttl) {
            log::warn!("Failed to mark {} as {}: {}", digest, state, e);
        }
    }

    /// Load a script body and check it still hashes to its digest
    pub fn fetch(&self, digest: &Digest) -> Result<String> {
        let body = self.blobs.get(digest)?;
        if !digest.matches(&body) {
            return Err(StoreError::Integrity {
                expected: digest.to_string(),
                actual: Digest::of(&body).to_string(),
            }
            .into());
        }

        String::from_utf8(body).map_err(|e| {
            StoreError::Backend(format!("Script {} is not valid UTF-8: {}", digest, e)).into()
        })
    }

    /// Run a previously uploaded script under a fresh execution id
    pub fn run(&self, digest: &Digest) -> Result<ExecutionOutcome> {
        let script = self.fetch(digest)?;
        let request = ExecutionRequest::new(script);
        log::info!("Running script {} as execution {}", digest, request.id);
        self.executor.execute(request)
    }

    /// Upload then run
    pub fn submit(&self, script: &str) -> Result<ExecutionOutcome> {
        let upload = self.upload(script.as_bytes())?;
        self.run(&upload.digest)
    }
}
