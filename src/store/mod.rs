//! Content-addressed script storage.
//!
//! Scripts are keyed by the lowercase hex BLAKE3 hash of their body. The content
//! store tracks cache state per digest; the blob store holds the bodies.

pub mod blob;
pub mod content;
pub mod digest;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
#[cfg(feature = "s3-backend")]
pub use blob::S3BlobStore;
pub use content::{CacheState, ContentStore, MemoryContentStore};
#[cfg(feature = "redis-backend")]
pub use content::RedisContentStore;
pub use digest::Digest;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
