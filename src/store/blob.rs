/// Blob store: script bodies keyed by digest
use crate::store::{Digest, StoreError, StoreResult};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait BlobStore: Send + Sync {
    fn backend_name(&self) -> &str;
    /// Missing blobs are [`StoreError::NotFound`]
    fn get(&self, digest: &Digest) -> StoreResult<Vec<u8>>;
    fn put(&self, digest: &Digest, content: &[u8]) -> StoreResult<()>;
    fn exists(&self, digest: &Digest) -> StoreResult<bool>;
}

/// One file per digest under a directory.
///
/// Writes go to a uniquely named temp file in the same directory and are
/// renamed into place, so readers never observe a partial blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.as_str())
    }
}

impl BlobStore for FsBlobStore {
    fn backend_name(&self) -> &str {
        "filesystem"
    }

    fn get(&self, digest: &Digest) -> StoreResult<Vec<u8>> {
        match fs::read(self.blob_path(digest)) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, digest: &Digest, content: &[u8]) -> StoreResult<()> {
        let final_path = self.blob_path(digest);
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", digest, uuid::Uuid::new_v4()));

        let written = fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(content)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&temp_path, &final_path));

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        log::debug!("Stored blob {} ({} bytes)", digest, content.len());
        Ok(())
    }

    fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(self.blob_path(digest).is_file())
    }
}

/// Process-local blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<Digest, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| StoreError::Backend("blob store lock poisoned".to_string()))
    }
}

impl BlobStore for MemoryBlobStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    fn get(&self, digest: &Digest) -> StoreResult<Vec<u8>> {
        self.lock()?
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(digest.to_string()))
    }

    fn put(&self, digest: &Digest, content: &[u8]) -> StoreResult<()> {
        self.lock()?.insert(digest.clone(), content.to_vec());
        Ok(())
    }

    fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(self.lock()?.contains_key(digest))
    }
}

/// Bucket of an S3-compatible object store, one object per digest.
///
/// Uses the blocking client; requests are path-style so MinIO endpoints
/// work without per-bucket DNS.
#[cfg(feature = "s3-backend")]
pub struct S3BlobStore {
    bucket: Box<s3::Bucket>,
}

#[cfg(feature = "s3-backend")]
impl S3BlobStore {
    pub fn open(config: &crate::config::S3Config) -> StoreResult<Self> {
        let region = s3::Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };
        let credentials = s3::creds::Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StoreError::Backend(format!("Invalid S3 credentials: {}", e)))?;

        let bucket = s3::Bucket::new(&config.bucket, region, credentials)
            .map_err(s3_error)?
            .with_path_style();
        Ok(Self { bucket })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket.name
    }
}

#[cfg(feature = "s3-backend")]
fn s3_error(e: s3::error::S3Error) -> StoreError {
    StoreError::Backend(format!("S3: {}", e))
}

#[cfg(feature = "s3-backend")]
impl BlobStore for S3BlobStore {
    fn backend_name(&self) -> &str {
        "s3"
    }

    fn get(&self, digest: &Digest) -> StoreResult<Vec<u8>> {
        match self.bucket.get_object(digest.as_str()) {
            Ok(response) => match response.status_code() {
                200..=299 => Ok(response.bytes().to_vec()),
                404 => Err(StoreError::NotFound(digest.to_string())),
                code => Err(StoreError::Backend(format!(
                    "S3 GET {} returned HTTP {}",
                    digest, code
                ))),
            },
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => {
                Err(StoreError::NotFound(digest.to_string()))
            }
            Err(e) => Err(s3_error(e)),
        }
    }

    fn put(&self, digest: &Digest, content: &[u8]) -> StoreResult<()> {
        let response = self
            .bucket
            .put_object(digest.as_str(), content)
            .map_err(s3_error)?;
        match response.status_code() {
            200..=299 => {
                log::debug!(
                    "Stored blob {} in bucket {} ({} bytes)",
                    digest,
                    self.bucket.name,
                    content.len()
                );
                Ok(())
            }
            code => Err(StoreError::Backend(format!(
                "S3 PUT {} returned HTTP {}",
                digest, code
            ))),
        }
    }

    fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        match self.bucket.head_object(digest.as_str()) {
            Ok((_, 200..=299)) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, code)) => Err(StoreError::Backend(format!(
                "S3 HEAD {} returned HTTP {}",
                digest, code
            ))),
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(s3_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_put_get() {
        let scratch = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(scratch.path().join("blobs")).unwrap();
        let body = b"print('hello')";
        let digest = Digest::of(body);

        assert!(!store.exists(&digest).unwrap());
        assert!(matches!(store.get(&digest), Err(StoreError::NotFound(_))));

        store.put(&digest, body).unwrap();
        assert!(store.exists(&digest).unwrap());
        assert_eq!(store.get(&digest).unwrap(), body);

        // Only the final blob remains, no temp files
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![digest.to_string()]);
    }

    #[test]
    fn test_fs_store_overwrite() {
        let scratch = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(scratch.path()).unwrap();
        let digest = Digest::of(b"a");
        store.put(&digest, b"a").unwrap();
        store.put(&digest, b"a").unwrap();
        assert_eq!(store.get(&digest).unwrap(), b"a");
    }

    #[cfg(feature = "s3-backend")]
    #[test]
    fn test_s3_store_opens_without_network() {
        let config = crate::config::S3Config {
            endpoint: "http://127.0.0.1:9".to_string(),
            bucket: "tamarun".to_string(),
            region: "us-east-1".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
        };
        let store = S3BlobStore::open(&config).unwrap();
        assert_eq!(store.backend_name(), "s3");
        assert_eq!(store.bucket_name(), "tamarun");

        // Nothing listens on the discard port
        assert!(matches!(
            store.exists(&Digest::of(b"x")),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new();
        let digest = Digest::of(b"x");
        assert!(store.is_empty());
        assert!(matches!(store.get(&digest), Err(StoreError::NotFound(d)) if d == digest.as_str()));
        store.put(&digest, b"x").unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.exists(&digest).unwrap());
    }
}
