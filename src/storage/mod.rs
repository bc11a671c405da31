//! Blob storage for raw images and embedding records.
//!
//! Objects are addressed by `gs://{bucket}/{path}` URIs which the rest of the
//! crate treats as opaque identifiers. Two backends are provided:
//!
//! - `local`: a bucket laid out on the local filesystem
//! - `gcs`: Google Cloud Storage JSON API

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod gcs;
pub mod layout;
mod local;

pub use gcs::GcsBlobStore;
pub use layout::{embedding_record_path, embeddings_prefix, image_path, owner_prefix};
pub use local::LocalBlobStore;

const URI_SCHEME: &str = "gs";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("invalid blob uri: {0}")]
    InvalidUri(String),

    #[error("object {uri} belongs to bucket {found}, expected {expected}")]
    ForeignBucket {
        uri: String,
        found: String,
        expected: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage service returned {status}: {message}")]
    Remote { status: u16, message: String },
}

/// Fully qualified object address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobUri {
    pub bucket: String,
    pub path: String,
}

impl BlobUri {
    pub fn new(bucket: &str, path: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            path: path.trim_start_matches('/').to_string(),
        }
    }

    /// Last path segment, used as the file name when the object is
    /// downloaded locally.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl Display for BlobUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{URI_SCHEME}://{}/{}", self.bucket, self.path)
    }
}

impl FromStr for BlobUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = url::Url::parse(s).map_err(|_| StorageError::InvalidUri(s.to_string()))?;
        if parsed.scheme() != URI_SCHEME {
            return Err(StorageError::InvalidUri(s.to_string()));
        }

        let bucket = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;

        // keep the path exactly as written, `Url` would percent-encode it
        let path = s
            .splitn(4, '/')
            .nth(3)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;

        Ok(BlobUri::new(bucket, path))
    }
}

impl TryFrom<String> for BlobUri {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobUri> for String {
    fn from(uri: BlobUri) -> Self {
        uri.to_string()
    }
}

/// Object store consumed by the ingestion pipeline and the result
/// materializer. Paths are bucket-relative (`images/admin/cat.jpg`).
pub trait BlobStore: Send + Sync {
    fn bucket(&self) -> &str;

    fn put(&self, path: &str, data: &[u8], content_type: Option<&str>)
        -> Result<BlobUri, StorageError>;

    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Object paths under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Whether any object lives under `prefix`.
    fn exists(&self, prefix: &str) -> Result<bool, StorageError> {
        Ok(!self.list(prefix)?.is_empty())
    }

    /// Uploads a local file, typed by its sniffed content.
    fn put_file(&self, path: &str, file: &Path) -> Result<BlobUri, StorageError> {
        let data = std::fs::read(file)?;
        let content_type = infer::get(&data).map(|kind| kind.mime_type());
        self.put(path, &data, content_type)
    }

    fn get_to_file(&self, path: &str, dest: &Path) -> Result<(), StorageError> {
        let data = self.get(path)?;
        std::fs::write(dest, data)?;
        Ok(())
    }

    fn uri(&self, path: &str) -> BlobUri {
        BlobUri::new(self.bucket(), path)
    }

    /// Bucket-relative path of `uri`, rejecting objects from other buckets.
    fn relative_path(&self, uri: &BlobUri) -> Result<String, StorageError> {
        if uri.bucket != self.bucket() {
            return Err(StorageError::ForeignBucket {
                uri: uri.to_string(),
                found: uri.bucket.clone(),
                expected: self.bucket().to_string(),
            });
        }
        Ok(uri.path.clone())
    }
}

/// Rejects absolute paths and parent-directory segments.
pub(crate) fn validate_path(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|segment| segment == ".." || segment == ".");

    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}
