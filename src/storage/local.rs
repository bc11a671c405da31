use std::path::{Path, PathBuf};

use crate::eid::Eid;

use super::{validate_path, BlobStore, BlobUri, StorageError};

/// Filesystem-backed bucket: `{root}/{bucket}/{path}`.
///
/// Used for local development and tests; writes go through a temp file and
/// a rename so readers never see partial objects.
#[derive(Clone)]
pub struct LocalBlobStore {
    bucket: String,
    base_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path, bucket: &str) -> std::io::Result<Self> {
        let base_dir = root.join(bucket);
        std::fs::create_dir_all(&base_dir)?;
        Ok(LocalBlobStore {
            bucket: bucket.to_string(),
            base_dir,
        })
    }

    fn object_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.base_dir.join(path))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, out)?;
                continue;
            }

            let Ok(relative) = path.strip_prefix(&self.base_dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            // prefix markers are stored as `.keep` files inside the directory
            match name.strip_suffix(MARKER_FILE) {
                Some(dir_name) => out.push(dir_name.to_string()),
                None => out.push(name),
            }
        }
        Ok(())
    }
}

const MARKER_FILE: &str = ".keep";

impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(
        &self,
        path: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<BlobUri, StorageError> {
        let target = if path.ends_with('/') {
            self.object_path(path)?.join(MARKER_FILE)
        } else {
            self.object_path(path)?
        };

        let parent = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        std::fs::create_dir_all(parent)?;

        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{}-{file_name}", Eid::new()));

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &target)?;

        Ok(self.uri(path))
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.object_path(path)?;
        if !target.is_file() {
            return Err(StorageError::NotFound(self.uri(path).to_string()));
        }
        Ok(std::fs::read(target)?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        if self.base_dir.is_dir() {
            self.collect(&self.base_dir, &mut names)?;
        }

        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.object_path(path)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.uri(path).to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (LocalBlobStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), "bucket").unwrap();
        (store, tmp)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, _tmp) = store();
        let uri = store.put("images/admin/a.png", b"data", None).unwrap();
        assert_eq!(uri.to_string(), "gs://bucket/images/admin/a.png");
        assert_eq!(store.get("images/admin/a.png").unwrap(), b"data");
    }

    #[test]
    fn test_put_file_uploads_contents() {
        let (store, tmp) = store();
        let file = tmp.path().join("local.bin");
        std::fs::write(&file, b"local bytes").unwrap();

        let uri = store.put_file("images/admin/local.bin", &file).unwrap();

        assert_eq!(uri.path, "images/admin/local.bin");
        assert_eq!(store.get("images/admin/local.bin").unwrap(), b"local bytes");
        assert!(matches!(
            store.put_file("images/admin/gone.bin", &tmp.path().join("gone.bin")),
            Err(StorageError::Io(_))
        ));
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (store, _tmp) = store();
        let err = store.get("nope.json").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_list_by_prefix_is_sorted() {
        let (store, _tmp) = store();
        store.put("embeddings/202411/b.json", b"{}", None).unwrap();
        store.put("embeddings/202411/a.json", b"{}", None).unwrap();
        store.put("embeddings/202410/c.json", b"{}", None).unwrap();
        store.put("images/admin/x.png", b"x", None).unwrap();

        let listed = store.list("embeddings/202411").unwrap();
        assert_eq!(
            listed,
            vec!["embeddings/202411/a.json", "embeddings/202411/b.json"]
        );
        assert!(store.exists("images/").unwrap());
        assert!(!store.exists("images/users/").unwrap());
    }

    #[test]
    fn test_prefix_marker_counts_as_existing() {
        let (store, _tmp) = store();
        store.put("images/users/u1/", b"", None).unwrap();
        assert!(store.exists("images/users/u1/").unwrap());
        assert_eq!(store.list("images/").unwrap(), vec!["images/users/u1/"]);
    }

    #[test]
    fn test_rejects_traversal() {
        let (store, _tmp) = store();
        let err = store.put("../escape", b"x", None).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[test]
    fn test_delete() {
        let (store, _tmp) = store();
        store.put("a/b.json", b"{}", None).unwrap();
        store.delete("a/b.json").unwrap();
        assert!(matches!(
            store.delete("a/b.json"),
            Err(StorageError::NotFound(_))
        ));
    }
}
