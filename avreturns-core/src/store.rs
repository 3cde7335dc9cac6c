//! Object storage seam.
//!
//! The pipeline only needs to put, get and list objects by bucket and key.
//! `LocalObjectStore` maps buckets to directories under a root and keys to
//! relative paths, so Hive-style keys become `name=value/` directories.
//! `MemoryObjectStore` keeps everything in a map.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
}

/// Minimal object store: overwrite-on-put, prefix listing.
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `key`, replacing any existing object.
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Full keys starting with `prefix`, sorted.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Human-readable location of an object, for logs.
    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }
}

/// Options for [`list_keys`].
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Only keys ending with this suffix.
    pub suffix: String,
    /// Keep the prefix on returned keys.
    pub full_path: bool,
    /// Strip the final `.ext` of each key.
    pub remove_ext: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            suffix: String::new(),
            full_path: true,
            remove_ext: false,
        }
    }
}

/// List object keys under `prefix`, skipping directory markers.
pub fn list_keys(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    opts: &ListOptions,
) -> Result<Vec<String>, StoreError> {
    let keys = store
        .list(bucket, prefix)?
        .into_iter()
        .filter(|key| !key.ends_with('/') && key.ends_with(opts.suffix.as_str()))
        .map(|key| {
            let key = if opts.full_path {
                key
            } else {
                key.strip_prefix(prefix).unwrap_or(&key).to_string()
            };
            if opts.remove_ext {
                strip_extension(&key).to_string()
            } else {
                key
            }
        })
        .collect();
    Ok(keys)
}

fn strip_extension(key: &str) -> &str {
    match key.rfind('.') {
        Some(dot) if dot + 1 < key.len() && !key[dot..].contains('/') => &key[..dot],
        _ => key,
    }
}

// ── Filesystem store ────────────────────────────────────────────────

/// Store rooted at a local directory: `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && !key.ends_with('/')
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(bucket_dir.join(rel))
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        let valid = !bucket.is_empty()
            && Path::new(bucket)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !bucket.contains('/');
        if !valid {
            return Err(StoreError::InvalidKey(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        // Write to a sibling temp file, then rename into place.
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        fs::write(&tmp_path, bytes).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            io_err(&path)(e)
        })
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                io_err(&path)(e)
            }
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let bucket_dir = self.bucket_dir(bucket)?;

        // Start at the deepest directory the prefix fully names.
        let start_rel = match prefix.rfind('/') {
            Some(slash) => &prefix[..slash],
            None => "",
        };
        let start = if start_rel.is_empty() {
            bucket_dir.clone()
        } else {
            bucket_dir.join(start_rel)
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        collect_keys(&bucket_dir, &start, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        self.root.join(bucket).join(key).display().to_string()
    }
}

fn collect_keys(bucket_dir: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(bucket_dir, &path, keys)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(bucket_dir) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}

// ── In-memory store ─────────────────────────────────────────────────

/// Map-backed store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects across all buckets.
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}
