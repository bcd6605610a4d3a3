//! Storage Abstraction
//!
//! The graph builder, freshness analysis and output verification only see
//! files through [`Storage`]. [`LocalStorage`] resolves paths against a root
//! directory; [`MemoryStorage`] keeps everything in memory for tests and
//! simulated runs.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use blake3::Hasher;
use log::debug;

/// File operations the engine needs. Paths are the strings used in rules.
pub trait Storage: Send + Sync + Debug {
    fn exists(&self, path: &str) -> bool;

    /// Last modification time, `None` if the file does not exist.
    fn mtime(&self, path: &str) -> Option<SystemTime>;

    /// Size in bytes, `None` if the file does not exist.
    fn size(&self, path: &str) -> Option<u64>;

    /// blake3 digest of the file content as hex.
    fn content_hash(&self, path: &str) -> io::Result<String>;

    /// Creates the file if missing and bumps its modification time.
    fn touch(&self, path: &str) -> io::Result<()>;

    fn remove(&self, path: &str) -> io::Result<()>;

    /// All files whose path starts with `prefix`, sorted.
    fn list_files(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Directory relative paths resolve against, if backed by a filesystem.
    fn root(&self) -> Option<&Path> {
        None
    }
}

/// Storage on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path for a rule path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    fn walk(&self, dir: &Path, logical: &str, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = if logical.is_empty() {
                name
            } else {
                format!("{}/{}", logical, name)
            };

            // Only descend into directories that can still contain matches.
            if !path.starts_with(prefix) && !prefix.starts_with(&path) {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(&entry.path(), &path, prefix, out)?;
            } else if path.starts_with(prefix) {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn mtime(&self, path: &str) -> Option<SystemTime> {
        fs::metadata(self.resolve(path)).and_then(|m| m.modified()).ok()
    }

    fn size(&self, path: &str) -> Option<u64> {
        fs::metadata(self.resolve(path)).map(|m| m.len()).ok()
    }

    fn content_hash(&self, path: &str) -> io::Result<String> {
        let mut hasher = Hasher::new();
        let mut file = File::open(self.resolve(path))?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    fn touch(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::options().create(true).append(true).open(&full)?;
        file.set_modified(SystemTime::now())?;
        debug!("Touched {}", full.display());
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path);
        if full.is_dir() {
            fs::remove_dir_all(&full)
        } else {
            fs::remove_file(&full)
        }
    }

    fn list_files(&self, prefix: &str) -> io::Result<Vec<String>> {
        let (dir, logical) = match prefix.rfind('/') {
            Some(i) => (self.resolve(&prefix[..i]), prefix[..i].to_string()),
            None => (self.root.clone(), String::new()),
        };

        let mut out = Vec::new();
        self.walk(&dir, &logical, prefix, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    mtime: SystemTime,
}

#[derive(Debug, Default)]
struct MemoryInner {
    files: BTreeMap<String, MemoryFile>,
    clock: u64,
}

impl MemoryInner {
    /// Every write gets a strictly later timestamp.
    fn tick(&mut self) -> SystemTime {
        self.clock += 1;
        UNIX_EPOCH + Duration::from_secs(1_000_000 + self.clock)
    }
}

/// In-memory storage. Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes a file, giving it the next timestamp.
    pub fn add_file(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        let mtime = inner.tick();
        inner.files.insert(
            path.into(),
            MemoryFile {
                content: content.into(),
                mtime,
            },
        );
    }

    /// Overrides the modification time of an existing file.
    pub fn set_mtime(&self, path: &str, mtime: SystemTime) {
        if let Some(file) = self.lock().files.get_mut(path) {
            file.mtime = mtime;
        }
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.content.clone())
    }

    /// All stored paths.
    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
}

impl Storage for MemoryStorage {
    fn exists(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    fn mtime(&self, path: &str) -> Option<SystemTime> {
        self.lock().files.get(path).map(|f| f.mtime)
    }

    fn size(&self, path: &str) -> Option<u64> {
        self.lock().files.get(path).map(|f| f.content.len() as u64)
    }

    fn content_hash(&self, path: &str) -> io::Result<String> {
        let inner = self.lock();
        let file = inner.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(blake3::hash(&file.content).to_hex().to_string())
    }

    fn touch(&self, path: &str) -> io::Result<()> {
        let mut inner = self.lock();
        let mtime = inner.tick();
        inner
            .files
            .entry(path.to_string())
            .and_modify(|f| f.mtime = mtime)
            .or_insert(MemoryFile {
                content: Vec::new(),
                mtime,
            });
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        self.lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn list_files(&self, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .lock()
            .files
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }
}
