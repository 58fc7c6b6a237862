//! Content-addressed resolution of packaged files
//!
//! During import every packaged file is either found in the local cache by
//! its SHA-256 (the bytes are still consumed from the stream to keep the
//! cursor aligned) or streamed to a freshly allocated cache path. The result
//! is a `gamePath → filePath` dictionary with file swaps applied last.

use crate::cancel::CancelToken;
use crate::compression::PayloadReader;
use crate::error::{Result, SmaError};
use crate::io::{write_atomic, write_atomic_with};
use crate::metadata::{FileModData, PayloadMetadata, CONTENT_HASH_LEN};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Local content-addressed file store
pub trait FileCache: Send + Sync {
    /// Path of a cached file with this content hash
    fn lookup_by_hash(&self, hash: &str) -> Option<PathBuf>;

    /// Where a new file with this hash should be written
    fn allocate_path(&self, hash: &str, extension: &str) -> Result<PathBuf>;

    /// Record a fully written, verified file
    fn commit(&self, hash: &str, path: &Path) -> Result<()>;
}

/// Directory-backed cache storing files as `<hash>.<ext>`
pub struct LocalFileCache {
    root: PathBuf,
    index: RwLock<HashMap<String, PathBuf>>,
}

impl LocalFileCache {
    /// Open (or create) a cache directory and index its contents
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut index = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stem = name.split('.').next().unwrap_or_default();
            if stem.len() == CONTENT_HASH_LEN && stem.bytes().all(|b| b.is_ascii_hexdigit()) {
                index.insert(stem.to_ascii_lowercase(), entry.path());
            }
        }

        info!("Opened file cache at {:?} ({} files)", root, index.len());
        Ok(LocalFileCache {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

impl FileCache for LocalFileCache {
    fn lookup_by_hash(&self, hash: &str) -> Option<PathBuf> {
        let path = self.index.read().get(hash).cloned()?;
        if path.exists() {
            Some(path)
        } else {
            warn!("Cached file for {} vanished from {:?}", hash, path);
            self.index.write().remove(hash);
            None
        }
    }

    fn allocate_path(&self, hash: &str, extension: &str) -> Result<PathBuf> {
        Ok(self.root.join(format!("{}.{}", hash, extension)))
    }

    fn commit(&self, hash: &str, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(SmaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("committed path {:?} does not exist", path),
            )));
        }
        self.index.write().insert(hash.to_string(), path.to_path_buf());
        Ok(())
    }
}

/// One lock per content hash, so concurrent imports of the same file make
/// a single write-or-skip decision
#[derive(Default)]
pub struct HashLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `hash`
    pub fn with_lock<T>(&self, hash: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .entry(hash.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.locks.lock();
        // Only the map and this call still hold it: nobody is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(hash);
        }
        result
    }

    /// Hashes with a lock currently held or awaited
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Counters for one resolve pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Entries already present in the cache
    pub hits: usize,
    /// Entries written to the cache
    pub written: usize,
    pub bytes_written: u64,
    /// Game paths redirected by file swaps
    pub swaps: usize,
}

/// Resolves packaged files against a [`FileCache`]
pub struct ContentResolver {
    cache: Arc<dyn FileCache>,
    locks: Arc<HashLocks>,
}

impl ContentResolver {
    pub fn new(cache: Arc<dyn FileCache>) -> Self {
        Self::with_locks(cache, Arc::new(HashLocks::new()))
    }

    /// Share hash locks with other resolvers over the same cache
    pub fn with_locks(cache: Arc<dyn FileCache>, locks: Arc<HashLocks>) -> Self {
        ContentResolver { cache, locks }
    }

    pub fn cache(&self) -> &Arc<dyn FileCache> {
        &self.cache
    }

    /// Consume the files blob of `reader` and build the game path mapping.
    ///
    /// `reader` must be positioned right after the metadata section. Any
    /// error aborts the whole import; files already committed stay in the
    /// cache, where they are valid content for later imports.
    pub fn resolve<M: PayloadMetadata, R: Read>(
        &self,
        metadata: &M,
        mut reader: PayloadReader<R>,
        cancel: &CancelToken,
    ) -> Result<(BTreeMap<String, String>, ResolveReport)> {
        let mut mapping = BTreeMap::new();
        let mut report = ResolveReport::default();

        for entry in metadata.files() {
            cancel.check()?;
            let path = self.locks.with_lock(&entry.content_hash, || {
                self.resolve_entry(entry, &mut reader, cancel, &mut report)
            })?;
            let path = path.to_string_lossy().into_owned();
            for game_path in &entry.game_paths {
                mapping.insert(game_path.clone(), path.clone());
            }
        }
        reader.finish()?;

        for swap in metadata.swaps() {
            for game_path in &swap.game_paths {
                mapping.insert(game_path.clone(), swap.swap_target_path.clone());
                report.swaps += 1;
            }
        }

        info!(
            "Resolved {} files: {} cache hits, {} written ({} bytes), {} swapped paths",
            metadata.files().len(),
            report.hits,
            report.written,
            report.bytes_written,
            report.swaps
        );
        Ok((mapping, report))
    }

    /// Put in-memory content into the cache, returning its path
    pub fn store_bytes(&self, entry: &FileModData, bytes: &[u8]) -> Result<PathBuf> {
        self.locks.with_lock(&entry.content_hash, || {
            if let Some(existing) = self.cache.lookup_by_hash(&entry.content_hash) {
                return Ok(existing);
            }
            let target = self
                .cache
                .allocate_path(&entry.content_hash, &entry.extension())?;
            debug!("Storing {} at {:?}", entry.content_hash, target);
            write_atomic(&target, bytes)?;
            self.cache.commit(&entry.content_hash, &target)?;
            Ok(target)
        })
    }

    fn resolve_entry<R: Read>(
        &self,
        entry: &FileModData,
        reader: &mut PayloadReader<R>,
        cancel: &CancelToken,
        report: &mut ResolveReport,
    ) -> Result<PathBuf> {
        if let Some(existing) = self.cache.lookup_by_hash(&entry.content_hash) {
            debug!("Cache hit for {}", entry.content_hash);
            reader.skip_entry(entry.byte_length, cancel)?;
            report.hits += 1;
            return Ok(existing);
        }

        let target = self
            .cache
            .allocate_path(&entry.content_hash, &entry.extension())?;
        debug!("Writing {} to {:?}", entry.content_hash, target);

        write_atomic_with(&target, |file| {
            let mut sink = HashingWriter::new(file);
            reader.copy_entry(entry.byte_length, &mut sink, cancel)?;
            let actual = sink.finish();
            if actual != entry.content_hash {
                warn!(
                    "Content hash mismatch for {}: computed {}",
                    entry.content_hash, actual
                );
                return Err(SmaError::HashMismatch {
                    expected: entry.content_hash.clone(),
                    actual,
                });
            }
            Ok(())
        })?;

        self.cache.commit(&entry.content_hash, &target)?;
        report.written += 1;
        report.bytes_written += entry.byte_length;
        Ok(target)
    }
}

/// Write-through adapter that hashes everything written
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
