// src/cache/mod.rs

//! Content-addressed artifact cache
//!
//! Artifacts are keyed by their sha256 digest and extracted into
//! `artifacts/<digest>/`. A per-digest advisory file lock under `locks/`
//! serializes fetches across process boundaries: concurrent callers for the
//! same digest block on the lock and, once it clears, observe the ready
//! entry without re-downloading. The lock file exists only while a fetch is
//! in flight.
//!
//! Entries are immutable once ready. On a failed fetch every piece of
//! partial state is removed before the lock releases, so a retry starts
//! clean. A digest mismatch is fatal to the fetch; the caller must
//! re-resolve before trying again.

use crate::error::{Error, Result};
use crate::resolver::ResolvedPackage;
use crate::sources::HttpClient;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval while waiting on another process's fetch
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default deadline for acquiring a digest lock
pub const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Observable state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryState {
    /// No artifact and no fetch in flight
    Absent,
    /// Another caller holds the digest lock
    Fetching,
    /// Artifact present and immutable
    Ready,
    /// The most recent fetch by this caller failed; on disk this is
    /// indistinguishable from `Absent` because partial state is removed
    Failed,
}

/// Content-addressed artifact store shared between processes
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Open (and lay out) a cache under the given root directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("artifacts"))?;
        fs::create_dir_all(root.join("locks"))?;
        fs::create_dir_all(root.join("tmp"))?;
        debug!("Opened cache at {}", root.display());
        Ok(Self { root })
    }

    /// Directory an artifact occupies once ready. Digests are
    /// case-insensitive; entries are keyed by the lowercase form.
    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.root
            .join("artifacts")
            .join(digest.to_ascii_lowercase())
    }

    fn lock_path(&self, digest: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", digest.to_ascii_lowercase()))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Whether an artifact is present and ready
    pub fn contains(&self, digest: &str) -> bool {
        self.path_for(digest).is_dir()
    }

    /// Current state of an entry as observable from disk
    pub fn entry_state(&self, digest: &str) -> CacheEntryState {
        if self.contains(digest) {
            return CacheEntryState::Ready;
        }
        let lock_path = self.lock_path(digest);
        if lock_path.exists() {
            if let Ok(file) = OpenOptions::new().read(true).write(true).open(&lock_path) {
                if file.try_lock_exclusive().is_err() {
                    return CacheEntryState::Fetching;
                }
                let _ = fs2::FileExt::unlock(&file);
            }
        }
        CacheEntryState::Absent
    }

    /// Fetch an artifact, downloading at most once across all processes.
    ///
    /// `download` must write the artifact archive (a gzip tarball) to the
    /// staging path it is given. The archive's sha256 is verified against
    /// `digest`, extracted to a staging directory, and atomically renamed
    /// into place. Returns the ready artifact directory.
    ///
    /// Blocks up to `deadline` waiting for another process's fetch of the
    /// same digest; a lock held past the deadline yields `LockTimeout`,
    /// which is retriable.
    pub fn fetch(
        &self,
        digest: &str,
        deadline: Duration,
        download: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<PathBuf> {
        validate_digest(digest)?;
        // sha256_of emits lowercase hex; normalize so manifests carrying
        // uppercase digests still verify and share the same entry
        let digest = &digest.to_ascii_lowercase();

        let artifact_dir = self.path_for(digest);
        // Ready entries are immutable, so a lock-free fast path is safe
        if artifact_dir.is_dir() {
            debug!("Cache hit for {}", digest);
            return Ok(artifact_dir);
        }

        let lock = self.acquire_lock(digest, deadline)?;

        // Another process may have completed the fetch while we waited
        if artifact_dir.is_dir() {
            debug!("Cache hit for {} after waiting on lock", digest);
            lock.release();
            return Ok(artifact_dir);
        }

        let result = self.fetch_under_lock(digest, &artifact_dir, download);
        lock.release();

        match &result {
            Ok(path) => info!("Cached artifact {} at {}", digest, path.display()),
            Err(e) => warn!("Fetch failed for {}: {}", digest, e),
        }
        result
    }

    /// Convenience fetch that downloads a resolved package's artifact URL
    pub fn fetch_resolved(
        &self,
        resolved: &ResolvedPackage,
        client: &HttpClient,
        deadline: Duration,
    ) -> Result<PathBuf> {
        self.fetch(&resolved.digest, deadline, |staging| {
            client.download_file(&resolved.url, staging)
        })
    }

    /// Remove a ready entry under its digest lock. Used by explicit cache
    /// maintenance only; upgrades deliberately leave prior artifacts in
    /// place for rollback.
    pub fn evict(&self, digest: &str, deadline: Duration) -> Result<()> {
        validate_digest(digest)?;
        let digest = &digest.to_ascii_lowercase();
        let lock = self.acquire_lock(digest, deadline)?;
        let artifact_dir = self.path_for(digest);
        let result = if artifact_dir.is_dir() {
            fs::remove_dir_all(&artifact_dir).map_err(Error::from)
        } else {
            Ok(())
        };
        lock.release();
        result
    }

    /// Download, verify, extract, and publish. Caller holds the digest lock.
    fn fetch_under_lock(
        &self,
        digest: &str,
        artifact_dir: &Path,
        download: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<PathBuf> {
        let staging_file = tempfile::Builder::new()
            .prefix(digest)
            .suffix(".partial")
            .tempfile_in(self.tmp_dir())?;

        // Partial download is removed when `staging_file` drops on error
        download(staging_file.path())?;

        let actual = sha256_of(staging_file.path())?;
        if actual != digest {
            return Err(Error::CorruptArtifact {
                digest: digest.to_string(),
                expected: digest.to_string(),
                actual,
            });
        }

        let staging_dir = tempfile::Builder::new()
            .prefix(digest)
            .suffix(".extract")
            .tempdir_in(self.tmp_dir())?;
        extract_tarball(staging_file.path(), staging_dir.path())?;

        // Publish atomically; the staging dir is consumed by the rename
        let staged = staging_dir.keep();
        if let Err(e) = fs::rename(&staged, artifact_dir) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }

        Ok(artifact_dir.to_path_buf())
    }

    /// Acquire the digest lock, polling until the deadline.
    ///
    /// Valid across process boundaries: the lock is an exclusive advisory
    /// lock on `locks/<digest>.lock`. Because the holder removes the lock
    /// file on release, a successful acquisition re-validates that the
    /// locked file is still the one on disk and retries otherwise.
    fn acquire_lock(&self, digest: &str, deadline: Duration) -> Result<DigestLock> {
        let path = self.lock_path(digest);
        let start = Instant::now();

        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;

            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if start.elapsed() >= deadline {
                            return Err(Error::LockTimeout {
                                digest: digest.to_string(),
                                waited_ms: start.elapsed().as_millis() as u64,
                            });
                        }
                        std::thread::sleep(LOCK_POLL_INTERVAL);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if same_file(&file, &path) {
                return Ok(DigestLock { file, path });
            }
            // The previous holder unlinked the file between our open and
            // lock; what we locked is an orphaned inode. Start over.
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Held digest lock; releasing unlocks and removes the lock file so that
/// it exists only during an in-flight fetch.
struct DigestLock {
    file: File,
    path: PathBuf,
}

impl DigestLock {
    fn release(self) {
        // Unlink before unlocking so no new waiter can lock a file that is
        // about to disappear out from under it.
        let _ = fs::remove_file(&self.path);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn validate_digest(digest: &str) -> Result<()> {
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(Error::InvalidReference {
            reference: digest.to_string(),
            reason: "digest must be 64 hex characters".to_string(),
        })
    }
}

/// Streamed sha256 of a file, hex-encoded
pub fn sha256_of(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a gzip tarball into the destination directory
fn extract_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Build a gzip tarball holding one file; returns (bytes, sha256 hex)
    fn make_tarball(name: &str, content: &[u8]) -> (Vec<u8>, String) {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = format!("{:x}", hasher.finalize());
        (bytes, digest)
    }

    fn write_download(bytes: Vec<u8>) -> impl FnOnce(&Path) -> Result<()> {
        move |staging: &Path| {
            fs::write(staging, &bytes)?;
            Ok(())
        }
    }

    #[test]
    fn test_fetch_extracts_and_returns_ready_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let (bytes, digest) = make_tarball("bin/tool", b"#!/bin/sh\n");

        let path = cache
            .fetch(&digest, Duration::from_secs(5), write_download(bytes))
            .unwrap();

        assert!(path.join("bin/tool").is_file());
        assert_eq!(cache.entry_state(&digest), CacheEntryState::Ready);
        // Lock file is gone once the fetch completes
        assert!(!cache.lock_path(&digest).exists());
    }

    #[test]
    fn test_second_fetch_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let (bytes, digest) = make_tarball("file", b"data");

        cache
            .fetch(&digest, Duration::from_secs(5), write_download(bytes))
            .unwrap();

        let called = AtomicUsize::new(0);
        cache
            .fetch(&digest, Duration::from_secs(5), |_| {
                called.fetch_add(1, Ordering::SeqCst);
                panic!("download must not run for a ready entry");
            })
            .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_fetches_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path()).unwrap());
        let (bytes, digest) = make_tarball("file", b"shared");
        let downloads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let downloads = Arc::clone(&downloads);
            let bytes = bytes.clone();
            let digest = digest.clone();
            handles.push(std::thread::spawn(move || {
                cache
                    .fetch(&digest, Duration::from_secs(30), move |staging| {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        // Hold the lock long enough for the others to queue
                        std::thread::sleep(Duration::from_millis(100));
                        fs::write(staging, &bytes)?;
                        Ok(())
                    })
                    .unwrap()
            }));
        }

        let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_failed_download_leaves_no_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let (bytes, digest) = make_tarball("file", b"eventually");

        let err = cache
            .fetch(&digest, Duration::from_secs(5), |staging| {
                fs::write(staging, b"half-written")?;
                Err(Error::Download("connection reset".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)));

        assert_eq!(cache.entry_state(&digest), CacheEntryState::Absent);
        assert!(!cache.lock_path(&digest).exists());
        let leftovers: Vec<_> = fs::read_dir(cache.tmp_dir()).unwrap().collect();
        assert!(leftovers.is_empty(), "staging area should be clean");

        // Retry performs a fresh download and succeeds
        let called = AtomicUsize::new(0);
        cache
            .fetch(&digest, Duration::from_secs(5), |staging| {
                called.fetch_add(1, Ordering::SeqCst);
                fs::write(staging, &bytes)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_digest_mismatch_is_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let (bytes, _) = make_tarball("file", b"actual-content");
        let claimed = "11".repeat(32);

        let err = cache
            .fetch(&claimed, Duration::from_secs(5), write_download(bytes))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptArtifact { .. }));
        assert_eq!(cache.entry_state(&claimed), CacheEntryState::Absent);
    }

    #[test]
    fn test_lock_timeout_while_another_fetch_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path()).unwrap());
        let (bytes, digest) = make_tarball("file", b"slow");

        let slow_cache = Arc::clone(&cache);
        let slow_digest = digest.clone();
        let slow = std::thread::spawn(move || {
            slow_cache
                .fetch(&slow_digest, Duration::from_secs(30), move |staging| {
                    std::thread::sleep(Duration::from_millis(600));
                    fs::write(staging, &bytes)?;
                    Ok(())
                })
                .unwrap();
        });

        // Give the slow fetch time to take the lock
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.entry_state(&digest), CacheEntryState::Fetching);

        let err = cache
            .fetch(&digest, Duration::from_millis(100), |_| {
                panic!("should not download while lock is held")
            })
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        slow.join().unwrap();
        assert_eq!(cache.entry_state(&digest), CacheEntryState::Ready);
    }

    #[test]
    fn test_evict_removes_ready_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let (bytes, digest) = make_tarball("file", b"victim");

        cache
            .fetch(&digest, Duration::from_secs(5), write_download(bytes))
            .unwrap();
        assert!(cache.contains(&digest));

        cache.evict(&digest, Duration::from_secs(5)).unwrap();
        assert_eq!(cache.entry_state(&digest), CacheEntryState::Absent);
    }

    #[test]
    fn test_uppercase_digest_shares_lowercase_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let (bytes, digest) = make_tarball("file", b"cased");
        let upper = digest.to_ascii_uppercase();

        let path = cache
            .fetch(&upper, Duration::from_secs(5), write_download(bytes))
            .unwrap();

        // Verification succeeded and both spellings hit the same entry
        assert_eq!(path, cache.path_for(&digest));
        assert!(cache.contains(&upper));
        assert!(cache.contains(&digest));
        assert_eq!(cache.entry_state(&upper), CacheEntryState::Ready);
    }

    #[test]
    fn test_rejects_malformed_digest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let err = cache
            .fetch("not-a-digest", Duration::from_secs(1), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
    }
}
