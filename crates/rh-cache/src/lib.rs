#![forbid(unsafe_code)]

//! Checksum-verified local store for remote test datasets.
//!
//! A dataset is addressed by its remote identifier (a relative path on the
//! data host) and accepted only when its SHA-256 digest matches the checksum
//! the case declares. Downloads land in a temporary file beside the final
//! location and are renamed into place after verification, so a reader never
//! observes a partial file.

pub mod fetch;

pub use fetch::{DEFAULT_ATTEMPT_TIMEOUT, FetchAttemptError, Fetcher, HttpFetcher};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum FetchError {
    InvalidIdentifier {
        remote_id: String,
        detail: &'static str,
    },
    /// Something other than a regular file occupies the cache location.
    NotAFile { path: PathBuf },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// An attempt failed in a way retrying cannot fix.
    Rejected {
        url: String,
        error: FetchAttemptError,
    },
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier { remote_id, detail } => {
                write!(f, "invalid remote identifier '{remote_id}': {detail}")
            }
            Self::NotAFile { path } => {
                write!(f, "cache location {} is not a regular file", path.display())
            }
            Self::Io { path, source } => write!(f, "io error at {}: {source}", path.display()),
            Self::Rejected { url, error } => write!(f, "fetching {url} failed: {error}"),
            Self::Exhausted {
                url,
                attempts,
                last_error,
            } => write!(
                f,
                "fetching {url} failed after {attempts} attempts: {last_error}"
            ),
            Self::ChecksumMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {}: expected {expected}, got {actual}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Hex SHA-256 of a file, streamed in fixed-size chunks.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; DIGEST_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(bytes_to_hex(&hasher.finalize()))
}

/// Hex SHA-256 of an in-memory payload.
#[must_use]
pub fn bytes_digest(bytes: &[u8]) -> String {
    bytes_to_hex(&Sha256::digest(bytes))
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", byte));
    }
    out
}

/// Whether the file at `path` exists and hashes to `checksum`.
pub fn is_valid(path: &Path, checksum: &str) -> std::io::Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    Ok(file_digest(path)?.eq_ignore_ascii_case(checksum.trim()))
}

/// Join the data host and a remote identifier with exactly one separator.
#[must_use]
pub fn join_url(host: &str, remote_id: &str) -> String {
    format!(
        "{}/{}",
        host.trim_end_matches('/'),
        remote_id.trim_start_matches('/')
    )
}

/// Map a remote identifier to a path below `root`. Only plain relative
/// identifiers are accepted.
pub fn entry_path(root: &Path, remote_id: &str) -> Result<PathBuf, FetchError> {
    let invalid = |detail| FetchError::InvalidIdentifier {
        remote_id: remote_id.to_owned(),
        detail,
    };
    if remote_id.trim().is_empty() {
        return Err(invalid("empty identifier"));
    }
    let relative = Path::new(remote_id);
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory reference")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("absolute path"));
            }
        }
    }
    if path == root {
        return Err(invalid("identifier names no file"));
    }
    Ok(path)
}

/// A cache rooted at one directory. Cheap to share across worker threads;
/// concurrent resolutions of the same identifier are serialized so the file
/// is fetched at most once.
pub struct DataCache {
    root: PathBuf,
    host: String,
    fetcher: Arc<dyn Fetcher>,
    max_attempts: u32,
    locks: Mutex<BTreeMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("root", &self.root)
            .field("host", &self.host)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl DataCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, host: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            fetcher,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Same host, fetcher and retry budget, different root. Used for
    /// per-case scratch storage when the shared cache is disabled.
    #[must_use]
    pub fn scoped(&self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            host: self.host.clone(),
            fetcher: Arc::clone(&self.fetcher),
            max_attempts: self.max_attempts,
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn url_for(&self, remote_id: &str) -> String {
        join_url(&self.host, remote_id)
    }

    /// Return a local path holding a verified copy of `remote_id`, fetching
    /// it if the cached copy is absent or stale.
    pub fn resolve(&self, remote_id: &str, checksum: &str) -> Result<PathBuf, FetchError> {
        let destination = entry_path(&self.root, remote_id)?;
        let lock = self.key_lock(&destination);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if destination.exists() {
            if !destination.is_file() {
                return Err(FetchError::NotAFile { path: destination });
            }
            if is_valid(&destination, checksum).map_err(io_error(&destination))? {
                tracing::debug!(remote_id, path = %destination.display(), "cache hit");
                return Ok(destination);
            }
            tracing::warn!(
                remote_id,
                path = %destination.display(),
                "cached copy failed checksum verification; fetching again"
            );
            std::fs::remove_file(&destination).map_err(io_error(&destination))?;
        }

        let parent = destination.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        let staged = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempfile_in(parent)
            .map_err(io_error(parent))?;

        let url = self.url_for(remote_id);
        let bytes = self.fetch_with_retry(&url, staged.path())?;

        let actual = file_digest(staged.path()).map_err(io_error(staged.path()))?;
        if !actual.eq_ignore_ascii_case(checksum.trim()) {
            return Err(FetchError::ChecksumMismatch {
                path: destination,
                expected: checksum.to_owned(),
                actual,
            });
        }

        staged
            .persist(&destination)
            .map_err(|err| FetchError::Io {
                path: destination.clone(),
                source: err.error,
            })?;
        tracing::info!(remote_id, bytes, path = %destination.display(), "fetched dataset");
        Ok(destination)
    }

    fn fetch_with_retry(&self, url: &str, staged: &Path) -> Result<u64, FetchError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.fetcher.fetch(url, staged) {
                Ok(bytes) => return Ok(bytes),
                Err(error) if error.is_retryable() => {
                    tracing::warn!(url, attempt, max = self.max_attempts, %error, "fetch attempt failed");
                    last_error = error.to_string();
                }
                Err(error) => {
                    return Err(FetchError::Rejected {
                        url: url.to_owned(),
                        error,
                    });
                }
            }
        }
        Err(FetchError::Exhausted {
            url: url.to_owned(),
            attempts: self.max_attempts,
            last_error,
        })
    }

    fn key_lock(&self, destination: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(destination.to_path_buf()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_MAX_ATTEMPTS, DataCache, FetchAttemptError, FetchError, Fetcher, bytes_digest,
        entry_path, file_digest, join_url,
    };
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const HOST: &str = "http://data.example/testdata/";

    #[derive(Clone, Copy)]
    enum Failure {
        Transport,
        NotFound,
        DiskFull,
    }

    struct ScriptedFetcher {
        payload: Vec<u8>,
        failures: usize,
        failure: Failure,
        delay: Duration,
        calls: AtomicUsize,
        urls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn serving(payload: &[u8]) -> Self {
            Self {
                payload: payload.to_vec(),
                failures: 0,
                failure: Failure::Transport,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                urls: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn failing_first(mut self, failures: usize, failure: Failure) -> Self {
            self.failures = failures;
            self.failure = failure;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for ScriptedFetcher {
        fn fetch(&self, url: &str, destination: &Path) -> Result<u64, FetchAttemptError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().expect("urls").push(url.to_owned());
            std::thread::sleep(self.delay);
            if call < self.failures {
                std::fs::write(destination, b"partial").map_err(FetchAttemptError::Io)?;
                return Err(match self.failure {
                    Failure::Transport => FetchAttemptError::Transport("connection reset".to_owned()),
                    Failure::NotFound => FetchAttemptError::Status(404),
                    Failure::DiskFull => FetchAttemptError::Io(std::io::Error::other("disk full")),
                });
            }
            std::fs::write(destination, &self.payload).map_err(FetchAttemptError::Io)?;
            Ok(self.payload.len() as u64)
        }
    }

    fn cache_with(dir: &Path, fetcher: &Arc<ScriptedFetcher>) -> DataCache {
        DataCache::new(dir, HOST, Arc::clone(fetcher) as Arc<dyn Fetcher>)
    }

    fn leftover_temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with(".fetch-"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn valid_cached_copy_needs_no_fetch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grappa/meas.h5");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"dataset").expect("write");
        let fetcher = Arc::new(ScriptedFetcher::serving(b"other"));
        let cache = cache_with(dir.path(), &fetcher);

        let resolved = cache
            .resolve("grappa/meas.h5", &bytes_digest(b"dataset"))
            .expect("hit");
        assert_eq!(resolved, path);
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn missing_file_is_fetched_and_verified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(ScriptedFetcher::serving(b"payload"));
        let cache = cache_with(dir.path(), &fetcher);

        let resolved = cache
            .resolve("a/b.h5", &bytes_digest(b"payload").to_uppercase())
            .expect("fetch");
        assert_eq!(std::fs::read(&resolved).expect("read"), b"payload");
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(
            fetcher.urls.lock().expect("urls").as_slice(),
            ["http://data.example/testdata/a/b.h5"]
        );
        assert_eq!(leftover_temp_files(&dir.path().join("a")), 0);
    }

    #[test]
    fn stale_copy_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("x.h5"), b"stale").expect("write");
        let fetcher = Arc::new(ScriptedFetcher::serving(b"fresh"));
        let cache = cache_with(dir.path(), &fetcher);

        let resolved = cache.resolve("x.h5", &bytes_digest(b"fresh")).expect("refetch");
        assert_eq!(std::fs::read(resolved).expect("read"), b"fresh");
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn transient_failures_are_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher =
            Arc::new(ScriptedFetcher::serving(b"payload").failing_first(2, Failure::Transport));
        let cache = cache_with(dir.path(), &fetcher);

        cache.resolve("x.h5", &bytes_digest(b"payload")).expect("third attempt succeeds");
        assert_eq!(fetcher.calls(), 3);
    }

    #[test]
    fn persistent_transport_failure_exhausts_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher =
            Arc::new(ScriptedFetcher::serving(b"payload").failing_first(usize::MAX, Failure::Transport));
        let cache = cache_with(dir.path(), &fetcher);

        let err = cache
            .resolve("x.h5", &bytes_digest(b"payload"))
            .expect_err("exhausted");
        assert!(matches!(
            err,
            FetchError::Exhausted { attempts, .. } if attempts == DEFAULT_MAX_ATTEMPTS
        ));
        assert_eq!(fetcher.calls(), DEFAULT_MAX_ATTEMPTS as usize);
        assert!(!dir.path().join("x.h5").exists());
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }

    #[test]
    fn persistent_not_found_exhausts_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher =
            Arc::new(ScriptedFetcher::serving(b"payload").failing_first(usize::MAX, Failure::NotFound));
        let cache = cache_with(dir.path(), &fetcher);

        let err = cache.resolve("x.h5", "00").expect_err("exhausted");
        assert!(matches!(
            &err,
            FetchError::Exhausted { attempts, last_error, .. }
                if *attempts == DEFAULT_MAX_ATTEMPTS && last_error.contains("404")
        ));
        assert_eq!(fetcher.calls(), DEFAULT_MAX_ATTEMPTS as usize);
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }

    #[test]
    fn local_write_failure_is_not_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher =
            Arc::new(ScriptedFetcher::serving(b"payload").failing_first(usize::MAX, Failure::DiskFull));
        let cache = cache_with(dir.path(), &fetcher);

        let err = cache.resolve("x.h5", "00").expect_err("rejected");
        assert!(matches!(err, FetchError::Rejected { .. }));
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn checksum_mismatch_after_fetch_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(ScriptedFetcher::serving(b"corrupted"));
        let cache = cache_with(dir.path(), &fetcher);

        let err = cache
            .resolve("x.h5", &bytes_digest(b"expected"))
            .expect_err("mismatch");
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
        assert_eq!(fetcher.calls(), 1);
        assert!(!dir.path().join("x.h5").exists());
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }

    #[test]
    fn concurrent_resolutions_fetch_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fetcher = ScriptedFetcher::serving(b"shared");
        fetcher.delay = Duration::from_millis(50);
        let fetcher = Arc::new(fetcher);
        let cache = Arc::new(cache_with(dir.path(), &fetcher));
        let checksum = bytes_digest(b"shared");

        let handles = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let checksum = checksum.clone();
                std::thread::spawn(move || cache.resolve("same.h5", &checksum))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("thread").expect("resolve");
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn directory_in_the_way_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("x.h5")).expect("mkdir");
        let fetcher = Arc::new(ScriptedFetcher::serving(b""));
        let cache = cache_with(dir.path(), &fetcher);
        assert!(matches!(
            cache.resolve("x.h5", "00"),
            Err(FetchError::NotAFile { .. })
        ));
    }

    #[test]
    fn scoped_cache_shares_fetcher() {
        let shared = tempfile::tempdir().expect("tempdir");
        let scratch = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(ScriptedFetcher::serving(b"payload"));
        let cache = cache_with(shared.path(), &fetcher).scoped(scratch.path());

        let resolved = cache.resolve("x.h5", &bytes_digest(b"payload")).expect("fetch");
        assert!(resolved.starts_with(scratch.path()));
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn identifiers_escaping_the_root_are_rejected() {
        let root = Path::new("/cache");
        for bad in ["", "  ", "../x.h5", "a/../../x.h5", "/etc/passwd", "."] {
            assert!(
                matches!(entry_path(root, bad), Err(FetchError::InvalidIdentifier { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(
            entry_path(root, "./a/b.h5").expect("valid"),
            Path::new("/cache/a/b.h5")
        );
    }

    #[test]
    fn url_join_uses_one_separator() {
        assert_eq!(join_url("http://h/data/", "x.h5"), "http://h/data/x.h5");
        assert_eq!(join_url("http://h/data", "x.h5"), "http://h/data/x.h5");
        assert_eq!(join_url("http://h/data//", "/x.h5"), "http://h/data/x.h5");
    }

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.bin");
        let payload = (0..200_000_u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        std::fs::write(&path, &payload).expect("write");
        assert_eq!(file_digest(&path).expect("digest"), bytes_digest(&payload));
        assert_eq!(
            bytes_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    proptest! {
        #[test]
        fn accepted_identifiers_stay_under_root(parts in prop::collection::vec("[a-z0-9_.]{1,8}", 1..4)) {
            let remote_id = parts.join("/");
            let root = Path::new("/cache");
            if let Ok(path) = entry_path(root, &remote_id) {
                prop_assert!(path.starts_with(root));
                prop_assert!(path != root);
            }
        }
    }
}
