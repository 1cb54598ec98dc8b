//! Resource fetching with checksum verification and a content-addressed
//! download cache.
//!
//! Every byte stream the engine consumes (source archives, bottles, test
//! fixtures) passes through [`ResourceFetcher::fetch`], which retrieves the
//! content, verifies its sha256 digest against the formula's declared
//! value, and stores the verified bytes in a content-addressed cache file
//! named by the digest. Unverified content never reaches a later stage.
//!
//! Failure policy:
//! - transient network failures retry with bounded exponential backoff,
//!   then fail with [`MaltError::NetworkError`];
//! - a checksum mismatch is a fatal [`MaltError::ChecksumMismatch`] and is
//!   never retried, protecting against executing tampered content;
//! - repeat fetches of content already in the cache touch neither the
//!   network nor the original URL, but every hit is re-hashed against the
//!   digest it is named by; an entry whose bytes no longer match is
//!   evicted and fetched again.
//!
//! `file://` URLs and bare filesystem paths resolve to local reads, so the
//! engine (and its tests) can run fully offline.

use anyhow::{Context, Result};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, warn};

use crate::core::MaltError;
use crate::formula::Resource;

/// A verified blob in the download cache.
#[derive(Debug, Clone)]
pub struct FetchedBlob {
    /// Location of the verified content in the cache
    pub path: PathBuf,
    /// Lowercase sha256 hex digest of the content
    pub sha256: String,
}

/// Intermediate fetch error carrying retryability.
#[derive(Debug)]
struct RetrieveError {
    reason: String,
    retryable: bool,
}

/// Fetches resources by URL, verifies integrity, and caches verified
/// content by digest.
///
/// Safe to share across concurrent fetches: the hit index is a [`DashMap`]
/// and cache writes go through a temp-file rename keyed by digest, so two
/// writers of the same content never produce a torn file.
pub struct ResourceFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
    hits: DashMap<String, PathBuf>,
    max_attempts: usize,
}

impl ResourceFetcher {
    /// Create a fetcher writing verified blobs under `cache_dir`.
    ///
    /// `max_attempts` bounds how often a transient network failure is
    /// retried before becoming fatal.
    pub fn new(cache_dir: impl Into<PathBuf>, max_attempts: usize) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).with_context(|| {
            format!("Failed to create download cache directory: {}", cache_dir.display())
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            cache_dir,
            hits: DashMap::new(),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Fetch a resource and return a handle to its verified bytes.
    pub async fn fetch(&self, resource: &Resource) -> Result<FetchedBlob> {
        let expected = normalize_digest(&resource.sha256);

        if let Some(path) = self.cached(&expected) {
            debug!(name = %resource.name, sha256 = %expected, "Download cache hit");
            return Ok(FetchedBlob {
                path,
                sha256: expected,
            });
        }

        let bytes = self.retrieve(&resource.url).await?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());

        if actual != expected {
            return Err(MaltError::ChecksumMismatch {
                name: display_name(resource),
                expected: format!("sha256:{expected}"),
                actual: format!("sha256:{actual}"),
            }
            .into());
        }

        let path = self.store(&expected, &bytes).await?;
        self.hits.insert(expected.clone(), path.clone());
        debug!(name = %resource.name, sha256 = %expected, bytes = bytes.len(), "Fetched and verified");

        Ok(FetchedBlob {
            path,
            sha256: expected,
        })
    }

    /// Look up a cache entry and re-verify its bytes against the digest it
    /// is named by. Content that changed on disk after the original fetch
    /// is evicted and treated as a miss.
    fn cached(&self, digest: &str) -> Option<PathBuf> {
        let path = match self.hits.get(digest) {
            Some(hit) => hit.clone(),
            None => self.cache_dir.join(digest),
        };
        if !path.exists() {
            self.hits.remove(digest);
            return None;
        }
        match file_digest(&path) {
            Ok(actual) if actual == digest => {
                self.hits.insert(digest.to_string(), path.clone());
                Some(path)
            }
            _ => {
                warn!(sha256 = %digest, path = %path.display(), "Cache entry no longer matches its digest, discarding");
                let _ = std::fs::remove_file(&path);
                self.hits.remove(digest);
                None
            }
        }
    }

    async fn store(&self, digest: &str, bytes: &[u8]) -> Result<PathBuf> {
        let final_path = self.cache_dir.join(digest);
        let tmp_path = self.cache_dir.join(format!("{digest}.incoming.{}", std::process::id()));
        tokio::fs::write(&tmp_path, bytes)
            .await
            .with_context(|| format!("Failed to write download cache entry: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to commit download cache entry: {}", final_path.display()))?;
        Ok(final_path)
    }

    /// Retrieve raw bytes from a URL, with bounded retries for transient
    /// network failures. Checksum verification happens in the caller, after
    /// and outside the retry loop.
    async fn retrieve(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = local_path(url) {
            return tokio::fs::read(&path)
                .await
                .map_err(|e| {
                    MaltError::NetworkError {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                });
        }

        let strategy = ExponentialBackoff::from_millis(200)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .take(self.max_attempts - 1);

        let result = RetryIf::spawn(
            strategy,
            || self.retrieve_http(url),
            |e: &RetrieveError| {
                if e.retryable {
                    warn!(url, reason = %e.reason, "Transient fetch failure, retrying");
                }
                e.retryable
            },
        )
        .await;

        result.map_err(|e| {
            MaltError::NetworkError {
                url: url.to_string(),
                reason: e.reason,
            }
            .into()
        })
    }

    async fn retrieve_http(&self, url: &str) -> std::result::Result<Vec<u8>, RetrieveError> {
        let response = self.client.get(url).send().await.map_err(|e| RetrieveError {
            reason: e.to_string(),
            retryable: true,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrieveError {
                reason: format!("HTTP {status}"),
                // Server-side errors are worth retrying; client errors are
                // permanent (a 404 will not fix itself).
                retryable: status.is_server_error(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| RetrieveError {
            reason: e.to_string(),
            retryable: true,
        })?;
        Ok(bytes.to_vec())
    }
}

/// Resolve `file://` URLs and bare paths to a local filesystem path.
fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(stripped) = url.strip_prefix("file://") {
        return Some(PathBuf::from(stripped));
    }
    if !url.contains("://") {
        return Some(PathBuf::from(url));
    }
    None
}

fn normalize_digest(declared: &str) -> String {
    declared.strip_prefix("sha256:").unwrap_or(declared).to_ascii_lowercase()
}

fn display_name(resource: &Resource) -> String {
    if resource.name.is_empty() {
        resource.url.clone()
    } else {
        resource.name.clone()
    }
}

/// Compute the lowercase sha256 hex digest of a file on disk.
pub fn file_digest(path: &Path) -> Result<String> {
    let content = std::fs::read(path)
        .with_context(|| format!("Cannot read file for checksum calculation: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, String) {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(content);
        (path, hex::encode(hasher.finalize()))
    }

    fn resource(url: &str, sha256: &str) -> Resource {
        Resource {
            name: "fixture".to_string(),
            url: url.to_string(),
            sha256: sha256.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_local_file_verifies_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let (path, digest) = write_fixture(dir.path(), "blob.bin", b"hello bottles");

        let fetcher = ResourceFetcher::new(cache.path(), 3).unwrap();
        let blob = fetcher.fetch(&resource(&path.display().to_string(), &digest)).await.unwrap();

        assert_eq!(blob.sha256, digest);
        assert_eq!(std::fs::read(&blob.path).unwrap(), b"hello bottles");
        assert!(blob.path.starts_with(cache.path()));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_fatal() {
        // Scenario B: resource with an incorrect checksum fails with
        // ChecksumMismatch and the content is never cached.
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let (path, _) = write_fixture(dir.path(), "blob.bin", b"real content");
        let wrong = "0".repeat(64);

        let fetcher = ResourceFetcher::new(cache.path(), 3).unwrap();
        let err = fetcher.fetch(&resource(&path.display().to_string(), &wrong)).await.unwrap_err();

        match err.downcast_ref::<MaltError>() {
            Some(MaltError::ChecksumMismatch { expected, actual, .. }) => {
                assert!(expected.starts_with("sha256:0000"));
                assert!(actual.starts_with("sha256:"));
            }
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }

        // Nothing committed to the cache directory.
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_repeat_fetch_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let (path, digest) = write_fixture(dir.path(), "blob.bin", b"cache me");

        let fetcher = ResourceFetcher::new(cache.path(), 3).unwrap();
        let url = path.display().to_string();
        fetcher.fetch(&resource(&url, &digest)).await.unwrap();

        // Remove the origin; the second fetch must succeed from the cache.
        std::fs::remove_file(&path).unwrap();
        let blob = fetcher.fetch(&resource(&url, &digest)).await.unwrap();
        assert_eq!(std::fs::read(&blob.path).unwrap(), b"cache me");
    }

    #[tokio::test]
    async fn test_cache_survives_new_fetcher_instance() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let (path, digest) = write_fixture(dir.path(), "blob.bin", b"persistent");
        let url = path.display().to_string();

        let first = ResourceFetcher::new(cache.path(), 3).unwrap();
        first.fetch(&resource(&url, &digest)).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        // A fresh fetcher over the same cache dir finds the entry on disk.
        let second = ResourceFetcher::new(cache.path(), 3).unwrap();
        let blob = second.fetch(&resource(&url, &digest)).await.unwrap();
        assert_eq!(blob.sha256, digest);
    }

    #[tokio::test]
    async fn test_tampered_cache_entry_refetched_from_origin() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let (path, digest) = write_fixture(dir.path(), "blob.bin", b"genuine bytes");
        let url = path.display().to_string();

        let first = ResourceFetcher::new(cache.path(), 3).unwrap();
        let blob = first.fetch(&resource(&url, &digest)).await.unwrap();
        std::fs::write(&blob.path, b"tampered payload").unwrap();

        // A fresh fetcher must notice the bytes no longer match the digest
        // and go back to the origin instead of serving the entry.
        let second = ResourceFetcher::new(cache.path(), 3).unwrap();
        let refetched = second.fetch(&resource(&url, &digest)).await.unwrap();
        assert_eq!(std::fs::read(&refetched.path).unwrap(), b"genuine bytes");
    }

    #[tokio::test]
    async fn test_tampered_cache_entry_never_served_by_same_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let (path, digest) = write_fixture(dir.path(), "blob.bin", b"genuine bytes");
        let url = path.display().to_string();

        let fetcher = ResourceFetcher::new(cache.path(), 3).unwrap();
        let blob = fetcher.fetch(&resource(&url, &digest)).await.unwrap();
        std::fs::write(&blob.path, b"tampered payload").unwrap();
        std::fs::remove_file(&path).unwrap();

        // With the origin gone the tampered entry cannot be replaced; the
        // fetch fails rather than handing out unverified content.
        let err = fetcher.fetch(&resource(&url, &digest)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MaltError>(),
            Some(MaltError::NetworkError { .. })
        ));
        assert!(!blob.path.exists());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_network_error() {
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ResourceFetcher::new(cache.path(), 3).unwrap();
        let err = fetcher
            .fetch(&resource("file:///nonexistent/blob.bin", &"0".repeat(64)))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MaltError>(),
            Some(MaltError::NetworkError { .. })
        ));
    }

    #[test]
    fn test_digest_normalization() {
        assert_eq!(normalize_digest("sha256:ABCD"), "abcd");
        assert_eq!(normalize_digest("abcd"), "abcd");
    }

    #[test]
    fn test_local_path_detection() {
        assert_eq!(local_path("file:///tmp/x"), Some(PathBuf::from("/tmp/x")));
        assert_eq!(local_path("/tmp/x"), Some(PathBuf::from("/tmp/x")));
        assert_eq!(local_path("https://example.com/x"), None);
    }
}
