//! Write-once local cache of fetched documents.
//!
//! Each successful fetch leaves a pair of files in the cache directory:
//!
//! ```text
//! <cache_dir>/<url_hash16>-<timestamp>.raw   response body as received
//! <cache_dir>/<url_hash16>-<timestamp>.txt   normalized text
//! ```
//!
//! Both files are written to uniquely named temporary files first and then
//! linked into place, so a reader never sees a half-written entry. Two
//! fetches of one URL in the same millisecond get `<key>` and `<key>-1`.
//! The cache is an audit trail; nothing in distill reads it back in place
//! of a live fetch.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Paths of one written cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub raw_path: PathBuf,
    pub text_path: PathBuf,
}

/// Entries sharing a base key before `store` gives up.
const MAX_KEY_SUFFIX: usize = 1000;

#[derive(Debug, Clone)]
pub struct DocumentCache {
    dir: PathBuf,
}

impl DocumentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one fetch. Either both files land or neither does.
    pub async fn store(
        &self,
        url: &str,
        fetched_at: DateTime<Utc>,
        raw: &[u8],
        text: &str,
    ) -> io::Result<CacheEntry> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let base = cache_key(url, fetched_at);
        let nonce: u64 = rand::random();
        let raw_tmp = self.dir.join(format!(".{}.{:016x}.raw.tmp", base, nonce));
        let text_tmp = self.dir.join(format!(".{}.{:016x}.txt.tmp", base, nonce));

        let published = async {
            tokio::fs::write(&raw_tmp, raw).await?;
            tokio::fs::write(&text_tmp, text.as_bytes()).await?;
            self.publish(&base, &raw_tmp, &text_tmp).await
        }
        .await;

        let _ = tokio::fs::remove_file(&raw_tmp).await;
        let _ = tokio::fs::remove_file(&text_tmp).await;
        published
    }

    /// Link the staged pair under the first free key: `base`, then
    /// `base-1`, `base-2` and so on. A hard link never replaces an existing
    /// file, so writers that share a base key each keep their own entry.
    async fn publish(
        &self,
        base: &str,
        raw_tmp: &Path,
        text_tmp: &Path,
    ) -> io::Result<CacheEntry> {
        for n in 0..MAX_KEY_SUFFIX {
            let key = if n == 0 {
                base.to_string()
            } else {
                format!("{}-{}", base, n)
            };
            let raw_path = self.dir.join(format!("{}.raw", key));
            let text_path = self.dir.join(format!("{}.txt", key));

            match tokio::fs::hard_link(raw_tmp, &raw_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
            match tokio::fs::hard_link(text_tmp, &text_path).await {
                Ok(()) => {
                    return Ok(CacheEntry {
                        key,
                        raw_path,
                        text_path,
                    })
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&raw_path).await;
                    if e.kind() != io::ErrorKind::AlreadyExists {
                        return Err(e);
                    }
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free cache key for {}", base),
        ))
    }
}

/// `<first 16 hex chars of sha256(url)>-<UTC timestamp with millis>`.
pub fn cache_key(url: &str, fetched_at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hash = hex::encode(digest);
    format!(
        "{}-{}",
        &hash[..16],
        fetched_at.format("%Y%m%dT%H%M%S%3fZ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let key = cache_key("https://example.com/job/1", at);
        let (hash, ts) = key.split_once('-').unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ts, "20240301T123005000Z");
    }

    #[test]
    fn same_url_same_prefix() {
        let at = Utc::now();
        let a = cache_key("https://a.example", at);
        let b = cache_key("https://a.example", at);
        let c = cache_key("https://b.example", at);
        assert_eq!(a, b);
        assert_ne!(a[..16], c[..16]);
    }

    #[tokio::test]
    async fn store_writes_both_files_and_no_temps() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DocumentCache::new(dir.path().join("cache"));
        let entry = cache
            .store("https://example.com", Utc::now(), b"<p>hi</p>", "hi")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&entry.raw_path).unwrap(), b"<p>hi</p>");
        assert_eq!(std::fs::read_to_string(&entry.text_path).unwrap(), "hi");

        let names: Vec<String> = std::fs::read_dir(cache.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn same_key_twice_gets_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DocumentCache::new(dir.path());
        let at = Utc::now();
        let first = cache.store("https://example.com", at, b"a", "a").await.unwrap();
        let second = cache.store("https://example.com", at, b"b", "b").await.unwrap();

        assert_eq!(second.key, format!("{}-1", first.key));
        assert_eq!(std::fs::read_to_string(&first.text_path).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(&second.text_path).unwrap(), "b");
    }

    #[tokio::test]
    async fn concurrent_writers_keep_separate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DocumentCache::new(dir.path());
        let at = Utc::now();
        let (a, b) = tokio::join!(
            cache.store("https://example.com", at, b"first", "first"),
            cache.store("https://example.com", at, b"second", "second"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.key, b.key);
        for entry in [&a, &b] {
            let raw = std::fs::read_to_string(&entry.raw_path).unwrap();
            let text = std::fs::read_to_string(&entry.text_path).unwrap();
            assert_eq!(raw, text);
        }
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 4);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }
}
