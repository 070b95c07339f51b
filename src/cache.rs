//! On-disk result cache.
//!
//! One JSON file per entry, named by the SHA-256 of the normalized query and
//! source name, so raw queries never appear in the key space. Writes go through
//! a temp file and an atomic rename. An in-memory index tracks entry sizes and
//! recency for LRU eviction once the storage budget is exceeded.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::apis::NormalizedPaper;
use crate::sanitize::truncate_for_log;
use crate::topic::Topic;

/// Default storage budget: 100 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache directory {path} is unusable: {source}")]
    Open { path: PathBuf, source: io::Error },
}

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Stored value for one (query, source) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query: String,
    pub source: String,
    pub topic: String,
    pub stored_at: DateTime<Utc>,
    pub ttl_hours: u64,
    pub results: Vec<NormalizedPaper>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::hours(self.ttl_hours as i64);
        now.signed_duration_since(self.stored_at) >= ttl
    }
}

/// `sha256(lowercase(trim(query)) + ":" + source)` as lowercase hex.
pub fn cache_key(query: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub directory: PathBuf,
    pub entries: usize,
    pub bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug)]
struct IndexEntry {
    bytes: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
    total_bytes: u64,
    tick: u64,
}

impl CacheIndex {
    fn touch(&mut self, key: &str, bytes: u64) {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.total_bytes = self.total_bytes - entry.bytes + bytes;
                entry.bytes = bytes;
                entry.last_used = tick;
            }
            None => {
                self.total_bytes += bytes;
                self.entries.insert(
                    key.to_string(),
                    IndexEntry {
                        bytes,
                        last_used: tick,
                    },
                );
            }
        }
    }

    fn forget(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes -= entry.bytes;
        }
    }

    /// Least recently used key other than `keep`.
    fn coldest_except(&self, keep: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
    }
}

#[derive(Debug)]
pub struct ResultCache {
    dir: PathBuf,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
    index: Mutex<CacheIndex>,
}

impl ResultCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Open {
            path: dir.clone(),
            source,
        })?;

        let listing = fs::read_dir(&dir).map_err(|source| CacheError::Open {
            path: dir.clone(),
            source,
        })?;

        let mut found = Vec::new();
        for item in listing.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let Ok(meta) = item.metadata() else { continue };
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            found.push((modified, key, meta.len()));
        }

        // Oldest files get the lowest ticks.
        found.sort();
        let mut index = CacheIndex::default();
        for (_, key, bytes) in found {
            index.touch(&key, bytes);
        }

        tracing::info!(
            "Opened result cache at {} ({} entries, {} bytes)",
            dir.display(),
            index.entries.len(),
            index.total_bytes
        );

        Ok(Self {
            dir,
            max_bytes,
            clock,
            index: Mutex::new(index),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ENTRY_EXTENSION))
    }

    fn remove(&self, key: &str) {
        let mut index = self.index();
        if let Err(e) = fs::remove_file(self.path_for(key)) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!("Failed to delete cache entry {}: {}", key, e);
            }
        }
        index.forget(key);
    }

    fn read_entry(&self, key: &str) -> Option<(CacheEntry, u64)> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.index().forget(key);
                return None;
            }
            Err(e) => {
                tracing::error!("Cache read failed for {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some((entry, bytes.len() as u64)),
            Err(e) => {
                tracing::warn!("Corrupt cache entry {} removed: {}", key, e);
                self.remove(key);
                None
            }
        }
    }

    /// Cached results for `(query, source)`, or `None` on miss, expiry or corruption.
    pub fn get(&self, query: &str, source: &str) -> Option<Vec<NormalizedPaper>> {
        let key = cache_key(query, source);
        let Some((entry, bytes)) = self.read_entry(&key) else {
            tracing::debug!("Cache miss for {}: {}", source, truncate_for_log(query));
            return None;
        };

        if entry.is_expired(self.clock.now()) {
            tracing::info!("Cache expired for {}: {}", source, truncate_for_log(query));
            self.remove(&key);
            return None;
        }

        self.index().touch(&key, bytes);
        tracing::info!(
            "Cache hit for {}: {} (topic: {}, {} results)",
            source,
            truncate_for_log(query),
            entry.topic,
            entry.results.len()
        );
        Some(entry.results)
    }

    /// Store results, replacing any previous entry for the same key.
    pub fn put(
        &self,
        query: &str,
        source: &str,
        results: &[NormalizedPaper],
        topic: &Topic,
    ) -> Result<(), CacheError> {
        let key = cache_key(query, source);
        let entry = CacheEntry {
            query: query.to_string(),
            source: source.to_string(),
            topic: topic.name.clone(),
            stored_at: self.clock.now(),
            ttl_hours: topic.ttl_hours,
            results: results.to_vec(),
        };
        let body = serde_json::to_vec(&entry)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&key)).map_err(|e| e.error)?;

        self.index().touch(&key, body.len() as u64);
        tracing::info!(
            "Cached {} results for {}: {} (topic: {}, TTL: {}h)",
            results.len(),
            source,
            truncate_for_log(query),
            topic.name,
            topic.ttl_hours
        );

        self.evict_over_budget(&key);
        Ok(())
    }

    fn evict_over_budget(&self, keep: &str) {
        loop {
            let victim = {
                let index = self.index();
                if index.total_bytes <= self.max_bytes {
                    return;
                }
                match index.coldest_except(keep) {
                    Some(key) => key,
                    None => return,
                }
            };
            tracing::debug!("Evicting least recently used cache entry {}", victim);
            self.remove(&victim);
        }
    }

    /// Delete every expired or unreadable entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let keys: Vec<String> = self.index().entries.keys().cloned().collect();
        let before = keys.len();
        let now = self.clock.now();
        for key in keys {
            // read_entry drops corrupt and vanished entries itself
            if let Some((entry, _)) = self.read_entry(&key) {
                if entry.is_expired(now) {
                    self.remove(&key);
                }
            }
        }
        let removed = before.saturating_sub(self.index().entries.len());
        if removed > 0 {
            tracing::info!("Purged {} expired cache entries", removed);
        }
        removed
    }

    /// Delete every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let keys: Vec<String> = self.index().entries.keys().cloned().collect();
        for key in &keys {
            self.remove(key);
        }
        tracing::info!("Cleared {} cache entries", keys.len());
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index();
        CacheStats {
            directory: self.dir.clone(),
            entries: index.entries.len(),
            bytes: index.total_bytes,
            max_bytes: self.max_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{PaperDetails, Source, SourceId};
    use chrono::TimeZone;

    fn paper(title: &str) -> NormalizedPaper {
        NormalizedPaper {
            title: title.to_string(),
            authors: vec!["Cash, Sydney".to_string()],
            year: Some(2023),
            doi: Some("10.1000/xyz".to_string()),
            abstract_text: "Thalamic recordings.".to_string(),
            citation_count: 12,
            journal: Some("Epilepsia".to_string()),
            is_open_access: false,
            url: "https://pubmed.ncbi.nlm.nih.gov/1/".to_string(),
            source: Source::Pubmed,
            identifier: SourceId::Pmid("1".to_string()),
            details: PaperDetails::Article { pmc_id: None },
            impact_score: None,
            relevance_score: None,
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()))
    }

    fn topic(hours: u64) -> Topic {
        Topic {
            name: "epilepsy_clinical".to_string(),
            ttl_hours: hours,
        }
    }

    #[test]
    fn test_key_normalizes_query_and_separates_sources() {
        assert_eq!(cache_key("  Thalamus DBS ", "pubmed"), cache_key("thalamus dbs", "pubmed"));
        assert_ne!(cache_key("thalamus dbs", "pubmed"), cache_key("thalamus dbs", "arxiv"));
        let key = cache_key("thalamus dbs", "pubmed");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock()).unwrap();
        let results = vec![paper("A"), paper("B")];

        cache.put("thalamus", "pubmed", &results, &topic(168)).unwrap();
        assert_eq!(cache.get("thalamus", "pubmed"), Some(results));
        assert_eq!(cache.get("thalamus", "arxiv"), None);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_raw_query_not_in_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock()).unwrap();
        cache.put("secret thalamus query", "pubmed", &[paper("A")], &topic(24)).unwrap();

        for item in fs::read_dir(dir.path()).unwrap() {
            let name = item.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.contains("thalamus"));
        }
    }

    #[test]
    fn test_expired_entry_is_deleted_and_stays_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let start = clock.now();
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock.clone()).unwrap();
        cache.put("q", "pubmed", &[paper("A")], &topic(24)).unwrap();

        clock.advance(chrono::Duration::hours(23));
        assert!(cache.get("q", "pubmed").is_some());

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(cache.get("q", "pubmed"), None);
        assert!(!cache.path_for(&cache_key("q", "pubmed")).exists());

        clock.set(start);
        assert_eq!(cache.get("q", "pubmed"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_overwrite_resets_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock.clone()).unwrap();
        cache.put("q", "arxiv", &[paper("old")], &topic(24)).unwrap();
        clock.advance(chrono::Duration::hours(20));
        cache.put("q", "arxiv", &[paper("new")], &topic(24)).unwrap();
        clock.advance(chrono::Duration::hours(20));

        let hit = cache.get("q", "arxiv").unwrap();
        assert_eq!(hit[0].title, "new");
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock()).unwrap();
        cache.put("q", "nsf", &[paper("A")], &topic(24)).unwrap();

        let path = cache.path_for(&cache_key("q", "nsf"));
        fs::write(&path, b"{not json").unwrap();

        assert_eq!(cache.get("q", "nsf"), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_lru_eviction_keeps_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let probe = serde_json::to_vec(&CacheEntry {
            query: "q0".into(),
            source: "pubmed".into(),
            topic: "epilepsy_clinical".into(),
            stored_at: clock.now(),
            ttl_hours: 168,
            results: vec![paper("A")],
        })
        .unwrap()
        .len() as u64;

        // Room for roughly two entries.
        let cache = ResultCache::open(dir.path(), probe * 2 + probe / 2, clock).unwrap();
        cache.put("q0", "pubmed", &[paper("A")], &topic(168)).unwrap();
        cache.put("q1", "pubmed", &[paper("A")], &topic(168)).unwrap();
        assert!(cache.get("q0", "pubmed").is_some());

        cache.put("q2", "pubmed", &[paper("A")], &topic(168)).unwrap();
        assert!(cache.get("q0", "pubmed").is_some());
        assert!(cache.get("q1", "pubmed").is_none());
        assert!(cache.get("q2", "pubmed").is_some());
        assert!(cache.stats().bytes <= cache.stats().max_bytes);
    }

    #[test]
    fn test_reopen_sees_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        {
            let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock.clone()).unwrap();
            cache.put("q", "biorxiv", &[paper("A")], &topic(720)).unwrap();
        }
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock).unwrap();
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get("q", "biorxiv").is_some());
    }

    #[test]
    fn test_purge_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let cache = ResultCache::open(dir.path(), DEFAULT_MAX_BYTES, clock.clone()).unwrap();
        cache.put("short", "pubmed", &[paper("A")], &topic(24)).unwrap();
        cache.put("long", "pubmed", &[paper("A")], &topic(720)).unwrap();

        clock.advance(chrono::Duration::hours(48));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get("long", "pubmed").is_some());

        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }
}
