use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use crate::apis::semantic_scholar::SemanticScholarClient;
use crate::apis::{self, PaperSource, Source};
use crate::cache::{Clock, ResultCache};
use crate::fields::FieldDetector;
use crate::ratelimit::RateLimiter;

const DEFAULT_CACHE_MB: u64 = 100;
const DEFAULT_NCBI_EMAIL: &str = "grounded-search@example.com";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub cache_max_bytes: u64,
    pub fields_path: Option<PathBuf>,
    pub ncbi_email: String,
    pub semantic_scholar_api_key: Option<String>,
    pub enabled_source_names: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("GROUNDED_SEARCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_or_default(var("HOME")).join(".grounded-search"));

        let cache_mb = match var("GROUNDED_SEARCH_CACHE_MB") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("Ignoring invalid GROUNDED_SEARCH_CACHE_MB={:?}", raw);
                DEFAULT_CACHE_MB
            }),
            None => DEFAULT_CACHE_MB,
        };

        let enabled_source_names = var("GROUNDED_SEARCH_SOURCES")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            data_dir,
            cache_max_bytes: cache_mb * 1024 * 1024,
            fields_path: var("GROUNDED_SEARCH_FIELDS").map(PathBuf::from),
            ncbi_email: var("NCBI_EMAIL")
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_NCBI_EMAIL.to_string()),
            semantic_scholar_api_key: var("SEMANTIC_SCHOLAR_API_KEY").filter(|k| !k.trim().is_empty()),
            enabled_source_names,
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    fn should_enable(&self, name: &str) -> bool {
        self.enabled_source_names.is_empty() || self.enabled_source_names.iter().any(|n| n == name)
    }

    /// Build the list of enabled paper sources based on configuration.
    ///
    /// bioRxiv and medRxiv share one adapter; enabling either name enables it.
    pub fn build_sources(&self, client: reqwest::Client, limiter: Arc<RateLimiter>) -> Vec<Arc<dyn PaperSource>> {
        let mut sources: Vec<Arc<dyn PaperSource>> = Vec::new();

        if self.should_enable("pubmed") {
            sources.push(Arc::new(apis::pubmed::PubMedClient::new(
                client.clone(),
                limiter.clone(),
                self.ncbi_email.clone(),
            )));
        }
        if self.should_enable("arxiv") {
            sources.push(Arc::new(apis::arxiv::ArxivClient::new(client.clone(), limiter.clone())));
        }
        if self.should_enable("biorxiv") || self.should_enable("medrxiv") {
            sources.push(Arc::new(apis::biorxiv::BiorxivClient::new(client.clone(), limiter.clone())));
        }
        if let Some(s2) = self.semantic_scholar(client.clone(), limiter.clone()) {
            sources.push(s2);
        }
        if self.should_enable("nih_reporter") {
            sources.push(Arc::new(apis::nih_reporter::NihReporterClient::new(client.clone(), limiter.clone())));
        }
        if self.should_enable("nsf") {
            sources.push(Arc::new(apis::nsf::NsfClient::new(client, limiter)));
        }

        sources
    }

    /// Semantic Scholar client for id lookups, if the source is enabled.
    pub fn semantic_scholar(&self, client: reqwest::Client, limiter: Arc<RateLimiter>) -> Option<Arc<SemanticScholarClient>> {
        self.should_enable("semantic_scholar").then(|| {
            Arc::new(SemanticScholarClient::new(
                client,
                limiter,
                self.semantic_scholar_api_key.clone(),
            ))
        })
    }

    /// Open the result cache under the data directory, creating it if needed.
    pub fn open_cache(&self, clock: Arc<dyn Clock>) -> anyhow::Result<ResultCache> {
        let dir = self.cache_dir();
        ResultCache::open(&dir, self.cache_max_bytes, clock)
            .with_context(|| format!("cache store unavailable at {}", dir.display()))
    }

    /// Field taxonomy from `GROUNDED_SEARCH_FIELDS`, else the built-in table.
    pub fn field_detector(&self) -> FieldDetector {
        match &self.fields_path {
            Some(path) => FieldDetector::from_path_or_default(path),
            None => FieldDetector::default(),
        }
    }

    /// Return a list of source status descriptions.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        Source::ALL
            .iter()
            .map(|source| {
                let name = source.as_str();
                if !self.should_enable(name) {
                    return SourceStatus {
                        name: name.into(),
                        enabled: false,
                        note: "Disabled by GROUNDED_SEARCH_SOURCES filter".into(),
                    };
                }
                let note = match source {
                    Source::Pubmed => format!("E-utilities, contact email {}", self.ncbi_email),
                    Source::SemanticScholar if self.semantic_scholar_api_key.is_some() => "API key set".into(),
                    Source::SemanticScholar => "No API key (shared rate limit)".into(),
                    Source::Biorxiv | Source::Medrxiv => "Last 180 days, filtered locally".into(),
                    _ => "No API key required".into(),
                };
                SourceStatus {
                    name: name.into(),
                    enabled: true,
                    note,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub note: String,
}

fn home_or_default(home: Option<String>) -> PathBuf {
    home.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SystemClock;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/someone")]);
        assert_eq!(c.data_dir, PathBuf::from("/home/someone/.grounded-search"));
        assert_eq!(c.cache_dir(), PathBuf::from("/home/someone/.grounded-search/cache"));
        assert_eq!(c.cache_max_bytes, 100 * 1024 * 1024);
        assert_eq!(c.ncbi_email, DEFAULT_NCBI_EMAIL);
        assert!(c.semantic_scholar_api_key.is_none());
        assert!(c.fields_path.is_none());
        assert!(c.source_status().iter().all(|s| s.enabled));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("GROUNDED_SEARCH_DATA_DIR", "/tmp/gs"),
            ("GROUNDED_SEARCH_CACHE_MB", "5"),
            ("NCBI_EMAIL", "lab@example.org"),
            ("SEMANTIC_SCHOLAR_API_KEY", "k"),
            ("GROUNDED_SEARCH_FIELDS", "/etc/fields.json"),
        ]);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/gs"));
        assert_eq!(c.cache_max_bytes, 5 * 1024 * 1024);
        assert_eq!(c.ncbi_email, "lab@example.org");
        assert_eq!(c.semantic_scholar_api_key.as_deref(), Some("k"));
        assert_eq!(c.fields_path, Some(PathBuf::from("/etc/fields.json")));

        let bad = config(&[("GROUNDED_SEARCH_CACHE_MB", "lots")]);
        assert_eq!(bad.cache_max_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_source_filter() {
        let c = config(&[("GROUNDED_SEARCH_SOURCES", "PubMed, medrxiv ,nsf")]);
        let sources = c.build_sources(reqwest::Client::new(), Arc::new(RateLimiter::default()));
        let names: Vec<_> = sources.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["pubmed", "biorxiv", "nsf"]);
        assert!(c.semantic_scholar(reqwest::Client::new(), Arc::new(RateLimiter::default())).is_none());

        let status = c.source_status();
        let enabled: Vec<_> = status.iter().filter(|s| s.enabled).map(|s| s.name.as_str()).collect();
        assert_eq!(enabled, vec!["pubmed", "medrxiv", "nsf"]);
    }

    #[test]
    fn test_all_sources_by_default() {
        let c = config(&[]);
        let sources = c.build_sources(reqwest::Client::new(), Arc::new(RateLimiter::default()));
        assert_eq!(sources.len(), 6);
        assert!(c.semantic_scholar(reqwest::Client::new(), Arc::new(RateLimiter::default())).is_some());
    }

    #[test]
    fn test_open_cache_and_missing_taxonomy() {
        let dir = tempfile::tempdir().unwrap();
        let c = config(&[
            ("GROUNDED_SEARCH_DATA_DIR", dir.path().to_str().unwrap()),
            ("GROUNDED_SEARCH_FIELDS", "/nonexistent/fields.json"),
        ]);
        let cache = c.open_cache(Arc::new(SystemClock)).unwrap();
        assert_eq!(cache.directory(), dir.path().join("cache"));
        assert_eq!(c.field_detector().list_fields().len(), 10);
    }
}
