use std::collections::HashSet;
use std::sync::Arc;

use chrono::Datelike;
use serde::Serialize;
use thiserror::Error;

use crate::apis::{
    validate_batch, NormalizedPaper, PaperSource, PreprintServer, QueryPreset, SearchFilters, SourceError,
};
use crate::cache::{Clock, ResultCache};
use crate::fields::FieldDetector;
use crate::ranking::rank_by;
use crate::relevance::RelevanceScorer;
use crate::sanitize::{check_query, truncate_for_log, QueryRejection};
use crate::topic::TopicClassifier;

/// Titles closer than this edit distance are treated as the same paper.
const TITLE_DISTANCE: usize = 5;
/// Floor for the per-source request size in a federated search.
const MIN_PER_SOURCE: usize = 5;

/// Why one adapter run produced nothing. Never escapes `Searcher::search`.
#[derive(Debug, Error)]
pub enum SearchFailure {
    #[error("query rejected: {0}")]
    Rejected(#[from] QueryRejection),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub use_cache: bool,
    pub filters: SearchFilters,
    pub preset: Option<QueryPreset>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            use_cache: true,
            filters: SearchFilters::default(),
            preset: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederatedRequest {
    pub query: String,
    pub limit: usize,
    pub use_cache: bool,
    /// Explicit source names; `None` routes through field detection.
    pub sources: Option<Vec<String>>,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Serialize)]
pub struct FederatedResults {
    pub detected_fields: Vec<String>,
    pub sources: Vec<String>,
    pub papers: Vec<NormalizedPaper>,
}

/// Runs the per-source pipeline: preset, sanitize, cache, fetch, validate,
/// store, rank.
#[derive(Clone)]
pub struct Searcher {
    cache: Arc<ResultCache>,
    classifier: Arc<TopicClassifier>,
    clock: Arc<dyn Clock>,
}

impl Searcher {
    pub fn new(cache: Arc<ResultCache>, classifier: TopicClassifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            classifier: Arc::new(classifier),
            clock,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn classifier(&self) -> &TopicClassifier {
        &self.classifier
    }

    pub fn current_year(&self) -> i32 {
        self.clock.now().year()
    }

    /// Search one source. Every failure degrades to an empty list.
    pub async fn search(&self, source: &dyn PaperSource, request: &SearchRequest) -> Vec<NormalizedPaper> {
        match self.try_search(source, request).await {
            Ok(papers) => papers,
            Err(SearchFailure::Rejected(QueryRejection::InjectionSignature)) => {
                tracing::error!(
                    "{}: potential injection attempt rejected: {}",
                    source.name(),
                    truncate_for_log(&request.query)
                );
                Vec::new()
            }
            Err(SearchFailure::Rejected(reason)) => {
                tracing::warn!("{}: query rejected ({}): {}", source.name(), reason, truncate_for_log(&request.query));
                Vec::new()
            }
            Err(SearchFailure::Source(SourceError::RateLimited)) => {
                tracing::warn!("{}: rate limit exceeded, returning no results", source.name());
                Vec::new()
            }
            Err(SearchFailure::Source(e)) => {
                tracing::warn!("{} search failed: {}", source.name(), e);
                Vec::new()
            }
        }
    }

    pub async fn try_search(
        &self,
        source: &dyn PaperSource,
        request: &SearchRequest,
    ) -> Result<Vec<NormalizedPaper>, SearchFailure> {
        let mut filters = request.filters.clone();
        filters.as_of = Some(self.clock.now().date_naive());
        let query = match &request.preset {
            Some(preset) => match source.apply_preset(&request.query, preset, &mut filters) {
                Some(rewritten) => rewritten,
                None => {
                    tracing::debug!("{} has no {:?} preset; using the query as-is", source.name(), preset);
                    request.query.clone()
                }
            },
            None => request.query.clone(),
        };

        let clean = check_query(&query)?;
        let cache_query = source.cache_query(&clean, &filters);
        let current_year = self.current_year();

        if request.use_cache {
            if let Some(cached) = self.cache.get(&cache_query, source.name()) {
                tracing::info!("{}: returning {} cached results", source.name(), cached.len());
                return Ok(self.rank(source, cached, request.limit, current_year));
            }
        }

        tracing::info!("Searching {} for: {}", source.name(), truncate_for_log(&clean));
        let candidates = source.fetch(&clean, source.fetch_limit(request.limit), &filters).await?;
        let papers = validate_batch(candidates, source.name(), current_year);
        tracing::info!("{}: {} valid records", source.name(), papers.len());

        if !papers.is_empty() {
            let topic = self.classifier.classify(&clean, "");
            if let Err(e) = self.cache.put(&cache_query, source.name(), &papers, &topic) {
                tracing::error!("{}: failed to cache results: {}", source.name(), e);
            }
        }

        Ok(self.rank(source, papers, request.limit, current_year))
    }

    fn rank(
        &self,
        source: &dyn PaperSource,
        papers: Vec<NormalizedPaper>,
        limit: usize,
        current_year: i32,
    ) -> Vec<NormalizedPaper> {
        let mut ranked = rank_by(papers, |p| source.score(p, current_year));
        ranked.truncate(limit);
        ranked
    }

    /// Search several sources concurrently, merge, deduplicate and order by
    /// relevance to the query.
    pub async fn federated_search(
        &self,
        registry: &[Arc<dyn PaperSource>],
        detector: &FieldDetector,
        scorer: &RelevanceScorer,
        request: &FederatedRequest,
    ) -> FederatedResults {
        if let Err(reason) = check_query(&request.query) {
            tracing::warn!("Federated search rejected ({}): {}", reason, truncate_for_log(&request.query));
            return FederatedResults {
                detected_fields: Vec::new(),
                sources: Vec::new(),
                papers: Vec::new(),
            };
        }

        let (detected_fields, names) = match &request.sources {
            Some(names) => (Vec::new(), names.clone()),
            None => {
                let detection = detector.detect(&request.query);
                (detection.detected_fields, detection.recommended_sources)
            }
        };
        let routes = route(registry, &names, &request.filters);
        if routes.is_empty() {
            tracing::warn!("No enabled sources for: {}", names.join(", "));
            return FederatedResults {
                detected_fields,
                sources: Vec::new(),
                papers: Vec::new(),
            };
        }

        // Query all sources in parallel
        let per_source = (request.limit * 2 / routes.len()).max(MIN_PER_SOURCE);
        let handles: Vec<_> = routes
            .iter()
            .map(|(source, filters)| {
                let searcher = self.clone();
                let source = Arc::clone(source);
                let request = SearchRequest {
                    query: request.query.clone(),
                    limit: per_source,
                    use_cache: request.use_cache,
                    filters: filters.clone(),
                    preset: None,
                };
                tokio::spawn(async move { searcher.search(source.as_ref(), &request).await })
            })
            .collect();

        let mut all_results = Vec::new();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(results) => all_results.extend(results),
                Err(e) => tracing::warn!("Source task panicked: {}", e),
            }
        }

        let sources = routes.iter().map(|(s, _)| s.name().to_string()).collect();
        let papers = deduplicate_and_rank(all_results, scorer, request.limit);
        FederatedResults {
            detected_fields,
            sources,
            papers,
        }
    }
}

/// Find an adapter by name. `medrxiv` resolves to the preprint adapter
/// restricted to that server.
pub fn resolve_source(
    registry: &[Arc<dyn PaperSource>],
    name: &str,
) -> Option<(Arc<dyn PaperSource>, Option<PreprintServer>)> {
    let name = name.trim().to_lowercase();
    let (lookup, server) = match name.as_str() {
        "medrxiv" => ("biorxiv", Some(PreprintServer::Medrxiv)),
        "biorxiv" => ("biorxiv", Some(PreprintServer::Biorxiv)),
        other => (other, None),
    };
    registry
        .iter()
        .find(|s| s.name() == lookup)
        .map(|s| (Arc::clone(s), server))
}

/// Map source names onto adapters, merging bioRxiv and medRxiv into one
/// run over both servers. Unknown or disabled names are skipped.
fn route(
    registry: &[Arc<dyn PaperSource>],
    names: &[String],
    filters: &SearchFilters,
) -> Vec<(Arc<dyn PaperSource>, SearchFilters)> {
    let mut routes: Vec<(Arc<dyn PaperSource>, SearchFilters)> = Vec::new();
    for name in names {
        let Some((source, server)) = resolve_source(registry, name) else {
            tracing::debug!("Skipping unavailable source '{}'", name);
            continue;
        };
        if let Some((_, existing)) = routes.iter_mut().find(|(s, _)| s.name() == source.name()) {
            if filters.server.is_none() && existing.server != server {
                existing.server = Some(PreprintServer::Both);
            }
            continue;
        }
        let mut filters = filters.clone();
        if filters.server.is_none() {
            filters.server = server;
        }
        routes.push((source, filters));
    }
    routes
}

/// Deduplicate results by DOI (exact) and title similarity, then order by
/// relevance and impact.
fn deduplicate_and_rank(mut results: Vec<NormalizedPaper>, scorer: &RelevanceScorer, limit: usize) -> Vec<NormalizedPaper> {
    if results.is_empty() {
        return results;
    }

    // Prefer papers with more fields filled; stable so source order breaks ties
    results.sort_by(|a, b| metadata_score(b).cmp(&metadata_score(a)));

    let mut seen_dois: HashSet<String> = HashSet::new();
    let mut seen_titles: Vec<String> = Vec::new();
    let mut deduped: Vec<NormalizedPaper> = Vec::new();

    for mut paper in results {
        if let Some(doi) = paper.doi.as_deref().map(|d| d.trim().to_lowercase()).filter(|d| !d.is_empty()) {
            if !seen_dois.insert(doi) {
                continue;
            }
        }
        let normalized = normalize_title(&paper.title);
        if seen_titles
            .iter()
            .any(|t| strsim::levenshtein(&normalized, t) < TITLE_DISTANCE)
        {
            continue;
        }
        seen_titles.push(normalized);

        paper.relevance_score = Some(scorer.score(&paper.title, &paper.abstract_text, "").score);
        deduped.push(paper);
    }

    deduped.sort_by(|a, b| {
        b.relevance_score
            .cmp(&a.relevance_score)
            .then_with(|| b.impact_score.unwrap_or(0.0).total_cmp(&a.impact_score.unwrap_or(0.0)))
    });
    deduped.truncate(limit);
    deduped
}

/// Score metadata richness (higher = more complete).
fn metadata_score(p: &NormalizedPaper) -> u32 {
    let mut score = 0u32;
    if !p.authors.is_empty() { score += 1; }
    if !p.abstract_text.is_empty() { score += 2; }
    if p.year.is_some() { score += 1; }
    if p.doi.is_some() { score += 2; }
    if p.citation_count > 0 { score += 1; }
    if p.journal.is_some() { score += 1; }
    score
}

fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
