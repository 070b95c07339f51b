use std::sync::Arc;

use anyhow::Context;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use grounded_search::apis::semantic_scholar::SemanticScholarClient;
use grounded_search::apis::{self, PaperSource, PreprintServer, QueryPreset, SearchFilters, SourceError};
use grounded_search::cache::{Clock, SystemClock};
use grounded_search::config::Config;
use grounded_search::fields::FieldDetector;
use grounded_search::ratelimit::RateLimiter;
use grounded_search::relevance::RelevanceScorer;
use grounded_search::search::{resolve_source, FederatedRequest, SearchRequest, Searcher};
use grounded_search::topic::TopicClassifier;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 100;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchPapersParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Sources to search (e.g. [\"pubmed\", \"arxiv\"]). Omit to route by detected research field")]
    sources: Option<Vec<String>>,
    #[schemars(description = "Maximum results to return (default 10, max 100)")]
    max_results: Option<u32>,
    #[schemars(description = "Restrict to roughly the last five years where the source supports it")]
    recent_only: Option<bool>,
    #[schemars(description = "Use cached results when fresh (default true)")]
    use_cache: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchSourceParams {
    #[schemars(description = "Source name: pubmed, arxiv, biorxiv, medrxiv, semantic_scholar, nih_reporter or nsf")]
    source: String,
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Maximum results to return (default 10, max 100)")]
    max_results: Option<u32>,
    #[schemars(description = "Use cached results when fresh (default true)")]
    use_cache: Option<bool>,
    #[schemars(description = "PubMed/NIH/NSF: restrict to roughly the last five years")]
    recent_only: Option<bool>,
    #[schemars(description = "arXiv: restrict to the relevant category list (default true)")]
    filter_categories: Option<bool>,
    #[schemars(description = "bioRxiv/medRxiv: which server to scan (default both)")]
    server: Option<PreprintServer>,
    #[schemars(description = "NIH: only currently active projects")]
    include_active: Option<bool>,
    #[schemars(description = "NIH/NSF: minimum award amount in dollars")]
    min_funding: Option<f64>,
    #[schemars(description = "Query preset: clinical_trials, reviews, epilepsy (PubMed); author, {\"category\": \"q-bio.NC\"} (arXiv)")]
    preset: Option<QueryPreset>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryParams {
    #[schemars(description = "Free-text research query")]
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetPaperParams {
    #[schemars(description = "Semantic Scholar paper id (optionally s2:-prefixed), or DOI:..., arXiv:..., PMID:...")]
    id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListFieldsParams {
    #[schemars(description = "Return the full definition of this field instead of the list")]
    name: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ScoreRelevanceParams {
    #[schemars(description = "Paper title")]
    title: String,
    #[serde(rename = "abstract")]
    #[schemars(description = "Paper abstract")]
    abstract_text: Option<String>,
    #[schemars(description = "Optional full text")]
    full_text: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ClassifyTopicParams {
    #[schemars(description = "Title or query text")]
    title: String,
    #[serde(rename = "abstract")]
    #[schemars(description = "Optional abstract")]
    abstract_text: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PurgeCacheParams {
    #[schemars(description = "Remove every entry, not only expired ones (default false)")]
    all: Option<bool>,
}

fn to_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn clamp_limit(limit: Option<u32>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GroundedSearchServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    sources: Arc<Vec<Arc<dyn PaperSource>>>,
    semantic_scholar: Option<Arc<SemanticScholarClient>>,
    searcher: Searcher,
    detector: Arc<FieldDetector>,
    scorer: Arc<RelevanceScorer>,
}

#[tool_router]
impl GroundedSearchServer {
    pub fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        let client = apis::http_client().context("failed to build HTTP client")?;
        let limiter = Arc::new(RateLimiter::default());
        let sources = config.build_sources(client.clone(), limiter.clone());
        let semantic_scholar = config.semantic_scholar(client, limiter);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = config.open_cache(clock.clone())?;
        let purged = cache.purge_expired();
        tracing::info!(
            "Initialized {} sources, cache={} ({} expired entries purged)",
            sources.len(),
            cache.directory().display(),
            purged
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            searcher: Searcher::new(Arc::new(cache), TopicClassifier::default(), clock),
            detector: Arc::new(config.field_detector()),
            scorer: Arc::new(RelevanceScorer::default()),
            config: Arc::new(config),
            sources: Arc::new(sources),
            semantic_scholar,
        })
    }

    #[tool(description = "List available literature and grant sources and their status")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        to_json(&self.config.source_status())
    }

    #[tool(description = "Search several sources at once. Without explicit sources the query is routed by detected research field. Returns deduplicated results ordered by relevance, then impact.")]
    async fn search_papers(
        &self,
        Parameters(params): Parameters<SearchPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = FederatedRequest {
            query: params.query,
            limit: clamp_limit(params.max_results),
            use_cache: params.use_cache.unwrap_or(true),
            sources: params.sources,
            filters: SearchFilters {
                recent_only: params.recent_only.unwrap_or(false),
                ..Default::default()
            },
        };
        let results = self
            .searcher
            .federated_search(&self.sources, &self.detector, &self.scorer, &request)
            .await;
        to_json(&results)
    }

    #[tool(description = "Search a single source with its source-specific filters and presets. Results are ranked by that source's impact score.")]
    async fn search_source(
        &self,
        Parameters(params): Parameters<SearchSourceParams>,
    ) -> Result<CallToolResult, McpError> {
        let (source, server) = resolve_source(&self.sources, &params.source).ok_or_else(|| {
            McpError::invalid_params(format!("Unknown or disabled source: {}", params.source), None)
        })?;

        let request = SearchRequest {
            query: params.query,
            limit: clamp_limit(params.max_results),
            use_cache: params.use_cache.unwrap_or(true),
            filters: SearchFilters {
                recent_only: params.recent_only.unwrap_or(false),
                filter_categories: params.filter_categories,
                server: params.server.or(server),
                include_active: params.include_active.unwrap_or(false),
                min_funding: params.min_funding,
                ..Default::default()
            },
            preset: params.preset,
        };
        let papers = self.searcher.search(source.as_ref(), &request).await;
        to_json(&papers)
    }

    #[tool(description = "Get full metadata for one paper from Semantic Scholar by id")]
    async fn get_paper(
        &self,
        Parameters(params): Parameters<GetPaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let client = self.semantic_scholar.as_ref().ok_or_else(|| {
            McpError::invalid_params("semantic_scholar source is disabled".to_string(), None)
        })?;
        match client.get_paper(&params.id, self.searcher.current_year()).await {
            Ok(Some(paper)) => to_json(&paper),
            Ok(None) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Paper not found: {}",
                params.id
            ))])),
            Err(e @ SourceError::InvalidId(_)) => Err(McpError::invalid_params(e.to_string(), None)),
            Err(e) => Err(McpError::internal_error(format!("Semantic Scholar lookup failed: {}", e), None)),
        }
    }

    #[tool(description = "Detect research fields in a query and recommend which sources to search")]
    async fn detect_fields(
        &self,
        Parameters(params): Parameters<QueryParams>,
    ) -> Result<CallToolResult, McpError> {
        to_json(&self.detector.detect(&params.query))
    }

    #[tool(description = "List the research fields used for routing, or show one field's definition")]
    async fn list_fields(
        &self,
        Parameters(params): Parameters<ListFieldsParams>,
    ) -> Result<CallToolResult, McpError> {
        match params.name {
            Some(name) => {
                let spec = self.detector.field_info(&name).ok_or_else(|| {
                    McpError::invalid_params(format!("Unknown field: {}", name), None)
                })?;
                to_json(spec)
            }
            None => to_json(&self.detector.list_fields()),
        }
    }

    #[tool(description = "Score a paper's relevance (0-100) to epilepsy and neuromodulation research, with reasons")]
    async fn score_relevance(
        &self,
        Parameters(params): Parameters<ScoreRelevanceParams>,
    ) -> Result<CallToolResult, McpError> {
        let score = self.scorer.score(
            &params.title,
            params.abstract_text.as_deref().unwrap_or_default(),
            params.full_text.as_deref().unwrap_or_default(),
        );
        to_json(&score)
    }

    #[tool(description = "Classify text into a cache topic and report the freshness window it implies")]
    async fn classify_topic(
        &self,
        Parameters(params): Parameters<ClassifyTopicParams>,
    ) -> Result<CallToolResult, McpError> {
        let topic = self
            .searcher
            .classifier()
            .classify(&params.title, params.abstract_text.as_deref().unwrap_or_default());
        to_json(&topic)
    }

    #[tool(description = "Remove expired cache entries (or all entries) and report cache usage")]
    async fn purge_cache(
        &self,
        Parameters(params): Parameters<PurgeCacheParams>,
    ) -> Result<CallToolResult, McpError> {
        let cache = self.searcher.cache();
        let removed = if params.all.unwrap_or(false) {
            cache.clear()
        } else {
            cache.purge_expired()
        };
        to_json(&serde_json::json!({
            "removed": removed,
            "stats": cache.stats(),
        }))
    }
}

#[tool_handler]
impl ServerHandler for GroundedSearchServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Search and rank scientific literature and grant funding records. \
                 Supports PubMed, arXiv, bioRxiv/medRxiv, Semantic Scholar, NIH RePORTER \
                 and NSF Awards, with query sanitization, rate limiting, topic-aware \
                 caching, field-based source routing and relevance scoring."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting grounded-search MCP server");

    let server = GroundedSearchServer::create()?;
    let searcher = server.searcher.clone();
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    let purged = searcher.cache().purge_expired();
    tracing::info!("Shutting down; purged {} expired cache entries", purged);
    Ok(())
}
