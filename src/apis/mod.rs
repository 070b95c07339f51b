pub mod arxiv;
pub mod biorxiv;
pub mod nih_reporter;
pub mod nsf;
pub mod pubmed;
pub mod semantic_scholar;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Per-request timeout for every remote call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const MAX_TITLE_CHARS: usize = 500;
pub const MIN_YEAR: i32 = 1900;

const USER_AGENT: &str = "grounded-search/0.1 (research literature tool)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Pubmed,
    Arxiv,
    Biorxiv,
    Medrxiv,
    SemanticScholar,
    NihReporter,
    Nsf,
}

impl Source {
    pub const ALL: [Source; 7] = [
        Source::Pubmed,
        Source::Arxiv,
        Source::Biorxiv,
        Source::Medrxiv,
        Source::SemanticScholar,
        Source::NihReporter,
        Source::Nsf,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Pubmed => "pubmed",
            Source::Arxiv => "arxiv",
            Source::Biorxiv => "biorxiv",
            Source::Medrxiv => "medrxiv",
            Source::SemanticScholar => "semantic_scholar",
            Source::NihReporter => "nih_reporter",
            Source::Nsf => "nsf",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-specific identifier of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Pmid(String),
    ArxivId(String),
    Doi(String),
    PaperId(String),
    ProjectNumber(String),
    AwardNumber(String),
}

impl SourceId {
    pub fn value(&self) -> &str {
        match self {
            SourceId::Pmid(v)
            | SourceId::ArxivId(v)
            | SourceId::Doi(v)
            | SourceId::PaperId(v)
            | SourceId::ProjectNumber(v)
            | SourceId::AwardNumber(v) => v,
        }
    }
}

/// Funding record details for grant sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantInfo {
    pub pi_name: String,
    #[serde(default)]
    pub co_pis: Vec<String>,
    pub institution: String,
    pub location: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub award_amount: f64,
    #[serde(default)]
    pub agencies: Vec<String>,
    pub fiscal_year: Option<i32>,
    pub activity_code: Option<String>,
    pub project_type: Option<String>,
    pub study_section: Option<String>,
    pub program: Option<String>,
    pub pi_email: Option<String>,
}

/// Per-source extras that do not fit the common shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaperDetails {
    Article {
        pmc_id: Option<String>,
    },
    Indexed {
        publication_types: Vec<String>,
        fields_of_study: Vec<String>,
    },
    Preprint {
        categories: Vec<String>,
        published: Option<String>,
        updated: Option<String>,
        version: Option<String>,
        pdf_url: Option<String>,
    },
    Grant(GrantInfo),
}

impl PaperDetails {
    pub fn grant(&self) -> Option<&GrantInfo> {
        match self {
            PaperDetails::Grant(info) => Some(info),
            _ => None,
        }
    }
}

/// The canonical record every adapter emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPaper {
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub citation_count: u64,
    pub journal: Option<String>,
    pub is_open_access: bool,
    pub url: String,
    pub source: Source,
    pub identifier: SourceId,
    pub details: PaperDetails,
    /// Attached during ranking; never cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<u8>,
}

/// A parsed record before the validation gate.
///
/// `title`, `authors` and `year` are `None` when the source record lacked the
/// field entirely; `year: Some(None)` means the field was present but empty.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub title: Option<String>,
    pub authors: Option<Vec<String>>,
    pub year: Option<Option<i32>>,
    pub doi: Option<String>,
    pub abstract_text: String,
    pub citation_count: u64,
    pub journal: Option<String>,
    pub is_open_access: bool,
    pub url: String,
    pub source: Source,
    pub identifier: SourceId,
    pub details: PaperDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("title is {0} characters, limit is {MAX_TITLE_CHARS}")]
    TitleTooLong(usize),
    #[error("year {0} outside {MIN_YEAR}..=current+1")]
    YearOutOfRange(i32),
}

impl Candidate {
    pub fn validate(self, current_year: i32) -> Result<NormalizedPaper, Rejection> {
        let title = self.title.ok_or(Rejection::MissingField("title"))?;
        let authors = self.authors.ok_or(Rejection::MissingField("authors"))?;
        let year = self.year.ok_or(Rejection::MissingField("year"))?;

        let len = title.chars().count();
        if len > MAX_TITLE_CHARS {
            return Err(Rejection::TitleTooLong(len));
        }
        if let Some(y) = year {
            if !(MIN_YEAR..=current_year + 1).contains(&y) {
                return Err(Rejection::YearOutOfRange(y));
            }
        }

        Ok(NormalizedPaper {
            title,
            authors,
            year,
            doi: self.doi,
            abstract_text: self.abstract_text,
            citation_count: self.citation_count,
            journal: self.journal,
            is_open_access: self.is_open_access,
            url: self.url,
            source: self.source,
            identifier: self.identifier,
            details: self.details,
            impact_score: None,
            relevance_score: None,
        })
    }
}

/// Run every candidate through the validation gate, dropping failures.
pub fn validate_batch(candidates: Vec<Candidate>, source: &str, current_year: i32) -> Vec<NormalizedPaper> {
    let total = candidates.len();
    let papers: Vec<NormalizedPaper> = candidates
        .into_iter()
        .filter_map(|c| match c.validate(current_year) {
            Ok(paper) => Some(paper),
            Err(reason) => {
                tracing::debug!("Dropped {} record: {}", source, reason);
                None
            }
        })
        .collect();

    if papers.len() < total {
        tracing::warn!("{}: dropped {} of {} records failing validation", source, total - papers.len(), total);
    }
    papers
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by remote API (HTTP 429)")]
    RateLimited,
    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("invalid paper id '{0}'")]
    InvalidId(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if e.is_decode() {
            SourceError::Parse(e.to_string())
        } else {
            SourceError::Http(e)
        }
    }
}

/// Map non-success responses to `SourceError`, passing 2xx through.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 429 {
        return Err(SourceError::RateLimited);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(SourceError::Status {
        status: status.as_u16(),
        message: message.chars().take(200).collect(),
    })
}

/// Shared HTTP client with the fixed request timeout.
pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Deserialize a field that may be absent: absent stays `None`, present
/// (even `null`) becomes `Some`.
pub(crate) fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Some APIs send numbers as strings and vice versa.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Trim, collapse internal whitespace, and drop blank strings.
pub(crate) fn clean_text(s: &str) -> Option<String> {
    let cleaned = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// `City, ST` with the country appended only outside the USA.
pub(crate) fn format_location(city: Option<&str>, state: Option<&str>, country: Option<&str>) -> String {
    let mut location = city.unwrap_or_default().to_string();
    if let Some(state) = state.filter(|s| !s.is_empty()) {
        if location.is_empty() {
            location = state.to_string();
        } else {
            location = format!("{}, {}", location, state);
        }
    }
    if let Some(country) = country.filter(|c| !c.is_empty() && !["US", "USA", "UNITED STATES"].contains(c)) {
        location = format!("{}, {}", location, country);
    }
    location
}

/// Grant records below `min_funding` are dropped; other records pass.
pub(crate) fn meets_min_funding(candidate: &Candidate, min_funding: Option<f64>) -> bool {
    match (min_funding, candidate.details.grant()) {
        (Some(min), Some(grant)) => grant.award_amount >= min,
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PreprintServer {
    Biorxiv,
    Medrxiv,
    #[default]
    Both,
}

impl PreprintServer {
    pub fn servers(&self) -> &'static [&'static str] {
        match self {
            PreprintServer::Biorxiv => &["biorxiv"],
            PreprintServer::Medrxiv => &["medrxiv"],
            PreprintServer::Both => &["biorxiv", "medrxiv"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PreprintServer::Biorxiv => "biorxiv",
            PreprintServer::Medrxiv => "medrxiv",
            PreprintServer::Both => "both",
        }
    }
}

/// Filters that only some sources honor. Unsupported filters are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to roughly the last five years.
    #[serde(default)]
    pub recent_only: bool,
    /// arXiv: restrict to the relevant category allow-list (default on).
    pub filter_categories: Option<bool>,
    /// bioRxiv/medRxiv: which server(s) to scan.
    pub server: Option<PreprintServer>,
    /// NIH: only currently active projects.
    #[serde(default)]
    pub include_active: bool,
    /// Grant sources: minimum award amount in dollars.
    pub min_funding: Option<f64>,
    /// Reference date for date-windowed filters. Set from the searcher's clock.
    #[serde(skip)]
    pub as_of: Option<NaiveDate>,
}

impl SearchFilters {
    pub fn today(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn current_year(&self) -> i32 {
        self.today().year()
    }
}

/// Canned query shapes some sources understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryPreset {
    /// PubMed: clinical trials and RCTs only.
    ClinicalTrials,
    /// PubMed: reviews and systematic reviews only.
    Reviews,
    /// PubMed: epilepsy MeSH terms, recent only.
    Epilepsy,
    /// arXiv: treat the query as an author name.
    Author,
    /// arXiv: restrict to one category.
    Category(String),
}

#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    /// Query string used for the cache key; folds in filters that change the result set.
    fn cache_query(&self, query: &str, _filters: &SearchFilters) -> String {
        query.to_string()
    }

    /// Rewrite a query for a preset. `None` means this source has no such preset.
    fn apply_preset(&self, _query: &str, _preset: &QueryPreset, _filters: &mut SearchFilters) -> Option<String> {
        None
    }

    /// Records to request for a caller asking for `limit`.
    fn fetch_limit(&self, limit: usize) -> usize {
        limit
    }

    /// Fetch and parse candidates for an already-sanitized query.
    async fn fetch(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError>;

    /// Source-specific ranking score; higher ranks first.
    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64;
}
