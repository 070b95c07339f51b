use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::Deserialize;

use super::{
    check_status, clean_text, string_or_number, Candidate, NormalizedPaper, PaperDetails, PaperSource,
    SearchFilters, Source, SourceError, SourceId,
};
use crate::ranking;
use crate::ratelimit::RateLimiter;

const BASE_URL: &str = "https://api.biorxiv.org";
const MAX_FETCH: usize = 100;
const WINDOW_DAYS: i64 = 180;
const MAX_AUTHORS: usize = 10;

/// Subject areas kept for short queries even without a term match.
pub const RELEVANT_CATEGORIES: &[&str] = &[
    "neuroscience",
    "biophysics",
    "systems biology",
    "bioinformatics",
    "cell biology",
    "genetics",
    "physiology",
    "epidemiology",
    "neurology",
    "psychiatry and clinical psychology",
];

/// bioRxiv and medRxiv share one content API; there is no keyword endpoint,
/// so recent posts are pulled per server and filtered locally.
pub struct BiorxivClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl BiorxivClient {
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self::with_base_url(client, limiter, BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, limiter: Arc<RateLimiter>, base_url: &str) -> Self {
        Self {
            client,
            limiter,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_server(&self, server: &str, query: &str, today: NaiveDate) -> Result<Vec<Candidate>, SourceError> {
        let (start, end) = date_window(today);
        let url = format!("{}/details/{}/{}/{}/0/json", self.base_url, server, start, end);

        // both servers sit behind one host and share one budget
        self.limiter.acquire(self.name()).await;
        let resp = self.client.get(&url).send().await?;
        let body: DetailsResponse = check_status(resp).await?.json().await?;

        let status = body.messages.first().and_then(|m| m.status.as_deref()).unwrap_or("");
        if status != "ok" {
            tracing::warn!("{} returned status '{}'", server, status);
            return Ok(Vec::new());
        }

        let source = if server == "medrxiv" { Source::Medrxiv } else { Source::Biorxiv };
        let terms: Vec<String> = query.to_lowercase().split_whitespace().map(str::to_string).collect();
        let papers: Vec<Candidate> = body
            .collection
            .into_iter()
            .filter(|r| r.matches(&terms))
            .map(|r| r.into_candidate(server, source))
            .collect();
        tracing::info!("Found {} relevant posts on {}", papers.len(), server);
        Ok(papers)
    }
}

/// `(today - 180 days, today)` formatted as `YYYY-MM-DD`.
fn date_window(today: NaiveDate) -> (String, String) {
    let start = today - Duration::days(WINDOW_DAYS);
    (start.format("%Y-%m-%d").to_string(), today.format("%Y-%m-%d").to_string())
}

#[derive(Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    collection: Vec<PreprintRecord>,
}

#[derive(Deserialize)]
struct Message {
    status: Option<String>,
}

#[derive(Deserialize)]
struct PreprintRecord {
    doi: Option<String>,
    title: Option<String>,
    authors: Option<String>,
    date: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    version: Option<String>,
    category: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
}

impl PreprintRecord {
    /// Any query term in title or abstract, or a relevant category when the
    /// query is at most two words.
    fn matches(&self, terms: &[String]) -> bool {
        let title = self.title.as_deref().unwrap_or_default().to_lowercase();
        let abstract_text = self.abstract_text.as_deref().unwrap_or_default().to_lowercase();
        let category = self.category.as_deref().unwrap_or_default().to_lowercase();

        let term_hit = terms.iter().any(|t| title.contains(t.as_str()) || abstract_text.contains(t.as_str()));
        let category_hit = RELEVANT_CATEGORIES.iter().any(|c| category.contains(c));
        term_hit || (category_hit && terms.len() <= 2)
    }

    fn into_candidate(self, server: &str, source: Source) -> Candidate {
        let authors = self
            .authors
            .as_deref()
            .unwrap_or_default()
            .split(';')
            .filter_map(clean_text)
            .take(MAX_AUTHORS)
            .collect();
        let year = self
            .date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
            .map(|d| chrono::Datelike::year(&d));
        let doi = self.doi.as_deref().and_then(clean_text);
        let version = self.version.unwrap_or_else(|| "1".to_string());
        let url = format!(
            "https://www.{}.org/content/{}v{}",
            server,
            doi.as_deref().unwrap_or_default(),
            version
        );

        Candidate {
            title: self.title.as_deref().and_then(clean_text),
            authors: Some(authors),
            year: Some(year),
            abstract_text: self.abstract_text.unwrap_or_default(),
            citation_count: 0,
            journal: Some(format!("{} preprint", server)),
            is_open_access: true,
            source,
            identifier: SourceId::Doi(doi.clone().unwrap_or_default()),
            doi,
            details: PaperDetails::Preprint {
                categories: self.category.as_deref().and_then(clean_text).into_iter().collect(),
                published: self.date,
                updated: None,
                version: Some(version),
                pdf_url: Some(format!("{}.full.pdf", url)),
            },
            url,
        }
    }
}

#[async_trait]
impl PaperSource for BiorxivClient {
    fn name(&self) -> &str {
        "biorxiv"
    }

    fn cache_query(&self, query: &str, filters: &SearchFilters) -> String {
        format!("{}_{}", query, filters.server.unwrap_or_default().as_str())
    }

    fn fetch_limit(&self, limit: usize) -> usize {
        (limit * 2).min(MAX_FETCH)
    }

    async fn fetch(&self, query: &str, _limit: usize, filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError> {
        let mut papers = Vec::new();
        let mut last_err = None;
        let mut any_ok = false;

        for server in filters.server.unwrap_or_default().servers() {
            match self.fetch_server(server, query, filters.today()).await {
                Ok(found) => {
                    any_ok = true;
                    papers.extend(found);
                }
                Err(e) => {
                    tracing::warn!("Error fetching from {}: {}", server, e);
                    last_err = Some(e);
                }
            }
        }
        if let (false, Some(e)) = (any_ok, last_err) {
            return Err(e);
        }

        // Same preprint can be cross-posted to both servers.
        let mut seen = HashSet::new();
        papers.retain(|p| {
            let key = p.title.as_deref().unwrap_or_default().trim().to_lowercase();
            seen.insert(key)
        });
        Ok(papers)
    }

    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64 {
        ranking::preprint_score(paper, current_year)
    }
}
