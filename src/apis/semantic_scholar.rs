use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    check_status, present, Candidate, NormalizedPaper, PaperDetails, PaperSource, SearchFilters, Source,
    SourceError, SourceId,
};
use crate::ranking;
use crate::ratelimit::RateLimiter;

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const MAX_RESULTS: usize = 50;

const FIELDS: &str = "paperId,title,authors,year,abstract,citationCount,journal,publicationTypes,isOpenAccess,url,venue,fieldsOfStudy,externalIds";

pub struct SemanticScholarClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    api_key: Option<String>,
    base_url: String,
}

impl SemanticScholarClient {
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>, api_key: Option<String>) -> Self {
        Self::with_base_url(client, limiter, api_key, BASE_URL)
    }

    pub fn with_base_url(
        client: reqwest::Client,
        limiter: Arc<RateLimiter>,
        api_key: Option<String>,
        base_url: &str,
    ) -> Self {
        Self {
            client,
            limiter,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    /// Look up one paper by Semantic Scholar id (`s2:` prefix optional) or any
    /// id form the Graph API accepts, such as `DOI:10.1000/x` or `arXiv:2101.00001`.
    /// `Ok(None)` when the paper does not exist.
    pub async fn get_paper(&self, id: &str, current_year: i32) -> Result<Option<NormalizedPaper>, SourceError> {
        let paper_id = id.trim();
        let paper_id = paper_id.strip_prefix("s2:").unwrap_or(paper_id);
        if !is_valid_paper_id(paper_id) {
            return Err(SourceError::InvalidId(id.to_string()));
        }
        let url = format!("{}/paper/{}", self.base_url, paper_id);

        self.limiter.acquire(self.name()).await;
        let resp = self
            .add_auth(self.client.get(&url).query(&[("fields", FIELDS)]))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!("Semantic Scholar has no paper {}", paper_id);
            return Ok(None);
        }
        let paper: S2Paper = check_status(resp).await?.json().await?;
        s2_to_candidate(paper)
            .validate(current_year)
            .map(Some)
            .map_err(|e| SourceError::Parse(format!("paper {}: {}", paper_id, e)))
    }
}

/// Ids go into the URL path unescaped, so only id characters are allowed.
fn is_valid_paper_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 200
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '/' | '_' | '-'))
        && !id.split('/').any(|seg| seg == "..")
}

#[derive(Deserialize)]
struct S2SearchResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    #[serde(default, deserialize_with = "present")]
    year: Option<Option<i32>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    citation_count: Option<u64>,
    journal: Option<S2Journal>,
    #[serde(default)]
    publication_types: Option<Vec<String>>,
    #[serde(default)]
    is_open_access: bool,
    url: Option<String>,
    venue: Option<String>,
    #[serde(default)]
    fields_of_study: Option<Vec<String>>,
    external_ids: Option<S2ExternalIds>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2Journal {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn s2_to_candidate(p: S2Paper) -> Candidate {
    let paper_id = p.paper_id.unwrap_or_default();
    let journal = non_blank(p.journal.and_then(|j| j.name)).or_else(|| non_blank(p.venue));
    let url = p
        .url
        .unwrap_or_else(|| format!("https://www.semanticscholar.org/paper/{}", paper_id));

    Candidate {
        title: non_blank(p.title),
        authors: p
            .authors
            .map(|authors| authors.into_iter().filter_map(|a| non_blank(a.name)).collect()),
        year: p.year,
        doi: non_blank(p.external_ids.and_then(|e| e.doi)),
        abstract_text: p.abstract_text.unwrap_or_default(),
        citation_count: p.citation_count.unwrap_or(0),
        journal,
        is_open_access: p.is_open_access,
        url,
        source: Source::SemanticScholar,
        identifier: SourceId::PaperId(paper_id),
        details: PaperDetails::Indexed {
            publication_types: p.publication_types.unwrap_or_default(),
            fields_of_study: p.fields_of_study.unwrap_or_default(),
        },
    }
}

fn parse_search_response(resp: S2SearchResponse) -> Vec<Candidate> {
    resp.data
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<S2Paper>(value) {
            Ok(paper) => Some(s2_to_candidate(paper)),
            Err(e) => {
                tracing::debug!("Skipping malformed Semantic Scholar record: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl PaperSource for SemanticScholarClient {
    fn name(&self) -> &str {
        "semantic_scholar"
    }

    fn fetch_limit(&self, limit: usize) -> usize {
        limit.min(MAX_RESULTS)
    }

    async fn fetch(&self, query: &str, limit: usize, _filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError> {
        let url = format!("{}/paper/search", self.base_url);
        let limit = limit.to_string();

        self.limiter.acquire(self.name()).await;
        let resp = self
            .add_auth(
                self.client
                    .get(&url)
                    .query(&[("query", query), ("limit", limit.as_str()), ("fields", FIELDS)]),
            )
            .send()
            .await?;
        let resp: S2SearchResponse = check_status(resp).await?.json().await?;
        Ok(parse_search_response(resp))
    }

    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64 {
        ranking::impact_score(paper, current_year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_response() -> serde_json::Value {
        json!({
            "total": 3,
            "data": [
                {
                    "paperId": "abc123",
                    "title": "Phase-amplitude coupling in focal epilepsy",
                    "authors": [{"name": "A. Author"}, {"name": null}, {"name": "B. Author"}],
                    "year": 2021,
                    "abstract": "PAC as a biomarker.",
                    "citationCount": 42,
                    "journal": {"name": "Brain", "volume": "144"},
                    "publicationTypes": ["JournalArticle"],
                    "isOpenAccess": true,
                    "url": "https://www.semanticscholar.org/paper/abc123",
                    "venue": "Brain (London)",
                    "fieldsOfStudy": ["Medicine"],
                    "externalIds": {"DOI": "10.1093/brain/x", "PubMed": "1"}
                },
                {
                    "paperId": "def456",
                    "title": "Venue only",
                    "authors": [],
                    "year": null,
                    "journal": null,
                    "venue": "NeurIPS",
                    "publicationTypes": null,
                    "fieldsOfStudy": null
                },
                {
                    "paperId": "ghi789",
                    "title": ["not", "a", "string"]
                }
            ]
        })
    }

    #[test]
    fn test_parse_search_response() {
        let resp: S2SearchResponse = serde_json::from_value(sample_response()).unwrap();
        let candidates = parse_search_response(resp);
        assert_eq!(candidates.len(), 2);

        let p = candidates[0].clone().validate(2025).unwrap();
        assert_eq!(p.authors, vec!["A. Author".to_string(), "B. Author".to_string()]);
        assert_eq!(p.journal.as_deref(), Some("Brain"));
        assert_eq!(p.doi.as_deref(), Some("10.1093/brain/x"));
        assert_eq!(p.citation_count, 42);
        assert!(p.is_open_access);
        assert_eq!(p.identifier, SourceId::PaperId("abc123".into()));
        assert_eq!(
            p.details,
            PaperDetails::Indexed {
                publication_types: vec!["JournalArticle".into()],
                fields_of_study: vec!["Medicine".into()],
            }
        );

        let venue_only = candidates[1].clone().validate(2025).unwrap();
        assert_eq!(venue_only.journal.as_deref(), Some("NeurIPS"));
        assert_eq!(venue_only.year, None);
        assert_eq!(venue_only.url, "https://www.semanticscholar.org/paper/def456");
    }

    #[test]
    fn test_missing_year_is_rejected_by_gate() {
        let resp: S2SearchResponse = serde_json::from_value(json!({
            "data": [{"paperId": "x", "title": "No year", "authors": []}]
        }))
        .unwrap();
        let candidates = parse_search_response(resp);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].clone().validate(2025).is_err());
    }

    #[tokio::test]
    async fn test_fetch_sends_fields_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .and(query_param("query", "seizure forecasting"))
            .and(query_param("limit", "10"))
            .and(query_param("fields", FIELDS))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_response()))
            .expect(1)
            .mount(&server)
            .await;

        let client = SemanticScholarClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            Some("secret".into()),
            &server.uri(),
        );
        let candidates = client
            .fetch("seizure forecasting", 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = SemanticScholarClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            None,
            &server.uri(),
        );
        let err = client.fetch("q", 10, &SearchFilters::default()).await.unwrap_err();
        assert!(matches!(err, SourceError::RateLimited));
    }

    fn lookup_client(uri: &str) -> SemanticScholarClient {
        SemanticScholarClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            None,
            uri,
        )
    }

    #[tokio::test]
    async fn test_get_paper() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/abc123"))
            .and(query_param("fields", FIELDS))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_response()["data"][0].clone()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/DOI:10.1000/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Paper not found"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/busy"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let client = lookup_client(&server.uri());
        let paper = client.get_paper("s2:abc123", 2025).await.unwrap().unwrap();
        assert_eq!(paper.title, "Phase-amplitude coupling in focal epilepsy");
        assert_eq!(paper.identifier, SourceId::PaperId("abc123".into()));

        assert!(client.get_paper("DOI:10.1000/missing", 2025).await.unwrap().is_none());
        assert!(matches!(
            client.get_paper("busy", 2025).await,
            Err(SourceError::RateLimited)
        ));
    }

    #[tokio::test]
    async fn test_get_paper_rejects_unsafe_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = lookup_client(&server.uri());
        for id in ["", "s2:", "abc?fields=x", "../search", "a b"] {
            assert!(matches!(client.get_paper(id, 2025).await, Err(SourceError::InvalidId(_))), "{id}");
        }
    }

    #[test]
    fn test_fetch_limit_capped() {
        let client = SemanticScholarClient::new(reqwest::Client::new(), Arc::new(RateLimiter::default()), None);
        assert_eq!(client.fetch_limit(10), 10);
        assert_eq!(client.fetch_limit(500), 50);
    }
}
