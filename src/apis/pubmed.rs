use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use super::{
    check_status, clean_text, Candidate, NormalizedPaper, PaperDetails, PaperSource, QueryPreset,
    SearchFilters, Source, SourceError, SourceId, REQUEST_TIMEOUT,
};
use crate::ranking;
use crate::ratelimit::RateLimiter;

const BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const MAX_FETCH: usize = 100;
const RECENT_FILTER: &str = " AND (\"last 5 years\"[PDat])";

pub struct PubMedClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    email: String,
}

impl PubMedClient {
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>, email: String) -> Self {
        Self::with_base_url(client, limiter, email, BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, limiter: Arc<RateLimiter>, email: String, base_url: &str) -> Self {
        Self {
            client,
            limiter,
            base_url: base_url.trim_end_matches('/').to_string(),
            email,
        }
    }

    async fn search_ids(&self, term: &str, limit: usize) -> Result<Vec<String>, SourceError> {
        self.limiter.acquire(self.name()).await;
        let url = format!("{}/esearch.fcgi", self.base_url);
        let retmax = limit.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("db", "pubmed"),
                ("term", term),
                ("retmax", retmax.as_str()),
                ("retmode", "json"),
                ("email", self.email.as_str()),
                ("sort", "relevance"),
            ])
            .send()
            .await?;
        let body: ESearchResponse = check_status(resp).await?.json().await?;
        Ok(body.esearchresult.idlist)
    }

    async fn fetch_details(&self, ids: &[String]) -> Result<String, SourceError> {
        self.limiter.acquire(self.name()).await;
        let url = format!("{}/efetch.fcgi", self.base_url);
        let id = ids.join(",");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("db", "pubmed"),
                ("id", id.as_str()),
                ("retmode", "xml"),
                ("email", self.email.as_str()),
            ])
            .timeout(REQUEST_TIMEOUT * 2)
            .send()
            .await?;
        Ok(check_status(resp).await?.text().await?)
    }
}

#[derive(Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

#[async_trait]
impl PaperSource for PubMedClient {
    fn name(&self) -> &str {
        "pubmed"
    }

    fn cache_query(&self, query: &str, filters: &SearchFilters) -> String {
        if filters.recent_only {
            format!("{}_recent", query)
        } else {
            query.to_string()
        }
    }

    fn apply_preset(&self, query: &str, preset: &QueryPreset, filters: &mut SearchFilters) -> Option<String> {
        match preset {
            QueryPreset::ClinicalTrials => Some(format!(
                "{} AND (Clinical Trial[PT] OR Randomized Controlled Trial[PT])",
                query
            )),
            QueryPreset::Reviews => Some(format!("{} AND (Review[PT] OR Systematic Review[PT])", query)),
            QueryPreset::Epilepsy => {
                filters.recent_only = true;
                Some(format!(
                    "{} AND (epilepsy[MeSH] OR seizure[MeSH] OR anticonvulsants[MeSH])",
                    query
                ))
            }
            _ => None,
        }
    }

    fn fetch_limit(&self, limit: usize) -> usize {
        (limit * 2).min(MAX_FETCH)
    }

    async fn fetch(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError> {
        let term = if filters.recent_only {
            format!("{}{}", query, RECENT_FILTER)
        } else {
            query.to_string()
        };

        let ids = self.search_ids(&term, limit).await?;
        if ids.is_empty() {
            tracing::info!("PubMed returned no ids");
            return Ok(Vec::new());
        }
        tracing::info!("PubMed found {} ids, fetching details", ids.len());

        let xml = self.fetch_details(&ids).await?;
        parse_efetch(&xml)
    }

    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64 {
        ranking::pubmed_score(paper, current_year)
    }
}

#[derive(Default)]
struct ArticleBuilder {
    pmid: String,
    title: String,
    abstract_parts: Vec<String>,
    journal: String,
    year: String,
    medline_date: String,
    authors: Vec<String>,
    last_name: String,
    fore_name: String,
    doi: Option<String>,
    pmc_id: Option<String>,
    id_type: Option<String>,
}

impl ArticleBuilder {
    fn finish(self) -> Option<Candidate> {
        let pmid = self.pmid.trim().to_string();
        if pmid.is_empty() {
            tracing::debug!("Skipping PubMed article without PMID");
            return None;
        }

        let year = self
            .year
            .trim()
            .parse::<i32>()
            .ok()
            .or_else(|| self.medline_date.trim().get(..4).and_then(|y| y.parse().ok()));

        let abstract_text = self
            .abstract_parts
            .iter()
            .filter_map(|p| clean_text(p))
            .collect::<Vec<_>>()
            .join(" ");

        Some(Candidate {
            title: clean_text(&self.title),
            authors: Some(self.authors),
            year: Some(year),
            doi: self.doi,
            abstract_text,
            citation_count: 0,
            journal: clean_text(&self.journal),
            is_open_access: self.pmc_id.is_some(),
            url: format!("https://pubmed.ncbi.nlm.nih.gov/{}/", pmid),
            source: Source::Pubmed,
            identifier: SourceId::Pmid(pmid),
            details: PaperDetails::Article { pmc_id: self.pmc_id },
        })
    }
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len() && path[path.len() - suffix.len()..].iter().zip(suffix).all(|(a, b)| a == b)
}

fn within(path: &[String], name: &str) -> bool {
    path.iter().any(|p| p == name)
}

/// Parse an efetch `PubmedArticleSet`. A syntax error keeps the articles
/// completed before it.
fn parse_efetch(xml: &str) -> Result<Vec<Candidate>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<ArticleBuilder> = None;
    let mut papers = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "PubmedArticle" => current = Some(ArticleBuilder::default()),
                    "Author" if ends_with(&path, &["AuthorList"]) => {
                        if let Some(article) = current.as_mut() {
                            article.last_name.clear();
                            article.fore_name.clear();
                        }
                    }
                    "AbstractText" if within(&path, "Abstract") => {
                        if let Some(article) = current.as_mut() {
                            article.abstract_parts.push(String::new());
                        }
                    }
                    "ArticleId" if ends_with(&path, &["PubmedData", "ArticleIdList"]) => {
                        if let Some(article) = current.as_mut() {
                            article.id_type = e
                                .attributes()
                                .flatten()
                                .find(|a| a.key.as_ref() == b"IdType")
                                .map(|a| String::from_utf8_lossy(&a.value).to_string());
                        }
                    }
                    _ => {}
                }
                path.push(tag);
            }
            Ok(Event::Text(e)) => {
                if let Some(article) = current.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();

                    if within(&path, "ArticleTitle") {
                        article.title.push_str(&text);
                    } else if within(&path, "AbstractText") && within(&path, "Abstract") {
                        if let Some(part) = article.abstract_parts.last_mut() {
                            part.push_str(&text);
                        }
                    } else if ends_with(&path, &["MedlineCitation", "PMID"]) && article.pmid.is_empty() {
                        article.pmid = text;
                    } else if ends_with(&path, &["Journal", "Title"]) {
                        article.journal.push_str(&text);
                    } else if ends_with(&path, &["PubDate", "Year"]) && within(&path, "Journal") {
                        article.year.push_str(&text);
                    } else if ends_with(&path, &["PubDate", "MedlineDate"]) && within(&path, "Journal") {
                        article.medline_date.push_str(&text);
                    } else if ends_with(&path, &["AuthorList", "Author", "LastName"]) {
                        article.last_name.push_str(&text);
                    } else if ends_with(&path, &["AuthorList", "Author", "ForeName"]) {
                        article.fore_name.push_str(&text);
                    } else if ends_with(&path, &["PubmedData", "ArticleIdList", "ArticleId"]) {
                        let value = text.trim().to_string();
                        match article.id_type.as_deref() {
                            Some("doi") if !value.is_empty() => article.doi = Some(value),
                            Some("pmc") if !value.is_empty() => article.pmc_id = Some(value),
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if path.last() == Some(&tag) {
                    path.pop();
                }
                match tag.as_str() {
                    "Author" if ends_with(&path, &["AuthorList"]) => {
                        if let Some(article) = current.as_mut() {
                            let last = article.last_name.trim();
                            let fore = article.fore_name.trim();
                            if !last.is_empty() {
                                let name = if fore.is_empty() {
                                    last.to_string()
                                } else {
                                    format!("{}, {}", last, fore)
                                };
                                article.authors.push(name);
                            }
                        }
                    }
                    "PubmedArticle" => {
                        if let Some(candidate) = current.take().and_then(ArticleBuilder::finish) {
                            papers.push(candidate);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) if !papers.is_empty() => {
                tracing::warn!("PubMed XML truncated after {} articles: {}", papers.len(), e);
                break;
            }
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_EFETCH: &str = r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE">
      <PMID Version="1">111</PMID>
      <Article>
        <Journal>
          <JournalIssue>
            <PubDate><Year>2023</Year><Month>Mar</Month></PubDate>
          </JournalIssue>
          <Title>Epilepsia</Title>
        </Journal>
        <ArticleTitle>Thalamic <i>DBS</i> for drug-resistant epilepsy</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">Background text.</AbstractText>
          <AbstractText Label="RESULTS">Results &amp; more.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Cash</LastName><ForeName>Sydney S</ForeName></Author>
          <Author><LastName>Solo</LastName></Author>
          <Author><CollectiveName>Study Group</CollectiveName></Author>
        </AuthorList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections><PMID Version="1">999</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">111</ArticleId>
        <ArticleId IdType="doi">10.1111/epi.1</ArticleId>
        <ArticleId IdType="pmc">PMC123</ArticleId>
      </ArticleIdList>
      <ReferenceList>
        <Reference>
          <ArticleIdList><ArticleId IdType="doi">10.9999/ref</ArticleId></ArticleIdList>
        </Reference>
      </ReferenceList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">222</PMID>
      <Article>
        <Journal>
          <JournalIssue><PubDate><MedlineDate>2019 Nov-Dec</MedlineDate></PubDate></JournalIssue>
          <Title>Brain</Title>
        </Journal>
        <ArticleTitle>Hippocampal recordings</ArticleTitle>
      </Article>
    </MedlineCitation>
    <PubmedData><ArticleIdList><ArticleId IdType="pubmed">222</ArticleId></ArticleIdList></PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_efetch() {
        let papers = parse_efetch(SAMPLE_EFETCH).unwrap();
        assert_eq!(papers.len(), 2);

        let p = papers[0].clone().validate(2025).unwrap();
        assert_eq!(p.title, "Thalamic DBS for drug-resistant epilepsy");
        assert_eq!(p.authors, vec!["Cash, Sydney S".to_string(), "Solo".to_string()]);
        assert_eq!(p.abstract_text, "Background text. Results & more.");
        assert_eq!(p.journal.as_deref(), Some("Epilepsia"));
        assert_eq!(p.year, Some(2023));
        assert_eq!(p.doi.as_deref(), Some("10.1111/epi.1"));
        assert!(p.is_open_access);
        assert_eq!(p.identifier, SourceId::Pmid("111".into()));
        assert_eq!(p.url, "https://pubmed.ncbi.nlm.nih.gov/111/");
        assert_eq!(p.details, PaperDetails::Article { pmc_id: Some("PMC123".into()) });

        let p = papers[1].clone().validate(2025).unwrap();
        assert_eq!(p.year, Some(2019));
        assert!(p.authors.is_empty());
        assert_eq!(p.doi, None);
        assert!(!p.is_open_access);
    }

    #[test]
    fn test_truncated_xml_keeps_completed_articles() {
        let cut = SAMPLE_EFETCH.find("<PMID Version=\"1\">222").unwrap();
        let truncated = format!("{}</Oops>", &SAMPLE_EFETCH[..cut]);
        let papers = parse_efetch(&truncated).unwrap();
        assert_eq!(papers.len(), 1);
    }

    #[test]
    fn test_presets() {
        let client = PubMedClient::new(reqwest::Client::new(), Arc::new(RateLimiter::default()), "x@y.z".into());
        let mut filters = SearchFilters::default();

        let q = client.apply_preset("thalamus", &QueryPreset::Reviews, &mut filters).unwrap();
        assert_eq!(q, "thalamus AND (Review[PT] OR Systematic Review[PT])");
        assert!(!filters.recent_only);

        let q = client.apply_preset("DBS", &QueryPreset::Epilepsy, &mut filters).unwrap();
        assert!(q.contains("epilepsy[MeSH]"));
        assert!(filters.recent_only);
        assert_eq!(client.cache_query("DBS", &filters), "DBS_recent");

        assert!(client.apply_preset("x", &QueryPreset::Author, &mut filters).is_none());
        assert_eq!(client.fetch_limit(10), 20);
        assert_eq!(client.fetch_limit(80), 100);
    }

    #[tokio::test]
    async fn test_two_phase_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("db", "pubmed"))
            .and(query_param("term", "thalamus AND (\"last 5 years\"[PDat])"))
            .and(query_param("retmode", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"count": "2", "idlist": ["111", "222"]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .and(query_param("id", "111,222"))
            .and(query_param("retmode", "xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_EFETCH))
            .expect(1)
            .mount(&server)
            .await;

        let client = PubMedClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            "x@y.z".into(),
            &server.uri(),
        );
        let filters = SearchFilters {
            recent_only: true,
            ..Default::default()
        };
        let candidates = client.fetch("thalamus", 20, &filters).await.unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_id_list_skips_detail_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"idlist": []}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = PubMedClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            "x@y.z".into(),
            &server.uri(),
        );
        assert!(client.fetch("nothing", 10, &SearchFilters::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = PubMedClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            "x@y.z".into(),
            &server.uri(),
        );
        let err = client.fetch("q", 10, &SearchFilters::default()).await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 503, .. }));
    }
}
