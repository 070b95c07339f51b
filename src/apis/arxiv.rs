use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{
    check_status, clean_text, Candidate, NormalizedPaper, PaperDetails, PaperSource, QueryPreset,
    SearchFilters, Source, SourceError, SourceId,
};
use crate::ranking;
use crate::ratelimit::RateLimiter;

const BASE_URL: &str = "https://export.arxiv.org/api/query";
const MAX_FETCH: usize = 50;

/// Categories searched by default and boosted when ranking.
pub const RELEVANT_CATEGORIES: &[&str] = &[
    "q-bio.NC",
    "eess.SP",
    "cs.LG",
    "cs.NE",
    "nlin.CD",
    "math.DS",
    "physics.comp-ph",
    "stat.ML",
    "physics.med-ph",
    "cs.AI",
    "math.NA",
    "physics.bio-ph",
];

pub struct ArxivClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl ArxivClient {
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self::with_base_url(client, limiter, BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, limiter: Arc<RateLimiter>, base_url: &str) -> Self {
        Self {
            client,
            limiter,
            base_url: base_url.to_string(),
        }
    }
}

fn filter_categories(filters: &SearchFilters) -> bool {
    filters.filter_categories.unwrap_or(true)
}

/// `(query) AND (cat:A OR cat:B ...)` when filtering, otherwise the query as-is.
fn build_search_query(query: &str, filtered: bool) -> String {
    if !filtered {
        return query.to_string();
    }
    let cats = RELEVANT_CATEGORIES
        .iter()
        .map(|c| format!("cat:{}", c))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("({}) AND ({})", query, cats)
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn name(&self) -> &str {
        "arxiv"
    }

    fn cache_query(&self, query: &str, filters: &SearchFilters) -> String {
        if filter_categories(filters) {
            format!("{}_filtered", query)
        } else {
            query.to_string()
        }
    }

    fn apply_preset(&self, query: &str, preset: &QueryPreset, filters: &mut SearchFilters) -> Option<String> {
        match preset {
            QueryPreset::Author => {
                filters.filter_categories = Some(false);
                Some(format!("au:\"{}\"", query.trim()))
            }
            QueryPreset::Category(category) => {
                filters.filter_categories = Some(false);
                let query = query.trim();
                if query.is_empty() {
                    Some(format!("cat:{}", category))
                } else {
                    Some(format!("{} AND cat:{}", query, category))
                }
            }
            _ => None,
        }
    }

    fn fetch_limit(&self, limit: usize) -> usize {
        (limit * 2).min(MAX_FETCH)
    }

    async fn fetch(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError> {
        let search_query = build_search_query(query, filter_categories(filters));
        let max_results = limit.to_string();

        self.limiter.acquire(self.name()).await;
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", search_query.as_str()),
                ("start", "0"),
                ("max_results", max_results.as_str()),
                ("sortBy", "relevance"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        parse_atom_feed(&body)
    }

    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64 {
        ranking::arxiv_score(paper, current_year, RELEVANT_CATEGORIES)
    }
}

#[derive(Default)]
struct EntryBuilder {
    id: String,
    title: String,
    summary: String,
    published: String,
    updated: String,
    authors: Vec<String>,
    author_name: String,
    link_abs: String,
    link_pdf: String,
    doi: String,
    categories: Vec<String>,
}

impl EntryBuilder {
    fn link(&mut self, e: &BytesStart) {
        let mut href = String::new();
        let mut title_attr = String::new();
        for attr in e.attributes().flatten() {
            let val = String::from_utf8_lossy(&attr.value).to_string();
            match attr.key.as_ref() {
                b"href" => href = val,
                b"title" => title_attr = val,
                _ => {}
            }
        }
        if title_attr == "pdf" {
            self.link_pdf = href;
        } else if self.link_abs.is_empty() && href.contains("/abs/") {
            self.link_abs = href;
        }
    }

    fn category(&mut self, e: &BytesStart) {
        if let Some(term) = e
            .attributes()
            .flatten()
            .find(|a| a.key.as_ref() == b"term")
            .map(|a| String::from_utf8_lossy(&a.value).to_string())
        {
            if !self.categories.contains(&term) {
                self.categories.push(term);
            }
        }
    }

    fn finish(self) -> Option<Candidate> {
        // http://arxiv.org/abs/2301.12345v1 -> 2301.12345v1
        let arxiv_id = self.id.trim().rsplit('/').next().unwrap_or_default().to_string();
        if arxiv_id.is_empty() {
            return None;
        }

        let published = clean_text(&self.published);
        let year = published.as_deref().and_then(|p| p.get(..4)).and_then(|y| y.parse().ok());
        let url = if self.link_abs.is_empty() {
            self.id.trim().to_string()
        } else {
            self.link_abs
        };

        Some(Candidate {
            title: clean_text(&self.title),
            authors: Some(self.authors),
            year: Some(year),
            doi: clean_text(&self.doi),
            abstract_text: clean_text(&self.summary).unwrap_or_default(),
            citation_count: 0,
            journal: Some("arXiv preprint".to_string()),
            is_open_access: true,
            url,
            source: Source::Arxiv,
            identifier: SourceId::ArxivId(arxiv_id),
            details: PaperDetails::Preprint {
                categories: self.categories,
                published,
                updated: clean_text(&self.updated),
                version: None,
                pdf_url: clean_text(&self.link_pdf),
            },
        })
    }
}

fn parse_atom_feed(xml: &str) -> Result<Vec<Candidate>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut current_tag = String::new();
    let mut in_author = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    entry = Some(EntryBuilder::default());
                } else if let Some(current) = entry.as_mut() {
                    match tag.as_str() {
                        "author" => {
                            in_author = true;
                            current.author_name.clear();
                        }
                        "link" => current.link(&e),
                        "category" => current.category(&e),
                        _ => {}
                    }
                    current_tag = tag;
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(current) = entry.as_mut() {
                    match e.name().as_ref() {
                        b"link" => current.link(&e),
                        b"category" => current.category(&e),
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(current) = entry.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "title" => current.title.push_str(&text),
                        "summary" => current.summary.push_str(&text),
                        "id" if current.id.is_empty() => current.id = text,
                        "published" => current.published.push_str(&text),
                        "updated" => current.updated.push_str(&text),
                        "name" if in_author => current.author_name.push_str(&text),
                        "arxiv:doi" => current.doi.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    if let Some(candidate) = entry.take().and_then(EntryBuilder::finish) {
                        papers.push(candidate);
                    }
                } else if tag == "author" && in_author {
                    in_author = false;
                    if let Some(current) = entry.as_mut() {
                        if let Some(name) = clean_text(&current.author_name) {
                            current.authors.push(name);
                        }
                    }
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) if !papers.is_empty() => {
                tracing::warn!("arXiv feed truncated after {} entries: {}", papers.len(), e);
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
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <entry>
    <id>http://arxiv.org/abs/2301.12345v2</id>
    <updated>2023-03-01T00:00:00Z</updated>
    <published>2023-01-15T00:00:00Z</published>
    <title>Koopman Operators for
      Seizure Forecasting</title>
    <summary>We learn linear embeddings of iEEG dynamics.</summary>
    <author><name>Jane Doe</name></author>
    <author><name>John Smith</name></author>
    <arxiv:doi>10.1000/koopman</arxiv:doi>
    <link href="http://arxiv.org/abs/2301.12345v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2301.12345v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="q-bio.NC" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2402.00001v1</id>
    <published>2024-02-01T00:00:00Z</published>
    <updated>2024-02-01T00:00:00Z</updated>
    <title>   </title>
    <summary>Untitled entries are dropped by validation.</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_atom_feed() {
        let candidates = parse_atom_feed(SAMPLE_ATOM).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[1].title.is_none());

        let p = candidates[0].clone().validate(2025).unwrap();
        assert_eq!(p.title, "Koopman Operators for Seizure Forecasting");
        assert_eq!(p.identifier, SourceId::ArxivId("2301.12345v2".into()));
        assert_eq!(p.authors, vec!["Jane Doe".to_string(), "John Smith".to_string()]);
        assert_eq!(p.year, Some(2023));
        assert_eq!(p.doi.as_deref(), Some("10.1000/koopman"));
        assert_eq!(p.journal.as_deref(), Some("arXiv preprint"));
        assert_eq!(p.citation_count, 0);
        assert!(p.is_open_access);
        assert_eq!(p.url, "http://arxiv.org/abs/2301.12345v2");
        match &p.details {
            PaperDetails::Preprint { categories, pdf_url, updated, .. } => {
                assert_eq!(categories, &vec!["cs.LG".to_string(), "q-bio.NC".to_string()]);
                assert_eq!(pdf_url.as_deref(), Some("http://arxiv.org/pdf/2301.12345v2"));
                assert_eq!(updated.as_deref(), Some("2023-03-01T00:00:00Z"));
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_query_construction() {
        let q = build_search_query("seizure prediction", true);
        assert!(q.starts_with("(seizure prediction) AND (cat:q-bio.NC OR cat:eess.SP"));
        assert_eq!(q.matches("cat:").count(), 12);
        assert_eq!(build_search_query("seizure prediction", false), "seizure prediction");
    }

    #[test]
    fn test_presets_disable_category_filter() {
        let client = ArxivClient::new(reqwest::Client::new(), Arc::new(RateLimiter::default()));
        let mut filters = SearchFilters::default();
        assert_eq!(client.cache_query("q", &filters), "q_filtered");

        let q = client.apply_preset("Steven Brunton", &QueryPreset::Author, &mut filters).unwrap();
        assert_eq!(q, "au:\"Steven Brunton\"");
        assert_eq!(client.cache_query("q", &filters), "q");

        let mut filters = SearchFilters::default();
        let q = client
            .apply_preset("", &QueryPreset::Category("q-bio.NC".into()), &mut filters)
            .unwrap();
        assert_eq!(q, "cat:q-bio.NC");
        let q = client
            .apply_preset("koopman", &QueryPreset::Category("math.DS".into()), &mut filters)
            .unwrap();
        assert_eq!(q, "koopman AND cat:math.DS");
        assert!(client.apply_preset("x", &QueryPreset::Reviews, &mut filters).is_none());
    }

    #[tokio::test]
    async fn test_fetch_sends_filtered_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("search_query", build_search_query("koopman", true)))
            .and(query_param("max_results", "20"))
            .and(query_param("sortBy", "relevance"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_ATOM))
            .expect(1)
            .mount(&server)
            .await;

        let client = ArxivClient::with_base_url(
            reqwest::Client::new(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            &server.uri(),
        );
        let candidates = client.fetch("koopman", 20, &SearchFilters::default()).await.unwrap();
        assert_eq!(candidates.len(), 2);
    }
}
