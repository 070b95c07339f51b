use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    check_status, clean_text, format_location, meets_min_funding, string_or_number, Candidate, GrantInfo,
    NormalizedPaper, PaperDetails, PaperSource, SearchFilters, Source, SourceError, SourceId,
};
use crate::ranking;
use crate::ratelimit::RateLimiter;

const BASE_URL: &str = "https://api.nsf.gov/services/v1";
/// Page size the Awards API allows.
const PAGE_SIZE: usize = 25;
/// Offsets past this return nothing.
const MAX_OFFSET: usize = 3000;
const MAX_FETCH: usize = 100;

const PRINT_FIELDS: &str = "id,agency,title,pdPIName,piEmail,piFirstName,piLastName,coPDPI,awardeeName,awardeeCity,awardeeStateCode,awardeeCountryCode,date,startDate,expDate,estimatedTotalAmt,fundsObligatedAmt,abstractText,fundProgramName,publicationResearch";

pub struct NsfClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl NsfClient {
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

    async fn fetch_page(
        &self,
        query: &str,
        rpp: usize,
        offset: usize,
        start_date: Option<&str>,
    ) -> Result<Vec<Award>, SourceError> {
        let url = format!("{}/awards.json", self.base_url);
        let rpp = rpp.to_string();
        let offset = offset.to_string();
        let mut params = vec![
            ("keyword", query),
            ("rpp", rpp.as_str()),
            ("offset", offset.as_str()),
            ("printFields", PRINT_FIELDS),
        ];
        if let Some(start) = start_date {
            params.push(("startDateStart", start));
        }

        self.limiter.acquire(self.name()).await;
        let resp = self.client.get(&url).query(&params).send().await?;
        let body: AwardsResponse = check_status(resp).await?.json().await?;
        Ok(body.response.award.into_vec())
    }
}

/// `01/01/<year-4>`, the Awards API date format.
fn recent_start_date(current_year: i32) -> String {
    format!("01/01/{}", current_year - 4)
}

#[derive(Deserialize)]
struct AwardsResponse {
    #[serde(default)]
    response: AwardsBody,
}

#[derive(Default, Deserialize)]
struct AwardsBody {
    #[serde(default)]
    award: OneOrMany<serde_json::Value>,
}

/// The API returns a bare object when there is exactly one match.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

type Award = serde_json::Value;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwardRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    id: Option<String>,
    agency: Option<String>,
    title: Option<String>,
    #[serde(rename = "pdPIName")]
    pd_pi_name: Option<String>,
    pi_email: Option<String>,
    pi_first_name: Option<String>,
    pi_last_name: Option<String>,
    #[serde(rename = "coPDPI", default)]
    co_pdpi: Option<OneOrMany<String>>,
    awardee_name: Option<String>,
    awardee_city: Option<String>,
    awardee_state_code: Option<String>,
    awardee_country_code: Option<String>,
    date: Option<String>,
    start_date: Option<String>,
    exp_date: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    estimated_total_amt: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    funds_obligated_amt: Option<String>,
    abstract_text: Option<String>,
    #[serde(default)]
    fund_program_name: Option<OneOrMany<String>>,
}

/// Estimated total first, then obligated amount, else zero.
fn parse_funding(estimated: Option<&str>, obligated: Option<&str>) -> f64 {
    let parse = |s: Option<&str>| s.and_then(|v| v.trim().parse::<f64>().ok());
    parse(estimated).or_else(|| parse(obligated)).unwrap_or(0.0)
}

/// `MM/DD/YYYY` -> `YYYY`.
fn year_from_us_date(date: &str) -> Option<i32> {
    date.trim().rsplit('/').next().and_then(|y| y.parse().ok())
}

impl AwardRecord {
    fn into_candidate(self) -> Candidate {
        let award_id = self.id.as_deref().and_then(clean_text).unwrap_or_default();
        let first = self.pi_first_name.as_deref().and_then(clean_text);
        let last = self.pi_last_name.as_deref().and_then(clean_text);
        let pi_name = match (first, last) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            _ => self.pd_pi_name.as_deref().and_then(clean_text),
        };
        let start_date = self.start_date.as_deref().and_then(clean_text);
        let year = start_date.as_deref().and_then(year_from_us_date);
        let program = self
            .fund_program_name
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| clean_text(p))
            .collect::<Vec<_>>()
            .join("; ");

        let grant = GrantInfo {
            pi_name: pi_name.clone().unwrap_or_else(|| "Unknown PI".to_string()),
            co_pis: self
                .co_pdpi
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .iter()
                .filter_map(|c| clean_text(c))
                .collect(),
            institution: self
                .awardee_name
                .as_deref()
                .and_then(clean_text)
                .unwrap_or_else(|| "Unknown Institution".to_string()),
            location: format_location(
                self.awardee_city.as_deref().map(str::trim),
                self.awardee_state_code.as_deref().map(str::trim),
                self.awardee_country_code.as_deref().map(str::trim),
            ),
            start_date,
            end_date: self.exp_date.as_deref().and_then(clean_text),
            award_amount: parse_funding(self.estimated_total_amt.as_deref(), self.funds_obligated_amt.as_deref()),
            agencies: self.agency.as_deref().and_then(clean_text).into_iter().collect(),
            fiscal_year: self.date.as_deref().and_then(year_from_us_date),
            activity_code: None,
            project_type: None,
            study_section: None,
            program: (!program.is_empty()).then_some(program),
            pi_email: self.pi_email.as_deref().and_then(clean_text),
        };

        Candidate {
            title: self.title.as_deref().and_then(clean_text),
            authors: Some(pi_name.into_iter().collect()),
            year: Some(year),
            doi: None,
            abstract_text: self.abstract_text.unwrap_or_default(),
            citation_count: 0,
            journal: Some("NSF Awards".to_string()),
            is_open_access: false,
            url: format!("https://www.nsf.gov/awardsearch/showAward?AWD_ID={}", award_id),
            source: Source::Nsf,
            identifier: SourceId::AwardNumber(award_id),
            details: PaperDetails::Grant(grant),
        }
    }
}

fn parse_awards(awards: Vec<Award>) -> Vec<Candidate> {
    awards
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<AwardRecord>(value) {
            Ok(record) => Some(record.into_candidate()),
            Err(e) => {
                tracing::debug!("Skipping malformed NSF award: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl PaperSource for NsfClient {
    fn name(&self) -> &str {
        "nsf"
    }

    fn cache_query(&self, query: &str, filters: &SearchFilters) -> String {
        let min = filters
            .min_funding
            .map_or_else(|| "none".to_string(), |m| m.to_string());
        format!("{}_recent{}_minfund{}", query, filters.recent_only, min)
    }

    fn fetch_limit(&self, limit: usize) -> usize {
        (limit * 2).min(MAX_FETCH)
    }

    async fn fetch(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError> {
        let start_date = filters.recent_only.then(|| recent_start_date(filters.current_year()));
        let mut awards = Vec::new();
        // 1-based
        let mut offset = 1;

        while awards.len() < limit && offset <= MAX_OFFSET {
            let rpp = PAGE_SIZE.min(limit - awards.len());
            let page = match self.fetch_page(query, rpp, offset, start_date.as_deref()).await {
                Ok(page) => page,
                Err(e) if !awards.is_empty() => {
                    tracing::warn!("NSF pagination stopped at offset {}: {}", offset, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            let page_len = page.len();
            if page_len == 0 {
                break;
            }
            awards.extend(parse_awards(page));
            tracing::debug!("NSF offset {}: {} awards (total {})", offset, page_len, awards.len());
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        awards.retain(|a| meets_min_funding(a, filters.min_funding));
        Ok(awards)
    }

    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64 {
        ranking::nsf_score(paper, current_year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn award(id: usize) -> serde_json::Value {
        json!({
            "id": id.to_string(),
            "agency": "NSF",
            "title": format!("Award {}", id),
            "pdPIName": "Jane Doe",
            "awardeeName": "State University",
            "awardeeCity": "Austin",
            "awardeeStateCode": "TX",
            "awardeeCountryCode": "US",
            "date": "08/01/2023",
            "startDate": "09/01/2023",
            "expDate": "08/31/2026",
            "estimatedTotalAmt": "500000",
            "fundProgramName": "Computational Neuroscience"
        })
    }

    fn client(uri: &str) -> NsfClient {
        NsfClient::with_base_url(reqwest::Client::new(), Arc::new(RateLimiter::new(Duration::ZERO)), uri)
    }

    #[test]
    fn test_parse_award_fields() {
        let record = json!({
            "id": 2112345,
            "agency": "NSF",
            "title": "Collaborative Research: Neural manifolds",
            "pdPIName": "Doe, Jane",
            "piFirstName": "Jane",
            "piLastName": "Doe",
            "piEmail": "jane@example.edu",
            "coPDPI": "John Roe",
            "awardeeName": "Institute",
            "awardeeCity": "Zurich",
            "awardeeCountryCode": "CH",
            "startDate": "07/15/2022",
            "estimatedTotalAmt": "not-a-number",
            "fundsObligatedAmt": 120000.5,
            "fundProgramName": ["Neural Systems", "Physics of Living Systems"]
        });
        let candidates = parse_awards(vec![record]);
        let p = candidates[0].clone().validate(2025).unwrap();
        assert_eq!(p.authors, vec!["Jane Doe".to_string()]);
        assert_eq!(p.year, Some(2022));
        assert_eq!(p.identifier, SourceId::AwardNumber("2112345".into()));
        assert_eq!(p.url, "https://www.nsf.gov/awardsearch/showAward?AWD_ID=2112345");

        let grant = p.details.grant().unwrap();
        assert_eq!(grant.co_pis, vec!["John Roe".to_string()]);
        assert_eq!(grant.award_amount, 120000.5);
        assert_eq!(grant.location, "Zurich, CH");
        assert_eq!(grant.program.as_deref(), Some("Neural Systems; Physics of Living Systems"));
        assert_eq!(grant.pi_email.as_deref(), Some("jane@example.edu"));
    }

    #[test]
    fn test_funding_fallback() {
        assert_eq!(parse_funding(Some("250000"), Some("1")), 250000.0);
        assert_eq!(parse_funding(None, Some("1000")), 1000.0);
        assert_eq!(parse_funding(Some(""), None), 0.0);
    }

    #[test]
    fn test_single_award_object() {
        let body: AwardsResponse = serde_json::from_value(json!({"response": {"award": award(7)}})).unwrap();
        assert_eq!(body.response.award.into_vec().len(), 1);
        let empty: AwardsResponse = serde_json::from_value(json!({"response": {}})).unwrap();
        assert!(empty.response.award.into_vec().is_empty());
    }

    #[test]
    fn test_cache_query() {
        let c = client("http://localhost");
        assert_eq!(c.cache_query("eeg", &SearchFilters::default()), "eeg_recentfalse_minfundnone");
        let filters = SearchFilters {
            recent_only: true,
            min_funding: Some(1e6),
            ..Default::default()
        };
        assert_eq!(c.cache_query("eeg", &filters), "eeg_recenttrue_minfund1000000");
        assert_eq!(recent_start_date(2025), "01/01/2021");
    }

    #[tokio::test]
    async fn test_pagination() {
        let server = MockServer::start().await;
        let first: Vec<_> = (1..=25).map(award).collect();
        let second: Vec<_> = (26..=30).map(award).collect();
        Mock::given(method("GET"))
            .and(path("/awards.json"))
            .and(query_param("offset", "1"))
            .and(query_param("rpp", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": {"award": first}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/awards.json"))
            .and(query_param("offset", "26"))
            .and(query_param("rpp", "15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": {"award": second}})))
            .expect(1)
            .mount(&server)
            .await;

        let awards = client(&server.uri()).fetch("neural", 40, &SearchFilters::default()).await.unwrap();
        assert_eq!(awards.len(), 30);
    }

    #[tokio::test]
    async fn test_min_funding_and_recent_filter() {
        let server = MockServer::start().await;
        let mut cheap = award(2);
        cheap["estimatedTotalAmt"] = json!("10000");
        Mock::given(method("GET"))
            .and(path("/awards.json"))
            .and(query_param("startDateStart", "01/01/2020"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": {"award": [award(1), cheap]}})))
            .expect(1)
            .mount(&server)
            .await;

        let filters = SearchFilters {
            recent_only: true,
            min_funding: Some(100000.0),
            as_of: NaiveDate::from_ymd_opt(2024, 3, 15),
            ..Default::default()
        };
        let awards = client(&server.uri()).fetch("neural", 10, &filters).await.unwrap();
        assert_eq!(awards.len(), 1);
        assert_eq!(awards[0].identifier, SourceId::AwardNumber("1".into()));
    }
}
