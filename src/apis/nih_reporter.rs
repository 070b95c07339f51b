use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{
    check_status, clean_text, format_location, meets_min_funding, Candidate, GrantInfo, NormalizedPaper,
    PaperDetails, PaperSource, SearchFilters, Source, SourceError, SourceId,
};
use crate::ranking;
use crate::ratelimit::RateLimiter;

const BASE_URL: &str = "https://api.reporter.nih.gov/v2";
const MAX_LIMIT: usize = 500;

const INCLUDE_FIELDS: &[&str] = &[
    "ProjectNum",
    "ProjectTitle",
    "ContactPiName",
    "OrgName",
    "OrgCity",
    "OrgState",
    "OrgCountry",
    "ProjectStartDate",
    "ProjectEndDate",
    "AbstractText",
    "AwardAmount",
    "FiscalYear",
    "AgencyIcFundings",
    "ProjectNumSplit",
    "FullStudySection",
    "PhrText",
];

pub struct NihReporterClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl NihReporterClient {
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
}

/// The five most recent fiscal years, oldest first.
fn recent_fiscal_years(current_year: i32) -> Vec<i32> {
    (current_year - 4..=current_year).collect()
}

fn build_payload(query: &str, limit: usize, filters: &SearchFilters, current_year: i32) -> serde_json::Value {
    let mut criteria = json!({
        "advanced_text_search": {
            "search_field": "terms",
            "search_text": query,
        }
    });
    if filters.recent_only {
        criteria["fiscal_years"] = json!(recent_fiscal_years(current_year));
    }
    if filters.include_active {
        criteria["include_active_projects"] = json!(true);
    }

    json!({
        "criteria": criteria,
        "offset": 0,
        "limit": limit.min(MAX_LIMIT),
        "sort_field": "project_start_date",
        "sort_order": "desc",
        "include_fields": INCLUDE_FIELDS,
    })
}

/// Human-readable project type from an NIH activity code.
pub fn classify_project_type(activity_code: &str) -> String {
    let code = activity_code.trim().to_uppercase();
    if code.is_empty() {
        return "Unknown".to_string();
    }
    let kind = match code.chars().next() {
        Some('R') => match code.as_str() {
            "R01" | "R37" => "Research Project Grant",
            "R21" => "Exploratory/Developmental Research Grant",
            "R03" => "Small Research Grant",
            "R15" => "Academic Research Enhancement Award",
            _ => "Research Grant",
        },
        Some('P') => match code.as_str() {
            "P01" => "Research Program Project",
            "P50" | "P30" => "Center Grant",
            _ => "Program Project/Center",
        },
        Some('K') => "Career Development Award",
        Some('T') => "Training Grant",
        Some('F') => "Fellowship",
        Some('U') => "Cooperative Agreement",
        _ => return format!("Other ({})", activity_code.trim()),
    };
    kind.to_string()
}

#[derive(Deserialize)]
struct ProjectsResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Default, Deserialize)]
struct Organization {
    org_name: Option<String>,
    org_city: Option<String>,
    org_state: Option<String>,
    org_country: Option<String>,
}

#[derive(Deserialize)]
struct IcFunding {
    code: Option<String>,
}

#[derive(Deserialize)]
struct ProjectNumSplit {
    activity_code: Option<String>,
}

#[derive(Deserialize)]
struct StudySection {
    name: Option<String>,
}

#[derive(Deserialize)]
struct Project {
    project_num: Option<String>,
    project_title: Option<String>,
    contact_pi_name: Option<String>,
    // Older responses flatten the organization fields.
    #[serde(flatten)]
    flat_org: Organization,
    organization: Option<Organization>,
    project_start_date: Option<String>,
    project_end_date: Option<String>,
    abstract_text: Option<String>,
    phr_text: Option<String>,
    award_amount: Option<f64>,
    fiscal_year: Option<i32>,
    agency_ic_fundings: Option<Vec<IcFunding>>,
    project_num_split: Option<ProjectNumSplit>,
    full_study_section: Option<StudySection>,
}

fn pick(primary: Option<String>, fallback: Option<String>) -> Option<String> {
    primary
        .and_then(|s| clean_text(&s))
        .or_else(|| fallback.and_then(|s| clean_text(&s)))
}

impl Project {
    fn into_candidate(self) -> Candidate {
        let org = self.organization.unwrap_or_default();
        let institution = pick(org.org_name, self.flat_org.org_name);
        let city = pick(org.org_city, self.flat_org.org_city);
        let state = pick(org.org_state, self.flat_org.org_state);
        let country = pick(org.org_country, self.flat_org.org_country);

        let project_num = self.project_num.as_deref().and_then(clean_text).unwrap_or_default();
        let start_date = self.project_start_date.as_deref().and_then(clean_text);
        let year = start_date.as_deref().and_then(|d| d.get(..4)).and_then(|y| y.parse().ok());
        let abstract_text = pick(self.abstract_text, self.phr_text).unwrap_or_default();
        let pi_name = self.contact_pi_name.as_deref().and_then(clean_text);
        let activity_code = self
            .project_num_split
            .and_then(|s| s.activity_code)
            .and_then(|c| clean_text(&c));
        let agencies = self
            .agency_ic_fundings
            .unwrap_or_default()
            .into_iter()
            .filter_map(|f| f.code.and_then(|c| clean_text(&c)))
            .collect();

        let grant = GrantInfo {
            pi_name: pi_name.clone().unwrap_or_else(|| "Unknown PI".to_string()),
            co_pis: Vec::new(),
            institution: institution.unwrap_or_else(|| "Unknown Institution".to_string()),
            location: format_location(city.as_deref(), state.as_deref(), country.as_deref()),
            start_date,
            end_date: self.project_end_date.as_deref().and_then(clean_text),
            award_amount: self.award_amount.unwrap_or(0.0),
            agencies,
            fiscal_year: self.fiscal_year.or(year),
            project_type: Some(classify_project_type(activity_code.as_deref().unwrap_or_default())),
            activity_code,
            study_section: self.full_study_section.and_then(|s| s.name).and_then(|n| clean_text(&n)),
            program: None,
            pi_email: None,
        };

        Candidate {
            title: self.project_title.as_deref().and_then(clean_text),
            authors: Some(pi_name.into_iter().collect()),
            year: Some(year),
            doi: None,
            abstract_text,
            citation_count: 0,
            journal: Some("NIH RePORTER".to_string()),
            is_open_access: false,
            url: format!("https://reporter.nih.gov/project-details/{}", project_num.replace(' ', "")),
            source: Source::NihReporter,
            identifier: SourceId::ProjectNumber(project_num),
            details: PaperDetails::Grant(grant),
        }
    }
}

fn parse_projects(resp: ProjectsResponse) -> Vec<Candidate> {
    resp.results
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Project>(value) {
            Ok(project) => Some(project.into_candidate()),
            Err(e) => {
                tracing::debug!("Skipping malformed NIH project: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl PaperSource for NihReporterClient {
    fn name(&self) -> &str {
        "nih_reporter"
    }

    fn cache_query(&self, query: &str, filters: &SearchFilters) -> String {
        let mut key = if filters.recent_only {
            let years = recent_fiscal_years(filters.current_year());
            format!("{}_fy{}-{}", query, years[0], years[years.len() - 1])
        } else {
            query.to_string()
        };
        key.push_str(&format!("_active{}", filters.include_active));
        if let Some(min) = filters.min_funding {
            key.push_str(&format!("_minfund{}", min));
        }
        key
    }

    fn fetch_limit(&self, limit: usize) -> usize {
        (limit * 2).min(MAX_LIMIT)
    }

    async fn fetch(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<Candidate>, SourceError> {
        let url = format!("{}/projects/search", self.base_url);
        let payload = build_payload(query, limit, filters, filters.current_year());

        self.limiter.acquire(self.name()).await;
        let resp = self.client.post(&url).json(&payload).send().await?;
        let resp: ProjectsResponse = check_status(resp).await?.json().await?;

        let mut projects = parse_projects(resp);
        projects.retain(|p| meets_min_funding(p, filters.min_funding));
        Ok(projects)
    }

    fn score(&self, paper: &NormalizedPaper, current_year: i32) -> f64 {
        ranking::nih_score(paper, current_year)
    }
}
