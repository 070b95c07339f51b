//! Impact ranking: journal tiers and the per-source score functions.
//!
//! Scores are sort keys only. They are attached to results after caching and
//! never persisted.

use chrono::DateTime;
use serde::Serialize;

use crate::apis::{NormalizedPaper, PaperDetails, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalTier {
    Tier1,
    Tier2,
    Tier3,
    Default,
}

impl JournalTier {
    pub fn multiplier(&self) -> f64 {
        match self {
            JournalTier::Tier1 => 3.0,
            JournalTier::Tier2 => 2.0,
            JournalTier::Tier3 => 1.5,
            JournalTier::Default => 1.0,
        }
    }
}

const TIER1: &[&str] = &[
    "Nature",
    "Science",
    "Nature Neuroscience",
    "Nature Communications",
    "Nature Computational Science",
    "Cell",
    "Neuron",
    "PNAS",
    "Nature Methods",
    "Nature Medicine",
    "Nature Biotechnology",
];

const TIER2: &[&str] = &[
    "Brain",
    "Epilepsia",
    "NeuroImage",
    "Journal of Neuroscience",
    "PLOS Computational Biology",
    "eLife",
    "Current Biology",
    "Annals of Neurology",
    "Neurology",
    "Brain Stimulation",
];

const TIER3: &[&str] = &[
    "Clinical Neurophysiology",
    "IEEE Transactions on Biomedical Engineering",
    "Journal of Neural Engineering",
    "Epilepsy Research",
    "Epilepsy & Behavior",
    "Scientific Reports",
    "PLOS ONE",
    "Frontiers in Neuroscience",
    "Journal of Neuroscience Methods",
];

/// Journals that double a PubMed record's score.
pub const PRIORITY_JOURNALS: &[&str] = &[
    "Epilepsia",
    "Epilepsy Research",
    "Epilepsy & Behavior",
    "Brain",
    "Neurology",
    "Annals of Neurology",
    "Journal of Neuroscience",
    "Nature Neuroscience",
    "Neuron",
    "Clinical Neurophysiology",
    "Journal of Neural Engineering",
    "NeuroImage",
];

/// NSF programs that earn a 1.3x boost.
pub const KEY_PROGRAMS: &[&str] = &[
    "Brain Research through Advancing Innovative Neurotechnologies (BRAIN)",
    "Cognitive Neuroscience",
    "Collaborative Research in Computational Neuroscience",
    "Computational Neuroscience",
    "Neural Systems",
    "Perception, Action & Cognition",
    "Physics of Living Systems",
    "Machine Learning",
    "Robust Intelligence",
    "Cyberinfrastructure",
];

const MAJOR_ACTIVITY_CODES: &[&str] = &["R01", "R37", "P01", "P50"];

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Tier of a journal by case-insensitive substring match. When several listed
/// names occur in the journal name, the longest one decides, so
/// "Journal of Neuroscience" is not mistaken for "Science".
///
/// This differs from a first-match scan in tier order, which would put
/// "Frontiers in Neuroscience" in tier 1 (via "Science") and
/// "Journal of Neuroscience Methods" in tier 2 (via "Journal of
/// Neuroscience"). Here both land in tier 3, where they are listed by full name.
pub fn journal_tier(journal: Option<&str>) -> JournalTier {
    let Some(journal) = journal.filter(|j| !j.trim().is_empty()) else {
        return JournalTier::Default;
    };

    [
        (JournalTier::Tier1, TIER1),
        (JournalTier::Tier2, TIER2),
        (JournalTier::Tier3, TIER3),
    ]
    .iter()
    .flat_map(|(tier, names)| names.iter().map(move |name| (*tier, *name)))
    .filter(|(_, name)| contains_ci(journal, name))
    .max_by_key(|(_, name)| name.len())
    .map(|(tier, _)| tier)
    .unwrap_or(JournalTier::Default)
}

fn year_at_least(year: Option<i32>, threshold: i32) -> bool {
    year.is_some_and(|y| y >= threshold)
}

/// citations x journal tier x recency (1.2 within 3 years, 1.1 within 5).
pub fn impact_score(paper: &NormalizedPaper, current_year: i32) -> f64 {
    let recency = match paper.year {
        Some(y) if y > current_year - 3 => 1.2,
        Some(y) if y > current_year - 5 => 1.1,
        _ => 1.0,
    };
    paper.citation_count as f64 * journal_tier(paper.journal.as_deref()).multiplier() * recency
}

pub fn pubmed_score(paper: &NormalizedPaper, current_year: i32) -> f64 {
    let mut score = 1.0;
    if let Some(journal) = paper.journal.as_deref() {
        if PRIORITY_JOURNALS.iter().any(|p| contains_ci(journal, p)) {
            score *= 2.0;
        }
    }
    if year_at_least(paper.year, current_year - 2) {
        score *= 1.5;
    } else if year_at_least(paper.year, current_year - 5) {
        score *= 1.2;
    }
    if paper.is_open_access {
        score *= 1.1;
    }
    score
}

fn updated_after_published(published: Option<&str>, updated: Option<&str>) -> bool {
    match (published, updated) {
        (Some(p), Some(u)) => match (DateTime::parse_from_rfc3339(p), DateTime::parse_from_rfc3339(u)) {
            (Ok(p), Ok(u)) => u > p,
            _ => u > p,
        },
        _ => false,
    }
}

pub fn arxiv_score(paper: &NormalizedPaper, current_year: i32, relevant_categories: &[&str]) -> f64 {
    let mut score = 1.0;
    let PaperDetails::Preprint {
        categories,
        published,
        updated,
        ..
    } = &paper.details
    else {
        return score;
    };

    if categories.iter().any(|c| relevant_categories.contains(&c.as_str())) {
        score *= 2.0;
    }
    if year_at_least(paper.year, current_year - 1) {
        score *= 2.0;
    } else if year_at_least(paper.year, current_year - 2) {
        score *= 1.5;
    } else if year_at_least(paper.year, current_year - 3) {
        score *= 1.2;
    }
    if updated_after_published(published.as_deref(), updated.as_deref()) {
        score *= 1.1;
    }
    score
}

pub fn preprint_score(paper: &NormalizedPaper, current_year: i32) -> f64 {
    let mut score = 1.0;
    match paper.year {
        Some(y) if y == current_year => score *= 2.0,
        Some(y) if y == current_year - 1 => score *= 1.5,
        _ => {}
    }

    let category = match &paper.details {
        PaperDetails::Preprint { categories, .. } => categories.join(" ").to_lowercase(),
        _ => String::new(),
    };
    if category.contains("neuroscience") {
        score *= 2.0;
    } else if category.contains("neurology") {
        score *= 1.8;
    } else if category.contains("biophysics") || category.contains("systems biology") {
        score *= 1.5;
    }

    if paper.source == Source::Medrxiv {
        score *= 1.2;
    }
    score
}

fn grant_base(paper: &NormalizedPaper, current_year: i32) -> f64 {
    let amount = paper.details.grant().map_or(0.0, |g| g.award_amount);
    let mut score = if amount > 0.0 { amount / 1_000_000.0 } else { 0.0 };
    if year_at_least(paper.year, current_year - 2) {
        score *= 1.5;
    } else if year_at_least(paper.year, current_year - 5) {
        score *= 1.2;
    }
    score
}

pub fn nih_score(paper: &NormalizedPaper, current_year: i32) -> f64 {
    let mut score = grant_base(paper, current_year);
    let Some(grant) = paper.details.grant() else {
        return score;
    };

    if grant
        .activity_code
        .as_deref()
        .is_some_and(|code| MAJOR_ACTIVITY_CODES.contains(&code))
    {
        score *= 1.3;
    }
    if grant.agencies.iter().any(|a| a == "NINDS") {
        score *= 1.4;
    } else if grant.agencies.iter().any(|a| ["NIMH", "NCI", "NHLBI"].contains(&a.as_str())) {
        score *= 1.2;
    }
    score
}

pub fn nsf_score(paper: &NormalizedPaper, current_year: i32) -> f64 {
    let mut score = grant_base(paper, current_year);
    let program = paper
        .details
        .grant()
        .and_then(|g| g.program.as_deref())
        .unwrap_or_default();
    if KEY_PROGRAMS.iter().any(|k| contains_ci(program, k)) {
        score *= 1.3;
    }
    score
}

/// Attach `impact_score` to each paper and sort descending. Ties keep input order.
pub fn rank_by<F>(mut papers: Vec<NormalizedPaper>, score: F) -> Vec<NormalizedPaper>
where
    F: Fn(&NormalizedPaper) -> f64,
{
    for paper in &mut papers {
        paper.impact_score = Some(score(paper));
    }
    papers.sort_by(|a, b| {
        b.impact_score
            .unwrap_or(0.0)
            .total_cmp(&a.impact_score.unwrap_or(0.0))
    });
    papers
}
