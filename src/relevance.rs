//! Keyword-weighted relevance scoring on a 0-100 scale.

use serde::Serialize;

/// Weighted total treated as a perfect match. Tuned against the default
/// category table; recompute if the weights change.
pub const NORMALIZER: f64 = 400.0;

/// Per-category contribution is capped at `weight * CATEGORY_CAP_FACTOR`.
const CATEGORY_CAP_FACTOR: u32 = 5;

/// Full-text occurrences counted per keyword, at most.
const FULL_TEXT_CAP: usize = 10;

const MAX_REASONS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct KeywordCategory {
    pub name: String,
    pub label: String,
    pub weight: u32,
    pub keywords: Vec<String>,
}

impl KeywordCategory {
    fn new(name: &str, label: &str, weight: u32, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            weight,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelevanceScore {
    pub score: u8,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    categories: Vec<KeywordCategory>,
    priority_phrases: Vec<String>,
}

impl RelevanceScorer {
    pub fn new(categories: Vec<KeywordCategory>, priority_phrases: Vec<String>) -> Self {
        Self {
            categories,
            priority_phrases,
        }
    }

    pub fn categories(&self) -> &[KeywordCategory] {
        &self.categories
    }

    /// Score a paper. Title hits count 3x, abstract 2x, full text 1x.
    pub fn score(&self, title: &str, abstract_text: &str, full_text: &str) -> RelevanceScore {
        let title = title.to_lowercase();
        let abstract_text = abstract_text.to_lowercase();
        let full_text = full_text.to_lowercase();

        let mut total: u32 = 0;
        let mut matched_categories = Vec::new();

        for category in &self.categories {
            let mut hits: u32 = 0;
            for keyword in &category.keywords {
                let kw = keyword.to_lowercase();
                let in_title = title.matches(kw.as_str()).count() * 3;
                let in_abstract = abstract_text.matches(kw.as_str()).count() * 2;
                let in_full = if full_text.is_empty() {
                    0
                } else {
                    full_text.matches(kw.as_str()).count().min(FULL_TEXT_CAP)
                };

                hits += (in_title + in_abstract + in_full) as u32;
            }

            if hits > 0 {
                total += (hits * category.weight).min(category.weight * CATEGORY_CAP_FACTOR);
                matched_categories.push(category);
            }
        }

        let score = ((total as f64 / NORMALIZER) * 100.0).round().min(100.0) as u8;
        let combined = format!("{} {} {}", title, abstract_text, full_text);
        let reasons = self.reasons(&matched_categories, &combined);

        tracing::debug!("Relevance score {} from {} categories", score, matched_categories.len());
        RelevanceScore { score, reasons }
    }

    fn reasons(&self, categories: &[&KeywordCategory], text: &str) -> Vec<String> {
        if categories.is_empty() {
            return vec!["No matches found".to_string()];
        }

        let mut reasons: Vec<String> = categories.iter().take(3).map(|c| c.label.clone()).collect();
        for phrase in &self.priority_phrases {
            if text.contains(&phrase.to_lowercase()) {
                reasons.push(format!("Contains '{}'", phrase));
            }
        }
        reasons.truncate(MAX_REASONS);
        reasons
    }
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        let categories = vec![
            KeywordCategory::new(
                "core",
                "Core epilepsy research",
                10,
                &[
                    "epilepsy", "seizure", "interictal", "ictal", "epileptiform",
                    "anticonvulsant", "antiepileptic", "temporal lobe epilepsy",
                ],
            ),
            KeywordCategory::new(
                "modality",
                "iEEG/ECoG recording",
                8,
                &[
                    "iEEG", "intracranial EEG", "sEEG", "stereo-EEG", "ECoG",
                    "electrocorticography", "depth electrode", "subdural",
                ],
            ),
            KeywordCategory::new(
                "regions",
                "Relevant brain regions",
                7,
                &[
                    "thalamus", "thalamic", "hippocampus", "hippocampal",
                    "anterior nucleus", "centromedian", "pulvinar",
                    "limbic system", "amygdala",
                ],
            ),
            KeywordCategory::new(
                "neuromodulation",
                "DBS/RNS neuromodulation",
                8,
                &[
                    "deep brain stimulation", "DBS", "responsive neurostimulation",
                    "RNS", "neuromodulation", "electrical stimulation",
                    "closed-loop", "adaptive stimulation",
                ],
            ),
            KeywordCategory::new(
                "biomarkers",
                "Biomarker development",
                7,
                &[
                    "biomarker", "seizure prediction", "seizure forecasting",
                    "brain state", "connectivity", "functional connectivity",
                    "high-frequency oscillation", "HFO",
                ],
            ),
            KeywordCategory::new(
                "methods",
                "ML/dynamical systems methods",
                6,
                &[
                    "machine learning", "deep learning", "neural network",
                    "foundation model", "transformer", "LSTM", "CNN",
                    "dynamical systems", "Koopman", "state space model",
                ],
            ),
            KeywordCategory::new(
                "clinical",
                "Clinical translation",
                5,
                &[
                    "drug-resistant", "refractory epilepsy", "surgical",
                    "resection", "epilepsy surgery", "seizure freedom",
                    "clinical trial", "patient",
                ],
            ),
            KeywordCategory::new(
                "devices",
                "Specific devices/platforms",
                6,
                &[
                    "NeuroPace", "Medtronic", "Summit", "RC+S", "Percept",
                    "Neuropixels", "Precision Neuroscience", "Axoft",
                ],
            ),
        ];

        let priority_phrases = [
            "foundation model",
            "closed-loop",
            "seizure prediction",
            "thalamic DBS",
            "responsive neurostimulation",
        ]
        .iter()
        .map(|p| p.to_string())
        .collect();

        Self::new(categories, priority_phrases)
    }
}
