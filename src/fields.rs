//! Research-field detection and source routing.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::sanitize::{sanitize_query, truncate_for_log};

const DEFAULT_THRESHOLD: f64 = 0.3;
const SUBSTRING_MATCH: f64 = 1.0;
const WORD_MATCH: f64 = 0.8;
const ROUTED_FIELDS: usize = 3;

fn default_weight() -> f64 {
    1.0
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_databases() -> Vec<String> {
    vec!["semantic_scholar".to_string(), "pubmed".to_string()]
}

/// One research field: its trigger keywords and preferred databases, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub keywords: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub databases: Vec<String>,
}

/// Field table. Field order is the tie-break order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldTaxonomy {
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_databases")]
    pub default_databases: Vec<String>,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
}

impl FieldTaxonomy {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading field taxonomy {}", path.display()))?;
        let taxonomy: FieldTaxonomy = serde_json::from_str(&raw)
            .with_context(|| format!("parsing field taxonomy {}", path.display()))?;
        Ok(taxonomy)
    }
}

fn field(name: &str, description: &str, weight: f64, keywords: &[&str], databases: &[&str]) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        description: description.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        weight,
        databases: databases.iter().map(|d| d.to_string()).collect(),
    }
}

impl Default for FieldTaxonomy {
    fn default() -> Self {
        Self {
            fields: vec![
                field(
                    "epilepsy_clinical",
                    "Clinical epilepsy and seizure research",
                    1.0,
                    &[
                        "epilepsy", "seizure", "epileptic", "ictal", "interictal",
                        "seizure onset zone", "soz", "drug-resistant", "anticonvulsant",
                        "antiepileptic", "seizure prediction", "seizure detection",
                    ],
                    &["pubmed", "semantic_scholar", "medrxiv", "nih_reporter"],
                ),
                field(
                    "connectivity",
                    "Functional and effective brain connectivity",
                    0.9,
                    &[
                        "connectivity", "functional connectivity", "phase locking value", "plv",
                        "coherence", "granger causality", "synchrony", "synchronization",
                        "network", "coupling",
                    ],
                    &["semantic_scholar", "pubmed", "arxiv"],
                ),
                field(
                    "machine_learning",
                    "Machine learning and deep learning methods",
                    0.9,
                    &[
                        "machine learning", "deep learning", "neural network", "lstm",
                        "transformer", "cnn", "classification", "prediction",
                        "random forest", "support vector machine", "convolutional", "recurrent",
                    ],
                    &["semantic_scholar", "arxiv", "pubmed"],
                ),
                field(
                    "electrophysiology",
                    "EEG and invasive electrophysiology recordings",
                    0.9,
                    &[
                        "eeg", "ieeg", "seeg", "ecog", "intracranial", "electrocorticography",
                        "scalp eeg", "local field potential", "lfp", "spike", "single unit",
                        "multi-unit",
                    ],
                    &["pubmed", "semantic_scholar", "biorxiv"],
                ),
                field(
                    "physics_informed",
                    "Physics-informed and equation-discovery methods",
                    0.8,
                    &[
                        "physics-informed", "pinn", "sindy", "koopman", "operator theory",
                        "dynamic mode decomposition", "dmd", "neural ode", "equation discovery",
                        "sparse regression",
                    ],
                    &["arxiv", "semantic_scholar"],
                ),
                field(
                    "nonlinear_dynamics",
                    "Nonlinear dynamics and dynamical systems",
                    0.8,
                    &[
                        "nonlinear", "dynamical system", "attractor", "bifurcation", "lyapunov",
                        "chaos", "phase space", "koopman", "limit cycle", "criticality",
                    ],
                    &["arxiv", "semantic_scholar", "pubmed"],
                ),
                field(
                    "information_theory",
                    "Information-theoretic measures",
                    0.8,
                    &[
                        "entropy", "transfer entropy", "mutual information", "information theory",
                        "complexity", "sample entropy", "permutation entropy", "kolmogorov",
                    ],
                    &["arxiv", "semantic_scholar"],
                ),
                field(
                    "graph_theory",
                    "Graph-theoretic network analysis",
                    0.7,
                    &[
                        "graph theory", "networks", "node", "hub", "small-world", "centrality",
                        "graph", "modularity", "connectome", "clustering coefficient",
                    ],
                    &["semantic_scholar", "arxiv", "pubmed"],
                ),
                field(
                    "signal_processing",
                    "Signal processing and spectral analysis",
                    0.8,
                    &[
                        "wavelet", "fourier", "spectral", "filter", "frequency",
                        "hilbert transform", "time-frequency", "power spectrum", "spectrogram",
                        "bandpass",
                    ],
                    &["semantic_scholar", "arxiv", "pubmed"],
                ),
                field(
                    "clinical_applications",
                    "Clinical translation, devices and neuromodulation",
                    0.7,
                    &[
                        "seizure detection", "seizure prediction", "seizure forecasting",
                        "localization", "surgical planning", "closed-loop",
                        "responsive neurostimulation", "deep brain stimulation", "biomarker",
                        "outcome",
                    ],
                    &["pubmed", "medrxiv", "nih_reporter", "semantic_scholar", "nsf"],
                ),
            ],
            default_databases: default_databases(),
            confidence_threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldDetectionResult {
    pub detected_fields: Vec<String>,
    pub confidence_scores: BTreeMap<String, f64>,
    pub recommended_sources: Vec<String>,
    pub keywords_matched: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FieldDetector {
    taxonomy: FieldTaxonomy,
}

/// `keyword` is a plural of `token` ("networks" for "network").
fn plural_of(keyword: &str, token: &str) -> bool {
    keyword
        .strip_prefix(token)
        .is_some_and(|rest| rest == "s" || rest == "es")
}

impl FieldDetector {
    pub fn new(taxonomy: FieldTaxonomy) -> Self {
        Self { taxonomy }
    }

    /// Load a taxonomy file, falling back to the built-in table if it cannot be read.
    pub fn from_path_or_default(path: &Path) -> Self {
        match FieldTaxonomy::from_path(path) {
            Ok(taxonomy) => {
                tracing::info!("Loaded {} fields from {}", taxonomy.fields.len(), path.display());
                Self::new(taxonomy)
            }
            Err(e) => {
                tracing::error!("Failed to load field taxonomy: {:#}; using built-in fields", e);
                Self::default()
            }
        }
    }

    pub fn taxonomy(&self) -> &FieldTaxonomy {
        &self.taxonomy
    }

    pub fn list_fields(&self) -> Vec<&str> {
        self.taxonomy.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field_info(&self, name: &str) -> Option<&FieldSpec> {
        self.taxonomy.fields.iter().find(|f| f.name == name)
    }

    fn default_result(&self) -> FieldDetectionResult {
        FieldDetectionResult {
            recommended_sources: self.taxonomy.default_databases.clone(),
            ..Default::default()
        }
    }

    pub fn detect(&self, query: &str) -> FieldDetectionResult {
        let Some(clean) = sanitize_query(query) else {
            tracing::warn!("Field detection skipped: query failed sanitization");
            return self.default_result();
        };

        let lowered = clean.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
            .filter(|t| !t.is_empty())
            .collect();

        let mut raw_scores: Vec<(&FieldSpec, f64)> = Vec::new();
        let mut keywords_matched = BTreeMap::new();

        for spec in &self.taxonomy.fields {
            if spec.keywords.is_empty() {
                continue;
            }
            let mut matches = 0.0;
            let mut matched = Vec::new();
            for keyword in &spec.keywords {
                let kw = keyword.to_lowercase();
                if lowered.contains(&kw) {
                    matches += SUBSTRING_MATCH;
                    matched.push(keyword.clone());
                } else if !kw.contains(char::is_whitespace) && tokens.iter().any(|t| plural_of(&kw, t)) {
                    matches += WORD_MATCH;
                    matched.push(keyword.clone());
                }
            }
            if matches > 0.0 {
                raw_scores.push((spec, matches / spec.keywords.len() as f64 * spec.weight));
                keywords_matched.insert(spec.name.clone(), matched);
            }
        }

        let max = raw_scores.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
        if max <= 0.0 {
            tracing::info!("No specific fields detected for query: {}", truncate_for_log(&clean));
            return FieldDetectionResult {
                keywords_matched,
                ..self.default_result()
            };
        }

        let confidences: Vec<(&FieldSpec, f64)> = raw_scores.iter().map(|(f, s)| (*f, s / max)).collect();
        let mut detected: Vec<(&FieldSpec, f64)> = confidences
            .iter()
            .filter(|(_, c)| *c >= self.taxonomy.confidence_threshold)
            .copied()
            .collect();
        detected.sort_by(|a, b| b.1.total_cmp(&a.1));

        let detected_specs: Vec<&FieldSpec> = detected.iter().map(|(f, _)| *f).collect();
        let recommended_sources = self.recommend(&detected_specs);

        let detected_fields: Vec<String> = detected_specs.iter().map(|f| f.name.clone()).collect();
        tracing::info!(
            "Detected fields {:?} for query: {}",
            &detected_fields[..detected_fields.len().min(ROUTED_FIELDS)],
            truncate_for_log(&clean)
        );

        FieldDetectionResult {
            detected_fields,
            confidence_scores: confidences
                .into_iter()
                .map(|(f, c)| (f.name.clone(), c))
                .collect(),
            recommended_sources,
            keywords_matched,
        }
    }

    /// Sum positionally decayed field weights per database over the top fields.
    fn recommend(&self, detected: &[&FieldSpec]) -> Vec<String> {
        if detected.is_empty() {
            return self.taxonomy.default_databases.clone();
        }

        let mut totals: Vec<(String, f64)> = Vec::new();
        for spec in detected.iter().take(ROUTED_FIELDS) {
            let databases = if spec.databases.is_empty() {
                &self.taxonomy.default_databases
            } else {
                &spec.databases
            };
            for (i, db) in databases.iter().enumerate() {
                let weight = spec.weight * (1.0 - 0.1 * i as f64);
                match totals.iter_mut().find(|(name, _)| name == db) {
                    Some((_, total)) => *total += weight,
                    None => totals.push((db.clone(), weight)),
                }
            }
        }

        totals.sort_by(|a, b| b.1.total_cmp(&a.1));
        totals.into_iter().map(|(db, _)| db).collect()
    }
}

impl Default for FieldDetector {
    fn default() -> Self {
        Self::new(FieldTaxonomy::default())
    }
}
