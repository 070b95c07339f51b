//! Topic classification that decides how long cached results stay fresh.

use std::time::Duration;

use serde::Serialize;

/// A topic bucket and the cache TTL it implies.
#[derive(Debug, Clone, Serialize)]
pub struct TopicBucket {
    pub name: String,
    pub ttl_hours: u64,
    pub keywords: Vec<String>,
}

impl TopicBucket {
    fn new(name: &str, ttl_hours: u64, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            ttl_hours,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Result of classifying a title/abstract pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic {
    pub name: String,
    pub ttl_hours: u64,
}

impl Topic {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

pub const GENERAL_TOPIC: &str = "general";
pub const GENERAL_TTL_HOURS: u64 = 24;

/// Keyword-count classifier over an ordered list of buckets.
///
/// Buckets are scored in declaration order and the first bucket with the
/// strictly highest nonzero count wins. With no hits the `general` bucket
/// (24h) is used.
#[derive(Debug, Clone)]
pub struct TopicClassifier {
    buckets: Vec<TopicBucket>,
    fallback: Topic,
}

impl TopicClassifier {
    pub fn new(buckets: Vec<TopicBucket>) -> Self {
        Self {
            buckets,
            fallback: Topic {
                name: GENERAL_TOPIC.to_string(),
                ttl_hours: GENERAL_TTL_HOURS,
            },
        }
    }

    pub fn buckets(&self) -> &[TopicBucket] {
        &self.buckets
    }

    pub fn classify(&self, title: &str, abstract_text: &str) -> Topic {
        let text = format!("{} {}", title, abstract_text).to_lowercase();

        let mut best: Option<(&TopicBucket, usize)> = None;
        for bucket in &self.buckets {
            let score: usize = bucket
                .keywords
                .iter()
                .map(|kw| text.matches(kw.to_lowercase().as_str()).count())
                .sum();
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((bucket, score));
            }
        }

        let topic = match best {
            Some((bucket, _)) => Topic {
                name: bucket.name.clone(),
                ttl_hours: bucket.ttl_hours,
            },
            None => self.fallback.clone(),
        };
        tracing::debug!("Classified as '{}' (TTL: {}h)", topic.name, topic.ttl_hours);
        topic
    }

    /// TTL for a named topic, falling back to the general TTL.
    pub fn ttl_hours(&self, topic: &str) -> u64 {
        self.buckets
            .iter()
            .find(|b| b.name == topic)
            .map(|b| b.ttl_hours)
            .unwrap_or(self.fallback.ttl_hours)
    }
}

impl Default for TopicClassifier {
    fn default() -> Self {
        Self::new(vec![
            TopicBucket::new(
                "epilepsy_clinical",
                168,
                &[
                    "epilepsy", "seizure", "interictal", "ictal", "epileptiform",
                    "iEEG", "sEEG", "ECoG", "thalamus", "hippocampus",
                    "deep brain stimulation", "DBS", "RNS", "responsive neurostimulation",
                    "antiepileptic", "anticonvulsant", "temporal lobe epilepsy",
                ],
            ),
            TopicBucket::new(
                "methods_reviews",
                720,
                &[
                    "review", "systematic review", "meta-analysis", "survey",
                    "methods", "algorithm", "framework", "open source",
                    "benchmark", "dataset", "tutorial", "perspective",
                ],
            ),
            TopicBucket::new(
                "foundational",
                720,
                &[
                    "foundation model", "pretrain", "self-supervised",
                    "transfer learning", "large language model", "transformer",
                    "BERT", "GPT", "generative model",
                ],
            ),
        ])
    }
}
