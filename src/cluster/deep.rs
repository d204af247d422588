//! Two-phase clustering: keyword partition, then LLM semantic splitting of
//! oversized clusters.

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::experience::Experience;
use crate::llm::{CompletionRequest, LlmClient};
use crate::prompt::aisp::{self, AispTier};
use crate::prompt::AispMode;

use super::fast::keyword_partition;
use super::{
    code_hash, encode_cluster_keys, stratified_sample, AlgorithmInfo, ClusterConfig, ClusterRun,
    Clusters, ClusteringAlgorithm,
};

static CLASS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*pattern\s*:\s*(.+?)\s*\|\s*keywords\s*:\s*(.+)$").expect("invalid regex")
});

/// Parse `PATTERN: name | KEYWORDS: a, b, c` lines from an LLM response.
pub(crate) fn parse_pattern_classes(text: &str) -> Vec<(String, Vec<String>)> {
    CLASS_LINE
        .captures_iter(text)
        .map(|caps| {
            let name = caps[1].trim().to_string();
            let keywords = caps[2]
                .split(',')
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            (name, keywords)
        })
        .collect()
}

/// Categorise experiences by keyword containment, with an `other` bucket
/// for unmatched ones. Empty sub-clusters are dropped.
pub(crate) fn categorize_by_keywords(
    members: Vec<Experience>,
    classes: &[(String, Vec<String>)],
    other_name: &str,
) -> Clusters {
    let mut clusters = Clusters::new();
    for exp in members {
        let lower = exp.mv.reasoning.to_lowercase();
        let class = classes
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| other_name.to_string());
        clusters.entry(class).or_default().push(exp);
    }
    clusters.retain(|_, members| !members.is_empty());
    clusters
}

/// Log-and-continue AISP validation: the lowest conformance tier earns a
/// critique, then parsing proceeds in English regardless.
pub(crate) fn validate_aisp_response(response: &str, mode: AispMode) {
    if mode.is_aisp() && aisp::aisp_tier(response) == AispTier::Plain {
        warn!("AISP response validation failed: no notation found; falling back to English parsing");
    }
}

/// Keyword clustering with LLM semantic refinement of large clusters.
pub struct DeepCluster {
    info: AlgorithmInfo,
    client: Arc<dyn LlmClient>,
}

impl DeepCluster {
    pub fn v1(client: Arc<dyn LlmClient>) -> Self {
        Self {
            info: AlgorithmInfo::new(
                "deep",
                1,
                "Keyword clustering with LLM semantic splitting of large clusters",
                code_hash("deep v1 keyword+llm split"),
            )
            .expect("valid builtin info"),
            client,
        }
    }

    fn split_prompt(&self, cluster_name: &str, sample: &[&Experience], mode: AispMode) -> String {
        let mut prompt = if mode.is_aisp() {
            format!(
                "⟦Γ:Split⟧{{cluster≔{};task≔name 4..8 sub-patterns}}\n\
                 Answer one line per sub-pattern:\nPATTERN: <name> | KEYWORDS: <comma-separated>\n\n",
                aisp::encode_cluster_name(cluster_name)
            )
        } else {
            format!(
                "The cluster \"{cluster_name}\" groups Sudoku move reasoning. Name 4 to 8 \
                 distinct semantic sub-patterns within it.\n\
                 Answer one line per sub-pattern:\nPATTERN: <name> | KEYWORDS: <comma-separated>\n\n"
            )
        };
        prompt.push_str("Sampled reasoning:\n");
        for (i, exp) in sample.iter().enumerate() {
            let reasoning = exp.mv.reasoning.replace('\n', " ");
            prompt.push_str(&format!("[{i}] {reasoning}\n"));
        }
        prompt
    }

    async fn split_cluster(
        &self,
        name: &str,
        members: Vec<Experience>,
        config: &ClusterConfig,
    ) -> (Clusters, bool) {
        let sample = stratified_sample(&members, 40);
        let prompt = self.split_prompt(name, &sample, config.aisp_mode);
        let request = if config.aisp_mode.is_aisp() {
            CompletionRequest::with_system("⟦Γ:Role⟧{analyst∧clusterer}", prompt)
        } else {
            CompletionRequest::from_prompt(prompt)
        };

        match self.client.complete(request).await {
            Ok(response) => {
                validate_aisp_response(&response.content, config.aisp_mode);
                let classes = parse_pattern_classes(&response.content);
                if classes.is_empty() {
                    warn!(cluster = name, "semantic split returned no classes; keeping keyword cluster");
                    let mut kept = Clusters::new();
                    kept.insert(name.to_string(), members);
                    return (kept, true);
                }
                let other = format!("{name} / other");
                (categorize_by_keywords(members, &classes, &other), false)
            }
            Err(e) => {
                warn!(cluster = name, error = %e, "semantic split failed; keeping keyword cluster");
                let mut kept = Clusters::new();
                kept.insert(name.to_string(), members);
                (kept, true)
            }
        }
    }
}

#[async_trait]
impl ClusteringAlgorithm for DeepCluster {
    fn info(&self) -> &AlgorithmInfo {
        &self.info
    }

    async fn cluster(
        &self,
        experiences: &[Experience],
        _target_count: usize,
        config: &ClusterConfig,
    ) -> Result<(Clusters, ClusterRun)> {
        let started = Instant::now();
        let keyword_clusters = keyword_partition(experiences, false, config.dominant_fraction);

        let mut clusters = Clusters::new();
        let mut fallback_taken = false;
        for (name, members) in keyword_clusters {
            if members.len() > config.deep_split_threshold {
                let (split, fell_back) = self.split_cluster(&name, members, config).await;
                fallback_taken |= fell_back;
                for (sub_name, sub_members) in split {
                    clusters.entry(sub_name).or_default().extend(sub_members);
                }
            } else {
                clusters.insert(name, members);
            }
        }
        let clusters = encode_cluster_keys(clusters, config.aisp_mode);

        debug!(
            algorithm = %self.info.identifier(),
            input = experiences.len(),
            clusters = clusters.len(),
            fallback_taken,
            "deep clustering complete"
        );
        let run = ClusterRun {
            algorithm: self.info.identifier(),
            total_input: experiences.len(),
            clusters_produced: clusters.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            fallback_taken,
        };
        Ok((clusters, run))
    }
}
