//! LLM-driven clustering: the model proposes pattern classes, then
//! batch-categorises every experience against them.

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::experience::Experience;
use crate::llm::{CompletionRequest, LlmClient};
use crate::parser::parse_pattern_ref;
use crate::prompt::aisp;

use super::deep::{parse_pattern_classes, validate_aisp_response};
use super::{
    code_hash, encode_cluster_keys, stratified_sample, AlgorithmInfo, ClusterConfig, ClusterRun,
    Clusters, ClusteringAlgorithm,
};

const BATCH_SIZE: usize = 20;
const OTHER_CLASS: &str = "other";

static EXP_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)exp\[(\d+)\]").expect("invalid regex"));

/// Fully LLM-driven clustering with a generic outcome partition fallback.
pub struct LlmCluster {
    info: AlgorithmInfo,
    client: Arc<dyn LlmClient>,
}

impl LlmCluster {
    pub fn v1(client: Arc<dyn LlmClient>) -> Self {
        Self {
            info: AlgorithmInfo::new(
                "llm",
                1,
                "LLM-proposed pattern classes with batch categorisation",
                code_hash("llm v1 propose+categorise"),
            )
            .expect("valid builtin info"),
            client,
        }
    }

    fn proposal_prompt(&self, sample: &[&Experience], config: &ClusterConfig) -> String {
        let mut prompt = if config.aisp_mode.is_aisp() {
            "⟦Γ:Classify⟧{task≔propose ≥10 distinct pattern classes}\n\
             Answer one line per class:\nPATTERN: <name> | KEYWORDS: <comma-separated>\n\n"
                .to_string()
        } else {
            "These are reasoning texts from Sudoku move attempts. Propose at least 10 \
             distinct pattern classes that cover them.\n\
             Answer one line per class:\nPATTERN: <name> | KEYWORDS: <comma-separated>\n\n"
                .to_string()
        };
        prompt.push_str("Sampled reasoning:\n");
        for (i, exp) in sample.iter().enumerate() {
            let reasoning = exp.mv.reasoning.replace('\n', " ");
            prompt.push_str(&format!("[{i}] {reasoning}\n"));
        }
        prompt
    }

    fn categorise_prompt(
        &self,
        classes: &[(String, Vec<String>)],
        batch: &[&Experience],
        config: &ClusterConfig,
    ) -> String {
        let mut prompt = String::from("Assign each experience to one pattern class.\nClasses:\n");
        for (i, (name, keywords)) in classes.iter().enumerate() {
            let label = if config.aisp_mode.is_aisp() {
                aisp::encode_cluster_name(name)
            } else {
                name.clone()
            };
            prompt.push_str(&format!("P{} = {label} ({})\n", i + 1, keywords.join(", ")));
        }
        prompt.push_str("\nExperiences:\n");
        for (k, exp) in batch.iter().enumerate() {
            let reasoning = exp.mv.reasoning.replace('\n', " ");
            prompt.push_str(&format!("exp[{k}] {reasoning}\n"));
        }
        prompt.push_str("\nAnswer one line per experience: exp[k]→P{n}\n");
        prompt
    }

    /// Parse `exp[k]→P{n}` assignment lines into per-batch class indices.
    fn parse_assignments(response: &str, batch_len: usize) -> Vec<Option<usize>> {
        let mut assignments = vec![None; batch_len];
        for line in response.lines() {
            let Some(caps) = EXP_INDEX.captures(line) else {
                continue;
            };
            let Ok(k) = caps[1].parse::<usize>() else {
                continue;
            };
            if k >= batch_len {
                continue;
            }
            if let Some(class) = parse_pattern_ref(line) {
                assignments[k] = Some(class);
            }
        }
        assignments
    }

    /// Partition by validation outcome, the reduced-information path used
    /// when the LLM cannot help.
    fn generic_partition(experiences: &[Experience]) -> Clusters {
        let mut clusters = Clusters::new();
        for exp in experiences {
            let name = format!("{} moves", exp.validation.outcome);
            clusters.entry(name).or_default().push(exp.clone());
        }
        clusters
    }
}

#[async_trait]
impl ClusteringAlgorithm for LlmCluster {
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
        let sample = stratified_sample(experiences, config.llm_sample_cap);
        let proposal = self.proposal_prompt(&sample, config);
        let request = if config.aisp_mode.is_aisp() {
            CompletionRequest::with_system("⟦Γ:Role⟧{analyst∧clusterer}", proposal)
        } else {
            CompletionRequest::from_prompt(proposal)
        };

        let classes = match self.client.complete(request).await {
            Ok(response) => {
                validate_aisp_response(&response.content, config.aisp_mode);
                parse_pattern_classes(&response.content)
            }
            Err(e) => {
                warn!(error = %e, "class proposal failed; using generic partition");
                Vec::new()
            }
        };
        if classes.is_empty() {
            let clusters =
                encode_cluster_keys(Self::generic_partition(experiences), config.aisp_mode);
            let run = ClusterRun {
                algorithm: self.info.identifier(),
                total_input: experiences.len(),
                clusters_produced: clusters.len(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                fallback_taken: true,
            };
            return Ok((clusters, run));
        }

        let mut clusters = Clusters::new();
        let mut fallback_taken = false;
        for batch in experiences.chunks(BATCH_SIZE) {
            let refs: Vec<&Experience> = batch.iter().collect();
            let prompt = self.categorise_prompt(&classes, &refs, config);
            let assignments = match self
                .client
                .complete(CompletionRequest::from_prompt(prompt))
                .await
            {
                Ok(response) => Self::parse_assignments(&response.content, batch.len()),
                Err(e) => {
                    warn!(error = %e, "batch categorisation failed; batch goes to other");
                    fallback_taken = true;
                    vec![None; batch.len()]
                }
            };
            for (exp, assignment) in batch.iter().zip(assignments) {
                let name = assignment
                    .filter(|&class| class >= 1)
                    .and_then(|class| classes.get(class - 1))
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| OTHER_CLASS.to_string());
                clusters.entry(name).or_default().push(exp.clone());
            }
        }
        let clusters = encode_cluster_keys(clusters, config.aisp_mode);

        debug!(
            algorithm = %self.info.identifier(),
            input = experiences.len(),
            clusters = clusters.len(),
            "llm clustering complete"
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
