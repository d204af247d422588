//! Keyword-signature clustering.
//!
//! v1 matches English reasoning against a fixed priority list; v2 first
//! detects AISP notation in the reasoning pool and switches to a
//! glyph-aware keyword set when it dominates.

use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::experience::Experience;
use crate::prompt::aisp;

use super::{
    code_hash, encode_cluster_keys, AlgorithmInfo, ClusterConfig, ClusterRun, Clusters,
    ClusteringAlgorithm,
};

/// English signature keywords, highest priority first.
const ENGLISH_KEYWORDS: [(&str, &[&str]); 7] = [
    ("only candidate", &["only candidate", "only possible", "single candidate", "forced"]),
    ("missing from row", &["missing from row", "row is missing", "last in row", "row needs"]),
    (
        "missing from column",
        &["missing from column", "column is missing", "last in column", "column needs"],
    ),
    ("missing from box", &["missing from box", "box is missing", "last in box", "box needs"]),
    ("elimination", &["eliminat", "ruled out", "cannot be", "excluded"]),
    ("intersection", &["intersect", "cross-reference", "overlap"]),
    ("guess", &["guess", "try", "random"]),
];

/// AISP glyph keywords, mirroring the English priority list.
const AISP_KEYWORDS: [(&str, &[&str]); 5] = [
    ("only candidate", &["∃!", "unique", "⊢!"]),
    ("missing from row", &["∉row", "row∖", "∉r"]),
    ("missing from column", &["∉col", "col∖", "∉c"]),
    ("missing from box", &["∉box", "box∖", "∉b"]),
    ("elimination", &["∖", "¬∈", "∅"]),
];

const OTHER_SIGNATURE: &str = "other";

/// Extract the keyword signature of one experience's reasoning.
fn signature(reasoning: &str, use_aisp: bool) -> &'static str {
    if use_aisp {
        for (name, patterns) in &AISP_KEYWORDS {
            if patterns.iter().any(|p| reasoning.contains(p)) {
                return name;
            }
        }
        return OTHER_SIGNATURE;
    }
    let lower = reasoning.to_lowercase();
    for (name, patterns) in &ENGLISH_KEYWORDS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return name;
        }
    }
    OTHER_SIGNATURE
}

/// Group experiences by keyword signature, subdividing a dominant cluster
/// by move region.
pub(crate) fn keyword_partition(
    experiences: &[Experience],
    use_aisp: bool,
    dominant_fraction: f64,
) -> Clusters {
    let mut clusters = Clusters::new();
    for exp in experiences {
        let sig = signature(&exp.mv.reasoning, use_aisp);
        clusters
            .entry(sig.to_string())
            .or_default()
            .push(exp.clone());
    }

    // A cluster holding more than the dominant fraction of the input says
    // little; split it by the board region the move landed in.
    let threshold = (experiences.len() as f64 * dominant_fraction).ceil() as usize;
    let dominant: Vec<String> = clusters
        .iter()
        .filter(|(_, members)| experiences.len() >= 8 && members.len() > threshold)
        .map(|(name, _)| name.clone())
        .collect();
    for name in dominant {
        let members = clusters.remove(&name).unwrap_or_default();
        for exp in members {
            let region = move_region(&exp);
            clusters
                .entry(format!("{name} / {region}"))
                .or_default()
                .push(exp);
        }
    }

    clusters
}

fn move_region(exp: &Experience) -> String {
    let bs = exp.board_before.box_size().max(1);
    if exp.mv.row == 0 {
        return "unplaced".to_string();
    }
    let br = (exp.mv.row - 1) / bs + 1;
    let bc = (exp.mv.col - 1) / bs + 1;
    format!("box {br}.{bc}")
}

/// Whether the reasoning pool is written in AISP notation.
fn pool_is_aisp(experiences: &[Experience]) -> bool {
    if experiences.is_empty() {
        return false;
    }
    let aisp_count = experiences
        .iter()
        .filter(|e| aisp::is_aisp(&e.mv.reasoning))
        .count();
    aisp_count * 2 > experiences.len()
}

/// Keyword-based clustering; see the module docs for the v1/v2 split.
pub struct FastCluster {
    info: AlgorithmInfo,
    aisp_aware: bool,
}

impl FastCluster {
    /// v1: English keywords only.
    pub fn v1() -> Self {
        Self {
            info: AlgorithmInfo::new(
                "fast",
                1,
                "Keyword-signature clustering over English reasoning",
                code_hash("fast v1 english keywords"),
            )
            .expect("valid builtin info"),
            aisp_aware: false,
        }
    }

    /// v2: detects AISP reasoning and switches keyword sets.
    pub fn v2() -> Self {
        Self {
            info: AlgorithmInfo::new(
                "fast",
                2,
                "Keyword-signature clustering, AISP-aware",
                code_hash("fast v2 aisp-aware keywords"),
            )
            .expect("valid builtin info"),
            aisp_aware: true,
        }
    }
}

#[async_trait]
impl ClusteringAlgorithm for FastCluster {
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
        let use_aisp = self.aisp_aware && pool_is_aisp(experiences);
        let clusters = keyword_partition(experiences, use_aisp, config.dominant_fraction);
        let clusters = encode_cluster_keys(clusters, config.aisp_mode);

        debug!(
            algorithm = %self.info.identifier(),
            input = experiences.len(),
            clusters = clusters.len(),
            use_aisp,
            "fast clustering complete"
        );
        let run = ClusterRun {
            algorithm: self.info.identifier(),
            total_input: experiences.len(),
            clusters_produced: clusters.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            fallback_taken: false,
        };
        Ok((clusters, run))
    }
}
