//! Clustering algorithms and their versioned registry.
//!
//! Consolidation partitions unconsolidated experiences into semantic
//! clusters before pattern synthesis. Algorithms are pluggable and
//! versioned; a learning unit records the identifier of the algorithm that
//! produced it.

pub mod deep;
pub mod fast;
pub mod llm;
mod registry;

pub use registry::ClusterRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::experience::Experience;
use crate::prompt::aisp;
use crate::prompt::AispMode;

/// Named clusters, in stable name order.
pub type Clusters = BTreeMap<String, Vec<Experience>>;

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+v\d+$").expect("invalid regex"));

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+$").expect("invalid regex"));

static HASH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{8}$").expect("invalid regex"));

/// Whether a string is a well-formed algorithm identifier (`<lowername>v<n>`).
pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(s)
}

/// Metadata carried by every clustering algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmInfo {
    /// Lowercase letters only; combined with the version it forms the
    /// identifier.
    pub name: String,
    /// Positive version number.
    pub version: u32,
    /// Human description.
    pub description: String,
    /// 8-hex digest of the algorithm's code-defining inputs.
    pub code_hash: String,
    pub created: DateTime<Utc>,
}

impl AlgorithmInfo {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        description: impl Into<String>,
        code_hash: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let code_hash = code_hash.into();
        if !NAME_PATTERN.is_match(&name) {
            return Err(Error::Config(format!(
                "algorithm name '{name}' must be lowercase letters only"
            )));
        }
        if version == 0 {
            return Err(Error::Config("algorithm version must be positive".into()));
        }
        if !HASH_PATTERN.is_match(&code_hash) {
            return Err(Error::Config(format!(
                "code hash '{code_hash}' must be exactly 8 hex characters"
            )));
        }
        Ok(Self {
            name,
            version,
            description: description.into(),
            code_hash,
            created: Utc::now(),
        })
    }

    /// `<lowername>v<n>`, e.g. `fastv2`.
    pub fn identifier(&self) -> String {
        format!("{}v{}", self.name, self.version)
    }
}

/// Derive an 8-hex code hash from an algorithm's code-defining inputs.
pub fn code_hash(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Tunables shared by all algorithms.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster-name and prompt surface syntax.
    pub aisp_mode: AispMode,
    /// A cluster holding more than this fraction of the input gets
    /// subdivided by move region.
    pub dominant_fraction: f64,
    /// DeepCluster asks the LLM to split keyword clusters larger than this.
    pub deep_split_threshold: usize,
    /// LlmCluster samples at most this many experiences for class proposal.
    pub llm_sample_cap: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            aisp_mode: AispMode::Off,
            dominant_fraction: 0.4,
            deep_split_threshold: 50,
            llm_sample_cap: 150,
        }
    }
}

/// Outcome metadata of one clustering run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRun {
    /// Identifier of the algorithm that ran.
    pub algorithm: String,
    pub total_input: usize,
    pub clusters_produced: usize,
    pub elapsed_ms: u64,
    /// Whether a reduced-information fallback path was taken.
    pub fallback_taken: bool,
}

/// A pluggable, versioned clustering algorithm.
#[async_trait]
pub trait ClusteringAlgorithm: Send + Sync {
    fn info(&self) -> &AlgorithmInfo;

    /// Partition experiences into at most roughly `target_count` clusters.
    async fn cluster(
        &self,
        experiences: &[Experience],
        target_count: usize,
        config: &ClusterConfig,
    ) -> Result<(Clusters, ClusterRun)>;
}

/// Take a difficulty-stratified sample of `max` experiences.
///
/// Experiences are ordered by empty-cell count and picked at an even
/// stride, so easy and hard positions are both represented.
pub fn stratified_sample(experiences: &[Experience], max: usize) -> Vec<&Experience> {
    if experiences.len() <= max {
        return experiences.iter().collect();
    }
    let mut ordered: Vec<&Experience> = experiences.iter().collect();
    ordered.sort_by_key(|e| e.context.empty_cells);
    let stride = ordered.len() as f64 / max as f64;
    (0..max)
        .map(|i| ordered[(i as f64 * stride) as usize])
        .collect()
}

/// Re-encode cluster names as AISP cluster blocks when the mode calls for
/// it.
pub fn encode_cluster_keys(clusters: Clusters, mode: AispMode) -> Clusters {
    if !mode.is_aisp() {
        return clusters;
    }
    clusters
        .into_iter()
        .map(|(name, members)| (aisp::encode_cluster_name(&name), members))
        .collect()
}
