//! The consolidation ("dreaming") pipeline.
//!
//! A dream run gathers a profile's unconsolidated experiences, partitions
//! them with a clustering algorithm, synthesises one strategy pattern per
//! cluster via the LLM, ranks and selects a bounded few-shot set, builds a
//! four-level abstraction hierarchy, and atomically updates the learning
//! unit. Every LLM step has a reduced-information fallback; only the final
//! persistence is allowed to fail the run.

pub mod hierarchy;
pub mod patterns;

pub use hierarchy::{parse_hierarchy, AbstractionHierarchy, Generalization};
pub use patterns::{AntiPattern, SynthesizedPattern};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::board::ValidationOutcome;
use crate::cluster::{
    stratified_sample, ClusterConfig, ClusterRegistry, ClusterRun, ClusteringAlgorithm, Clusters,
};
use crate::error::{Error, Result};
use crate::experience::{Experience, FewShot, LearningUnit};
use crate::llm::{CompletionRequest, LlmClient};
use crate::prompt::{aisp, AispMode};
use crate::store::ExperienceStore;

/// Few-shot budget: standard 5/3, doubled 10/6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FewShotBudget {
    pub max: usize,
    pub min: usize,
}

impl FewShotBudget {
    pub fn standard() -> Self {
        Self { max: 5, min: 3 }
    }

    pub fn doubled() -> Self {
        Self { max: 10, min: 6 }
    }

    pub fn for_mode(doubled: bool) -> Self {
        if doubled {
            Self::doubled()
        } else {
            Self::standard()
        }
    }
}

/// Options for one dream run.
#[derive(Debug, Clone, Default)]
pub struct DreamOptions {
    /// Algorithm identifier; falls back to the unit's frozen choice, then
    /// the registry default.
    pub algorithm: Option<String>,
    pub doubled: bool,
    /// Keep global experience copies so further dream runs can absorb the
    /// same pool.
    pub preserve_originals: bool,
}

/// What a dream run did.
#[derive(Debug, Clone)]
pub struct DreamReport {
    pub experiences_consolidated: usize,
    pub few_shots_updated: usize,
    /// Success insights from the selected patterns.
    pub insights: Vec<String>,
    pub fallback_taken: bool,
    pub cluster_run: Option<ClusterRun>,
    pub unit_version: u32,
}

impl DreamReport {
    fn empty() -> Self {
        Self {
            experiences_consolidated: 0,
            few_shots_updated: 0,
            insights: Vec::new(),
            fallback_taken: false,
            cluster_run: None,
            unit_version: 0,
        }
    }
}

/// Per-(profile, unit) locks serialising consolidation against plays on the
/// same unit.
///
/// Plays take shared guards, so sessions on the same unit can run
/// concurrently; a dream run takes the exclusive guard and waits out every
/// in-flight play.
#[derive(Default)]
pub struct UnitLocks {
    locks: Mutex<HashMap<(String, String), Arc<RwLock<()>>>>,
}

impl UnitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, profile: &str, unit: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((profile.to_string(), unit.to_string()))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared guard held by a play session for its lifetime.
    pub async fn play_guard(&self, profile: &str, unit: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(profile, unit).await.read_owned().await
    }

    /// Exclusive guard held by a dream run.
    pub async fn dream_guard(&self, profile: &str, unit: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(profile, unit).await.write_owned().await
    }
}

/// Drives dream runs against a store, an LLM, and a clustering registry.
pub struct Consolidator {
    store: Arc<ExperienceStore>,
    client: Arc<dyn LlmClient>,
    registry: Arc<ClusterRegistry>,
    locks: Arc<UnitLocks>,
}

impl Consolidator {
    pub fn new(
        store: Arc<ExperienceStore>,
        client: Arc<dyn LlmClient>,
        registry: Arc<ClusterRegistry>,
        locks: Arc<UnitLocks>,
    ) -> Self {
        Self {
            store,
            client,
            registry,
            locks,
        }
    }

    /// Run the full pipeline for (profile, unit).
    pub async fn dream(
        &self,
        profile: &str,
        unit_id: &str,
        options: &DreamOptions,
    ) -> Result<DreamReport> {
        let _guard = self.locks.dream_guard(profile, unit_id).await;

        // 1. Gather.
        let experiences = self.store.get_unconsolidated(profile)?;
        if experiences.is_empty() {
            info!(profile, unit_id, "nothing to consolidate");
            return Ok(DreamReport::empty());
        }

        let mut unit = self
            .store
            .get_learning_unit(profile, unit_id)?
            .unwrap_or_else(|| LearningUnit::new(unit_id, profile));
        let budget = FewShotBudget::for_mode(options.doubled);
        let algorithm = self.resolve_algorithm(options, &unit)?;

        // 2. Partition, targeting twice the few-shot budget.
        let cluster_config = ClusterConfig {
            aisp_mode: unit.aisp_mode,
            ..ClusterConfig::default()
        };
        let (clusters, run) = algorithm
            .cluster(&experiences, budget.max * 2, &cluster_config)
            .await?;
        let mut fallback_taken = run.fallback_taken;

        // 3. Synthesise one pattern per cluster.
        let mut synthesized = Vec::new();
        for (name, members) in &clusters {
            if members.is_empty() {
                continue;
            }
            let (pattern, fell_back) = self.synthesize(name, members, unit.aisp_mode).await;
            fallback_taken |= fell_back;
            synthesized.push(pattern);
        }

        // 4. Rank by confidence, ties broken by source-cluster size.
        synthesized.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.source_cluster_size.cmp(&a.source_cluster_size))
        });

        // 5. Secondary refinement when a doubled run came up short.
        if options.doubled && synthesized.len() < budget.max + 2 {
            let fell_back = self
                .refine(&mut synthesized, &clusters, budget)
                .await;
            fallback_taken |= fell_back;
        }

        // 6. Select the top patterns and emit few-shots.
        let selected: Vec<&SynthesizedPattern> =
            synthesized.iter().take(budget.max).collect();
        let few_shots: Vec<FewShot> = selected
            .iter()
            .map(|p| to_few_shot(p, &clusters, unit.aisp_mode))
            .collect();
        if few_shots.len() < budget.min {
            warn!(
                selected = few_shots.len(),
                minimum = budget.min,
                "fewer patterns than the budget minimum; emitting what exists"
            );
        }

        // 7. Hierarchy.
        let (hierarchy, fell_back) = self.build_hierarchy(&selected).await;
        fallback_taken |= fell_back;

        // 8. Persist atomically.
        let ids: Vec<String> = experiences.iter().map(|e| e.id.clone()).collect();
        unit.metadata.version += 1;
        unit.metadata.total_experiences += experiences.len();
        unit.metadata.algorithm = Some(run.algorithm.clone());
        for exp in &experiences {
            *unit
                .metadata
                .by_puzzle_size
                .entry(exp.board_before.size())
                .or_insert(0) += 1;
        }
        unit.absorbed_experience_ids.extend(ids.iter().cloned());
        unit.updated_at = chrono::Utc::now();

        let absorbed = self.store.persist_consolidation(
            &unit,
            &few_shots,
            budget.max,
            &hierarchy,
            &ids,
            options.preserve_originals,
        )?;

        info!(
            profile,
            unit_id,
            absorbed,
            few_shots = few_shots.len(),
            version = unit.metadata.version,
            fallback_taken,
            "dream run complete"
        );
        Ok(DreamReport {
            experiences_consolidated: absorbed,
            few_shots_updated: few_shots.len(),
            insights: selected
                .iter()
                .map(|p| p.success_insight.clone())
                .filter(|s| !s.is_empty())
                .collect(),
            fallback_taken,
            cluster_run: Some(run),
            unit_version: unit.metadata.version,
        })
    }

    fn resolve_algorithm(
        &self,
        options: &DreamOptions,
        unit: &LearningUnit,
    ) -> Result<Arc<dyn ClusteringAlgorithm>> {
        if let Some(identifier) = options
            .algorithm
            .as_deref()
            .or(unit.metadata.algorithm.as_deref())
        {
            return self.registry.get_by_identifier(identifier).ok_or_else(|| {
                Error::Config(format!("clustering algorithm '{identifier}' is not registered"))
            });
        }
        self.registry
            .default_algorithm()
            .ok_or_else(|| Error::Config("no default clustering algorithm registered".into()))
    }

    async fn synthesize(
        &self,
        cluster_name: &str,
        members: &[Experience],
        mode: AispMode,
    ) -> (SynthesizedPattern, bool) {
        let sample = stratified_sample(members, 12);
        let anti = patterns::is_anti_pattern_cluster(members);
        let prompt = patterns::synthesis_prompt(cluster_name, &sample, anti, mode);
        match self
            .client
            .complete(CompletionRequest::from_prompt(prompt))
            .await
        {
            Ok(response) => {
                match patterns::parse_pattern(&response.content, cluster_name, members.len()) {
                    Some(pattern) => (pattern, false),
                    None => {
                        warn!(cluster = cluster_name, "unparseable synthesis response; using skeleton");
                        (patterns::skeleton_pattern(cluster_name, members.len()), true)
                    }
                }
            }
            Err(e) => {
                warn!(cluster = cluster_name, error = %e, "synthesis failed; using skeleton");
                (patterns::skeleton_pattern(cluster_name, members.len()), true)
            }
        }
    }

    /// Ask for additional distinct patterns from residual clusters. The
    /// request is capped at `min(budget.max, patterns so far)` so it never
    /// asks for more than exist.
    async fn refine(
        &self,
        synthesized: &mut Vec<SynthesizedPattern>,
        clusters: &Clusters,
        budget: FewShotBudget,
    ) -> bool {
        let want = budget.max.min(synthesized.len());
        if want == 0 {
            return false;
        }
        let covered: Vec<&str> = synthesized
            .iter()
            .map(|p| p.source_cluster.as_str())
            .collect();
        let mut prompt = format!(
            "The strategies below were already distilled. Propose up to {want} ADDITIONAL \
             distinct strategies from the residual clusters, in the same NAME/WHEN/STEPS/\
             TEMPLATE/INSIGHT/CONFIDENCE line format, one blank line between strategies.\n\n\
             Existing strategies:\n"
        );
        for p in synthesized.iter() {
            prompt.push_str(&format!("- {}\n", p.strategy_name));
        }
        prompt.push_str("\nResidual clusters:\n");
        for (name, members) in clusters {
            if !covered.contains(&name.as_str()) {
                prompt.push_str(&format!("- {name} ({} experiences)\n", members.len()));
            }
        }

        match self
            .client
            .complete(CompletionRequest::from_prompt(prompt))
            .await
        {
            Ok(response) => {
                let extra = patterns::parse_patterns_multi(&response.content, "refinement");
                let existing: Vec<String> =
                    synthesized.iter().map(|p| p.strategy_name.clone()).collect();
                synthesized.extend(
                    extra
                        .into_iter()
                        .filter(|p| !existing.contains(&p.strategy_name)),
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "secondary refinement failed; skipping");
                true
            }
        }
    }

    async fn build_hierarchy(
        &self,
        selected: &[&SynthesizedPattern],
    ) -> (AbstractionHierarchy, bool) {
        if selected.is_empty() {
            return (AbstractionHierarchy::default(), false);
        }
        let owned: Vec<SynthesizedPattern> = selected.iter().map(|p| (*p).clone()).collect();
        let prompt = hierarchy::hierarchy_prompt(&owned);
        match self
            .client
            .complete(CompletionRequest::from_prompt(prompt))
            .await
        {
            Ok(response) => (parse_hierarchy(&response.content), false),
            Err(e) => {
                warn!(error = %e, "hierarchy abstraction failed; storing empty hierarchy");
                (AbstractionHierarchy::default(), true)
            }
        }
    }
}

/// Convert a ranked pattern into a few-shot, borrowing an example move from
/// its source cluster (a correct one when available).
fn to_few_shot(pattern: &SynthesizedPattern, clusters: &Clusters, mode: AispMode) -> FewShot {
    let members = clusters.get(&pattern.source_cluster);
    let example = members.and_then(|members| {
        members
            .iter()
            .find(|e| e.validation.outcome == ValidationOutcome::Correct)
            .or_else(|| members.first())
    });
    let example_move = example
        .map(|e| e.mv.clone())
        .unwrap_or_else(|| crate::board::Move::new(1, 1, 1, ""));

    let analysis = if let Some(anti) = &pattern.anti_pattern {
        format!(
            "Avoid: {}. {}",
            anti.what_goes_wrong,
            anti.prevention_steps.join("; ")
        )
    } else if pattern.reasoning_steps.is_empty() {
        pattern.reasoning_template.clone()
    } else {
        pattern.reasoning_steps.join("; ")
    };

    let mut few_shot = FewShot {
        situation: pattern.when_to_use.clone(),
        analysis,
        aisp: None,
        example_move,
        outcome: ValidationOutcome::Correct,
        strategy_name: Some(pattern.strategy_name.clone()),
        abstraction_level: 1,
    };
    if mode == AispMode::AispFull {
        few_shot.aisp = Some(aisp::encode_few_shot(&few_shot));
    }
    few_shot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        code_hash, AlgorithmInfo, ClusteringAlgorithm, fast::FastCluster,
    };
    use crate::experience::tests::sample_experience;
    use crate::llm::testutil::{ScriptStep, ScriptedClient};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Deterministic test algorithm: clusters by move number modulo a fixed
    /// cluster count.
    struct ModuloAlgo {
        info: AlgorithmInfo,
        buckets: u32,
    }

    impl ModuloAlgo {
        fn new(buckets: u32) -> Self {
            Self {
                info: AlgorithmInfo::new("test", 1, "modulo buckets", code_hash("test v1"))
                    .unwrap(),
                buckets,
            }
        }
    }

    #[async_trait]
    impl ClusteringAlgorithm for ModuloAlgo {
        fn info(&self) -> &AlgorithmInfo {
            &self.info
        }

        async fn cluster(
            &self,
            experiences: &[Experience],
            _target_count: usize,
            _config: &ClusterConfig,
        ) -> crate::error::Result<(Clusters, ClusterRun)> {
            let mut clusters = Clusters::new();
            for exp in experiences {
                let bucket = exp.move_number % self.buckets;
                clusters
                    .entry(format!("bucket {bucket:02}"))
                    .or_default()
                    .push(exp.clone());
            }
            let run = ClusterRun {
                algorithm: self.info.identifier(),
                total_input: experiences.len(),
                clusters_produced: clusters.len(),
                elapsed_ms: 0,
                fallback_taken: false,
            };
            Ok((clusters, run))
        }
    }

    fn registry_with(algo: Arc<dyn ClusteringAlgorithm>) -> Arc<ClusterRegistry> {
        let mut registry = ClusterRegistry::new();
        registry.register(Arc::new(FastCluster::v2()), true).unwrap();
        registry.register(algo, false).unwrap();
        Arc::new(registry)
    }

    fn consolidator(
        store: Arc<ExperienceStore>,
        client: Arc<ScriptedClient>,
        registry: Arc<ClusterRegistry>,
    ) -> Consolidator {
        Consolidator::new(store, client, registry, Arc::new(UnitLocks::new()))
    }

    fn seed_correct(store: &ExperienceStore, profile: &str, count: u32) -> Vec<String> {
        (1..=count)
            .map(|i| {
                let mut exp = sample_experience(profile, &format!("s{}", i / 50), i);
                exp.mv.reasoning = format!("only candidate at step {i}");
                store.save_experience(&exp).unwrap();
                exp.id
            })
            .collect()
    }

    fn synthesis_reply(name: &str, confidence: f64) -> String {
        format!(
            "NAME: {name}\nWHEN: when it applies\nSTEPS: look; place\n\
             TEMPLATE: t\nINSIGHT: works because rules\nCONFIDENCE: {confidence}"
        )
    }

    #[tokio::test]
    async fn test_empty_pool_is_a_noop() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        let client = Arc::new(ScriptedClient::new(vec!["unused"]));
        let registry = registry_with(Arc::new(ModuloAlgo::new(3)));
        let report = consolidator(store, client, registry)
            .dream("default", "unit-a", &DreamOptions::default())
            .await
            .unwrap();
        assert_eq!(report.experiences_consolidated, 0);
        assert_eq!(report.few_shots_updated, 0);
    }

    #[tokio::test]
    async fn test_doubled_run_selects_at_most_ten() {
        // 200 correct experiences across 13 clusters, doubled budget.
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        seed_correct(&store, "default", 200);

        let mut unit = LearningUnit::new("unit-a", "default");
        unit.metadata.version = 1;
        store.save_learning_unit(&unit).unwrap();

        // 13 synthesis replies with distinct confidences, then a hierarchy.
        let mut replies: Vec<String> = (0..13)
            .map(|i| synthesis_reply(&format!("strategy {i}"), 0.95 - i as f64 * 0.05))
            .collect();
        replies.push("L1≔items≔⟨scanning⟩".to_string());
        let client = Arc::new(ScriptedClient::new(
            replies.iter().map(String::as_str).collect(),
        ));

        let registry = registry_with(Arc::new(ModuloAlgo::new(13)));
        let options = DreamOptions {
            algorithm: Some("testv1".to_string()),
            doubled: true,
            preserve_originals: false,
        };
        let report = consolidator(store.clone(), client, registry)
            .dream("default", "unit-a", &options)
            .await
            .unwrap();

        assert_eq!(report.few_shots_updated, 10);
        assert_eq!(report.experiences_consolidated, 200);
        assert_eq!(report.unit_version, 2);

        let unit = store.get_learning_unit("default", "unit-a").unwrap().unwrap();
        assert_eq!(unit.metadata.version, 2);
        assert_eq!(unit.absorbed_experience_ids.len(), 200);
        assert_eq!(unit.metadata.by_puzzle_size.get(&4), Some(&200));
        assert_eq!(
            store.get_few_shots("default", "unit-a", 10).unwrap().len(),
            10
        );
        // Highest-confidence strategies were selected.
        let shots = store.get_few_shots("default", "unit-a", 10).unwrap();
        assert_eq!(shots[0].strategy_name.as_deref(), Some("strategy 0"));
    }

    #[tokio::test]
    async fn test_preserve_originals_allows_repeated_dreams() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        let ids = seed_correct(&store, "default", 20);

        let replies = vec![synthesis_reply("s", 0.8)];
        let preserve = DreamOptions {
            preserve_originals: true,
            ..DreamOptions::default()
        };

        for unit in ["unit-1", "unit-2"] {
            let client = Arc::new(ScriptedClient::new(
                replies.iter().map(String::as_str).collect(),
            ));
            let registry = registry_with(Arc::new(ModuloAlgo::new(3)));
            consolidator(store.clone(), client, registry)
                .dream("default", unit, &preserve)
                .await
                .unwrap();
        }

        assert_eq!(store.unit_experiences("unit-1").unwrap().len(), ids.len());
        assert_eq!(store.unit_experiences("unit-2").unwrap().len(), ids.len());
        assert_eq!(store.get_unconsolidated("default").unwrap().len(), ids.len());

        // A third run without preservation consumes the pool.
        let client = Arc::new(ScriptedClient::new(
            replies.iter().map(String::as_str).collect(),
        ));
        let registry = registry_with(Arc::new(ModuloAlgo::new(3)));
        consolidator(store.clone(), client, registry)
            .dream("default", "unit-3", &DreamOptions::default())
            .await
            .unwrap();
        assert!(store.get_unconsolidated("default").unwrap().is_empty());
        assert_eq!(store.unit_experiences("unit-3").unwrap().len(), ids.len());
    }

    #[tokio::test]
    async fn test_synthesis_failure_falls_back_to_skeletons() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        seed_correct(&store, "default", 10);

        let client = Arc::new(ScriptedClient::with_steps(vec![ScriptStep::Fail(
            "llm down".to_string(),
        )]));
        let registry = registry_with(Arc::new(ModuloAlgo::new(2)));
        let report = consolidator(store.clone(), client, registry)
            .dream(
                "default",
                "unit-a",
                &DreamOptions {
                    algorithm: Some("testv1".to_string()),
                    ..DreamOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(report.fallback_taken);
        assert!(report.few_shots_updated > 0);
        // Skeleton patterns carry the cluster label as the strategy name.
        let shots = store.get_few_shots("default", "unit-a", 10).unwrap();
        assert!(shots[0].strategy_name.as_deref().unwrap().starts_with("bucket"));
        // The hierarchy fallback stores an empty record.
        let hierarchy = store.get_hierarchy("default", "unit-a").unwrap().unwrap();
        assert!(hierarchy.is_empty());
    }

    #[tokio::test]
    async fn test_secondary_refinement_in_doubled_mode() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        seed_correct(&store, "default", 30);

        // 3 clusters → 3 syntheses, then the refinement call, then the
        // hierarchy call.
        let replies = vec![
            synthesis_reply("s1", 0.9),
            synthesis_reply("s2", 0.8),
            synthesis_reply("s3", 0.7),
            format!(
                "{}\n\n{}",
                synthesis_reply("extra-a", 0.6),
                synthesis_reply("extra-b", 0.5)
            ),
            "L0≔items≔⟨x⟩".to_string(),
        ];
        let client = Arc::new(ScriptedClient::new(
            replies.iter().map(String::as_str).collect(),
        ));
        let registry = registry_with(Arc::new(ModuloAlgo::new(3)));
        let report = consolidator(store.clone(), client.clone(), registry)
            .dream(
                "default",
                "unit-a",
                &DreamOptions {
                    algorithm: Some("testv1".to_string()),
                    doubled: true,
                    preserve_originals: false,
                },
            )
            .await
            .unwrap();

        // 3 original + 2 refined patterns, all within the doubled budget.
        assert_eq!(report.few_shots_updated, 5);
        let calls = client.calls.lock().unwrap();
        let refinement = calls
            .iter()
            .find(|c| c.contains("ADDITIONAL"))
            .expect("refinement call issued");
        // The request is capped at min(budget.max, patterns so far) = 3.
        assert!(refinement.contains("up to 3"));
    }

    #[tokio::test]
    async fn test_unit_lock_serialises_dreams_against_plays() {
        let locks = Arc::new(UnitLocks::new());
        let play = locks.play_guard("p", "u").await;
        // Concurrent plays on the same unit are fine.
        let play2 = locks.play_guard("p", "u").await;

        let locks2 = locks.clone();
        let dream = tokio::spawn(async move { locks2.dream_guard("p", "u").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dream.is_finished());

        // A different unit is independent.
        let _other = locks.dream_guard("p", "other").await;

        drop(play);
        drop(play2);
        tokio::time::timeout(Duration::from_millis(200), dream)
            .await
            .expect("lock released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_algorithm_is_an_error() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        seed_correct(&store, "default", 3);
        let client = Arc::new(ScriptedClient::new(vec!["unused"]));
        let registry = registry_with(Arc::new(ModuloAlgo::new(2)));
        let err = consolidator(store, client, registry)
            .dream(
                "default",
                "unit-a",
                &DreamOptions {
                    algorithm: Some("ghostv9".to_string()),
                    ..DreamOptions::default()
                },
            )
            .await;
        assert!(err.is_err());
    }
}
