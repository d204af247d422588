//! Versioned registry of clustering algorithms.
//!
//! The registry is an explicit value threaded through the consolidator, not
//! a process-wide singleton. Learning units record the identifier of the
//! algorithm that produced them; `map_legacy_unit` upgrades unit names
//! minted before identifiers existed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::{is_identifier, ClusteringAlgorithm};

/// Registry of clustering algorithms keyed by (name, version).
#[derive(Default)]
pub struct ClusterRegistry {
    algorithms: HashMap<(String, u32), Arc<dyn ClusteringAlgorithm>>,
    default_identifier: Option<String>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an algorithm. Registering the same (name, version) twice is
    /// an error; `is_default` makes this the registry default.
    pub fn register(
        &mut self,
        algorithm: Arc<dyn ClusteringAlgorithm>,
        is_default: bool,
    ) -> Result<()> {
        let info = algorithm.info().clone();
        let key = (info.name.clone(), info.version);
        if self.algorithms.contains_key(&key) {
            return Err(Error::Config(format!(
                "algorithm {} is already registered",
                info.identifier()
            )));
        }
        if is_default {
            self.default_identifier = Some(info.identifier());
        }
        self.algorithms.insert(key, algorithm);
        Ok(())
    }

    /// Get an algorithm by name; `None` version selects the highest
    /// registered one.
    pub fn get(&self, name: &str, version: Option<u32>) -> Option<Arc<dyn ClusteringAlgorithm>> {
        match version {
            Some(v) => self.algorithms.get(&(name.to_string(), v)).cloned(),
            None => self
                .algorithms
                .iter()
                .filter(|((n, _), _)| n.as_str() == name)
                .max_by_key(|((_, v), _)| *v)
                .map(|(_, algo)| algo.clone()),
        }
    }

    /// Resolve a `<lowername>v<n>` identifier.
    pub fn get_by_identifier(&self, identifier: &str) -> Option<Arc<dyn ClusteringAlgorithm>> {
        let (name, version) = split_identifier(identifier)?;
        self.get(&name, Some(version))
    }

    /// The latest version of every registered algorithm name.
    pub fn all_latest(&self) -> Vec<Arc<dyn ClusteringAlgorithm>> {
        let mut latest: HashMap<&str, &Arc<dyn ClusteringAlgorithm>> = HashMap::new();
        for ((name, version), algo) in &self.algorithms {
            match latest.get(name.as_str()) {
                Some(existing) if existing.info().version >= *version => {}
                _ => {
                    latest.insert(name.as_str(), algo);
                }
            }
        }
        let mut all: Vec<_> = latest.into_values().cloned().collect();
        all.sort_by_key(|a| a.info().identifier());
        all
    }

    /// The registry default, when one was marked.
    pub fn default_algorithm(&self) -> Option<Arc<dyn ClusteringAlgorithm>> {
        self.default_identifier
            .as_deref()
            .and_then(|id| self.get_by_identifier(id))
    }

    /// Insert the default algorithm identifier into a legacy unit name that
    /// lacks one.
    ///
    /// Unit names are `_`-separated segments; the identifier goes directly
    /// before the 8-digit date segment, and trailing `_2x` or numeric
    /// collision suffixes are preserved. Names already carrying an
    /// identifier pass through unchanged.
    pub fn map_legacy_unit(&self, unit_name: &str) -> String {
        let Some(default_id) = self.default_identifier.as_deref() else {
            return unit_name.to_string();
        };
        let segments: Vec<&str> = unit_name.split('_').collect();
        if segments.iter().any(|s| is_identifier(s)) {
            return unit_name.to_string();
        }

        let insert_at = segments
            .iter()
            .position(|s| is_date_segment(s))
            .unwrap_or_else(|| {
                // No date segment: insert before any trailing `2x` or
                // numeric collision suffixes.
                let mut at = segments.len();
                while at > 0 && is_suffix_segment(segments[at - 1]) {
                    at -= 1;
                }
                at
            });

        let mut out: Vec<&str> = Vec::with_capacity(segments.len() + 1);
        out.extend(&segments[..insert_at]);
        out.push(default_id);
        out.extend(&segments[insert_at..]);
        out.join("_")
    }
}

fn split_identifier(identifier: &str) -> Option<(String, u32)> {
    if !is_identifier(identifier) {
        return None;
    }
    let v_pos = identifier.rfind('v')?;
    let name = identifier[..v_pos].to_string();
    let version = identifier[v_pos + 1..].parse().ok()?;
    Some((name, version))
}

fn is_date_segment(s: &str) -> bool {
    s.len() == 8 && s.chars().all(|c| c.is_ascii_digit())
}

fn is_suffix_segment(s: &str) -> bool {
    s == "2x" || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) && s.len() < 8)
}
