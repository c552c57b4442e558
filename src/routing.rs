//! Candidate selection: alias resolution, routing strategies, and the
//! per-request provider ordering the router walks.
//!
//! The round-robin counters are process-wide and intentionally relaxed:
//! lost updates under contention are acceptable, approximate fairness is
//! the contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashMap;

use crate::registry::{ProviderDescriptor, ProviderRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    FirstAvailable,
    Random,
    #[default]
    RoundRobin,
    /// Reserved; currently routes like `first-available`.
    Latency,
}

/// Two-level alias table: friendly model -> provider -> native model.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<String, HashMap<String, String>>,
}

impl AliasTable {
    pub fn new(aliases: HashMap<String, HashMap<String, String>>) -> Self {
        Self { aliases }
    }

    /// Total by design: unknown friendly names pass through so providers
    /// can accept their own native names directly.
    pub fn resolve(&self, friendly: &str, provider: &str) -> String {
        self.aliases
            .get(friendly)
            .and_then(|per_provider| per_provider.get(provider))
            .cloned()
            .unwrap_or_else(|| friendly.to_string())
    }

    pub fn friendly_models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.aliases.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Per-model rotation counters for the round-robin strategy.
#[derive(Debug, Default)]
pub struct RoundRobinCounters {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobinCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post-increment the counter for `model`, reduced modulo `len`.
    pub fn next(&self, model: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let entry = self
            .counters
            .entry(model.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        entry.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Orders candidate providers for one request.
pub struct CandidateSelector {
    registry: Arc<ProviderRegistry>,
    strategy: RoutingStrategy,
    fallback_chain: Option<Vec<String>>,
    counters: RoundRobinCounters,
}

impl CandidateSelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        strategy: RoutingStrategy,
        fallback_chain: Option<Vec<String>>,
    ) -> Self {
        Self {
            registry,
            strategy,
            fallback_chain,
            counters: RoundRobinCounters::new(),
        }
    }

    /// Candidates for a request, most preferred first.
    ///
    /// A pinned provider short-circuits everything: the named provider if
    /// enabled, otherwise no candidates at all. The strategy only reorders
    /// the pool, it never adds or removes members.
    pub fn candidates(
        &self,
        model: &str,
        pinned: Option<&str>,
    ) -> Vec<Arc<ProviderDescriptor>> {
        if let Some(name) = pinned {
            return self.registry.get(name).into_iter().collect();
        }

        let mut pool: Vec<Arc<ProviderDescriptor>> = match &self.fallback_chain {
            Some(chain) => chain
                .iter()
                .filter_map(|name| self.registry.get(name))
                .collect(),
            None => self.registry.list(),
        };

        if pool.len() <= 1 {
            return pool;
        }

        match self.strategy {
            RoutingStrategy::FirstAvailable | RoutingStrategy::Latency => {}
            RoutingStrategy::Random => {
                pool.shuffle(&mut rand::thread_rng());
            }
            RoutingStrategy::RoundRobin => {
                let offset = self.counters.next(model, pool.len());
                pool.rotate_left(offset);
            }
        }

        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use std::collections::HashSet;

    fn registry() -> Arc<ProviderRegistry> {
        let yaml = r#"
providers:
  groq:
    api_key: gk
    models: [llama-3.1-70b-versatile]
  together:
    api_key: tk
    models: [meta-llama/Llama-3.1-70B-Instruct-Turbo]
  cerebras:
    api_key: ck
    models: [llama3.1-70b]
"#;
        Arc::new(ProviderRegistry::from_config(
            &GatewayConfig::from_yaml(yaml).unwrap(),
        ))
    }

    #[test]
    fn alias_resolution_falls_through_to_friendly_name() {
        let table = AliasTable::new(HashMap::from([(
            "llama-70b".to_string(),
            HashMap::from([("groq".to_string(), "llama-3.1-70b-versatile".to_string())]),
        )]));
        assert_eq!(table.resolve("llama-70b", "groq"), "llama-3.1-70b-versatile");
        assert_eq!(table.resolve("llama-70b", "together"), "llama-70b");
        assert_eq!(table.resolve("gpt-oss-120b", "groq"), "gpt-oss-120b");
    }

    #[test]
    fn pinned_provider_is_the_only_candidate() {
        let selector =
            CandidateSelector::new(registry(), RoutingStrategy::FirstAvailable, None);
        let picked = selector.candidates("m", Some("together"));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "together");

        // Pinned but unknown/disabled provider yields no candidates.
        assert!(selector.candidates("m", Some("sambanova")).is_empty());
    }

    #[test]
    fn fallback_chain_filters_and_orders_the_pool() {
        let selector = CandidateSelector::new(
            registry(),
            RoutingStrategy::FirstAvailable,
            Some(vec![
                "cerebras".to_string(),
                "missing".to_string(),
                "groq".to_string(),
            ]),
        );
        let names: Vec<String> = selector
            .candidates("m", None)
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, ["cerebras", "groq"]);
    }

    #[test]
    fn round_robin_rotates_per_model() {
        let selector = CandidateSelector::new(registry(), RoutingStrategy::RoundRobin, None);

        // Each provider reaches position 0 within N consecutive requests.
        let mut seen_first = HashSet::new();
        for _ in 0..3 {
            seen_first.insert(selector.candidates("llama-70b", None)[0].name.clone());
        }
        assert_eq!(seen_first.len(), 3);

        // The counter is per-model: a different model starts over.
        let other = selector.candidates("other-model", None);
        assert_eq!(other[0].name, "groq");
    }

    #[test]
    fn random_strategy_keeps_the_pool_intact() {
        let selector = CandidateSelector::new(registry(), RoutingStrategy::Random, None);
        let names: HashSet<String> = selector
            .candidates("m", None)
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(
            names,
            HashSet::from(["groq".into(), "together".into(), "cerebras".into()])
        );
    }
}
