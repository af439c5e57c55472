//! Named planner strategies.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::PlannerError;
use crate::strategy::{DefaultStrategy, PlannerStrategy, SequentialThinkingStrategy};

pub type StrategyFactory = Arc<dyn Fn() -> Arc<dyn PlannerStrategy> + Send + Sync>;

/// Maps strategy names to factories. Lookups ignore case, `-` and `_`, so
/// `sequentialThinking` and `sequential_thinking` name the same strategy.
pub struct PlannerRegistry {
    factories: HashMap<String, StrategyFactory>,
    names: Vec<String>,
}

/// Factory for a strategy constructible with `Default`.
pub fn factory_of<S>() -> StrategyFactory
where
    S: PlannerStrategy + Default + 'static,
{
    Arc::new(|| -> Arc<dyn PlannerStrategy> { Arc::new(S::default()) })
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(['-', '_', ' '], "")
}

impl PlannerRegistry {
    /// A registry with the built-in strategies.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let builtins: [(&str, StrategyFactory); 2] = [
            (DefaultStrategy::NAME, factory_of::<DefaultStrategy>()),
            (
                SequentialThinkingStrategy::NAME,
                factory_of::<SequentialThinkingStrategy>(),
            ),
        ];
        for (name, factory) in builtins {
            registry.names.push(name.to_string());
            registry.factories.insert(normalize(name), factory);
        }
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            names: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: StrategyFactory) -> Result<(), PlannerError> {
        let key = normalize(name);
        if key.is_empty() || self.factories.contains_key(&key) {
            return Err(PlannerError::DuplicateStrategy(name.to_string()));
        }
        self.factories.insert(key, factory);
        self.names.push(name.to_string());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize(name))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn try_create(&self, name: &str) -> Result<Arc<dyn PlannerStrategy>, PlannerError> {
        self.factories
            .get(&normalize(name))
            .map(|factory| factory())
            .ok_or_else(|| PlannerError::UnknownStrategy(name.to_string()))
    }

    /// Build `name`, falling back to the default strategy with a warning.
    pub fn create(&self, name: &str) -> Arc<dyn PlannerStrategy> {
        match self.try_create(name) {
            Ok(strategy) => strategy,
            Err(err) => {
                warn!(%err, fallback = DefaultStrategy::NAME, "Using default planner strategy");
                self.try_create(DefaultStrategy::NAME)
                    .unwrap_or_else(|_| Arc::new(DefaultStrategy))
            }
        }
    }
}

impl Default for PlannerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_in_any_spelling() {
        let registry = PlannerRegistry::new();
        assert_eq!(registry.create("default").name(), "default");
        assert_eq!(registry.create("sequentialThinking").name(), "sequential_thinking");
        assert_eq!(registry.create("sequential-thinking").name(), "sequential_thinking");
        assert_eq!(registry.names().len(), 2);
    }

    #[test]
    fn unknown_falls_back_to_default() {
        let registry = PlannerRegistry::new();
        assert!(matches!(
            registry.try_create("tree_of_thought"),
            Err(PlannerError::UnknownStrategy(_))
        ));
        assert_eq!(registry.create("tree_of_thought").name(), "default");
        assert_eq!(PlannerRegistry::empty().create("anything").name(), "default");
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = PlannerRegistry::new();
        let err = registry
            .register("Default", factory_of::<DefaultStrategy>())
            .unwrap_err();
        assert!(err.to_string().contains("Default"));

        registry
            .register("custom", factory_of::<SequentialThinkingStrategy>())
            .unwrap();
        assert!(registry.contains("CUSTOM"));
        assert_eq!(registry.create("custom").name(), "sequential_thinking");
    }
}
