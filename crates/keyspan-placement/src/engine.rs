//! Assembly of the placement engine from its collaborators.

use std::sync::Arc;

use crate::bundle::BundleController;
use crate::config::PlacementConfig;
use crate::kvstore::KvStore;
use crate::labeler::RegionLabeler;
use crate::placement::manager::RuleManager;
use crate::region::RegionDirectory;
use crate::storage::RuleStorage;
use crate::suspect::SuspectRegions;
use crate::types::PlacementResult;

/// One placement engine instance: rule manager, labeler, suspect tracker and
/// the controller that mutates them.
pub struct PlacementEngine {
    config: PlacementConfig,
    rules: Arc<RuleManager>,
    labels: Arc<RegionLabeler>,
    suspects: Arc<SuspectRegions>,
    controller: BundleController,
}

impl PlacementEngine {
    /// Builds every component over `store`, loads persisted rules and label
    /// rules, and materializes the reserved defaults when they are missing.
    pub fn bootstrap(
        config: PlacementConfig,
        store: Arc<dyn KvStore>,
        regions: Arc<dyn RegionDirectory>,
    ) -> PlacementResult<Self> {
        config.validate()?;
        let storage = Arc::new(RuleStorage::new(store, &config));

        let rules = Arc::new(RuleManager::new(storage.clone(), &config));
        rules.load()?;
        let labels = Arc::new(RegionLabeler::new(storage, &config));
        labels.load()?;
        let suspects = Arc::new(SuspectRegions::new());

        let controller =
            BundleController::new(rules.clone(), labels.clone(), regions, suspects.clone());
        tracing::info!("Placement engine ready under {}", config.key_root);
        Ok(Self {
            config,
            rules,
            labels,
            suspects,
            controller,
        })
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Read access to placement rules.
    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    /// Read access to region label rules.
    pub fn labels(&self) -> &Arc<RegionLabeler> {
        &self.labels
    }

    /// The suspect region tracker drained by the scheduler.
    pub fn suspects(&self) -> &Arc<SuspectRegions> {
        &self.suspects
    }

    /// Entry point for every mutation.
    pub fn controller(&self) -> &BundleController {
        &self.controller
    }

    /// Stops the engine. Pending suspects are dropped with it.
    pub fn shutdown(self) {
        tracing::info!(
            "Placement engine shutting down with {} suspect regions pending",
            self.suspects.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use crate::region::MemoryRegionDirectory;

    #[test]
    fn test_bootstrap_materializes_defaults_once() {
        let store = Arc::new(MemoryKvStore::new());
        let regions = Arc::new(MemoryRegionDirectory::new());
        let engine =
            PlacementEngine::bootstrap(PlacementConfig::default(), store.clone(), regions.clone())
                .unwrap();
        assert_eq!(engine.rules().get_all_rules().len(), 1);
        assert_eq!(engine.labels().get_all_label_rules().len(), 1);
        let persisted = store.len();
        assert_eq!(persisted, 2);
        engine.shutdown();

        let again = PlacementEngine::bootstrap(PlacementConfig::default(), store.clone(), regions)
            .unwrap();
        assert_eq!(store.len(), persisted);
        assert!(again.rules().is_fully_covered());
    }

    #[test]
    fn test_bootstrap_rejects_bad_config() {
        let config = PlacementConfig {
            key_root: String::new(),
            ..PlacementConfig::default()
        };
        let result = PlacementEngine::bootstrap(
            config,
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryRegionDirectory::new()),
        );
        assert!(result.is_err());
    }
}
