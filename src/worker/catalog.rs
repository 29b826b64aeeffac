//! Read-only access to strategy definitions

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::grid::{StrategyConfig, StrategyId};

/// Source of strategy configurations, owned by the persistence layer
#[async_trait]
pub trait StrategyCatalog: Send + Sync {
    /// Configuration for one strategy, read once per engine start
    async fn get(&self, strategy_id: StrategyId) -> Result<StrategyConfig>;

    async fn list(&self) -> Result<Vec<StrategyConfig>>;
}

/// JSON file holding an array of strategy configurations.
///
/// The file is re-read on every lookup so edits apply to the next start.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<StrategyConfig>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Catalog(format!("cannot read {}: {}", self.path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Catalog(format!("invalid catalog {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl StrategyCatalog for FileCatalog {
    async fn get(&self, strategy_id: StrategyId) -> Result<StrategyConfig> {
        self.load()
            .await?
            .into_iter()
            .find(|c| c.strategy_id == strategy_id)
            .ok_or_else(|| Error::Catalog(format!("strategy {} not found", strategy_id)))
    }

    async fn list(&self) -> Result<Vec<StrategyConfig>> {
        self.load().await
    }
}

/// Fixed in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    strategies: BTreeMap<StrategyId, StrategyConfig>,
}

impl StaticCatalog {
    pub fn new(strategies: impl IntoIterator<Item = StrategyConfig>) -> Self {
        Self {
            strategies: strategies.into_iter().map(|c| (c.strategy_id, c)).collect(),
        }
    }
}

#[async_trait]
impl StrategyCatalog for StaticCatalog {
    async fn get(&self, strategy_id: StrategyId) -> Result<StrategyConfig> {
        self.strategies
            .get(&strategy_id)
            .cloned()
            .ok_or_else(|| Error::Catalog(format!("strategy {} not found", strategy_id)))
    }

    async fn list(&self) -> Result<Vec<StrategyConfig>> {
        Ok(self.strategies.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_file_catalog_lookup() {
        let path = std::env::temp_dir().join(format!("grid_worker_catalog_{}.json", std::process::id()));
        let strategies = vec![
            StrategyConfig::new(1, "BTC/USDT", dec!(0.01), 3, dec!(1), dec!(1.5)),
            StrategyConfig::new(2, "ETH/USDT", dec!(0.1), 5, dec!(0.5), dec!(1)).with_worker("w2"),
        ];
        std::fs::write(&path, serde_json::to_string(&strategies).unwrap()).unwrap();

        let catalog = FileCatalog::new(&path);
        assert_eq!(catalog.get(2).await.unwrap().worker_name.as_deref(), Some("w2"));
        assert_eq!(catalog.list().await.unwrap().len(), 2);
        assert!(matches!(catalog.get(3).await, Err(Error::Catalog(_))));

        std::fs::remove_file(&path).unwrap();
        assert!(catalog.get(1).await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticCatalog::new([StrategyConfig::new(4, "SOL/USDT", dec!(1), 2, dec!(1), dec!(1))]);
        assert_eq!(catalog.get(4).await.unwrap().symbol, "SOL/USDT");
        assert!(catalog.get(5).await.is_err());
    }
}
