use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;
use trxd_common::Result;

use crate::booster::{BoosterConfig, BoosterPool, BoosterStats};
use crate::pool::{PoolStats, WorkerPool, WorkerPoolConfig};
use crate::task::TaskClass;

/// Worker pools by task class, plus the optional shared booster.
///
/// Built once at process start and handed to everything that submits work.
/// A class without a pool is disabled and its tasks run inline.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: BTreeMap<TaskClass, Arc<WorkerPool>>,
    booster: Option<BoosterPool>,
}

#[derive(Debug, Default)]
pub struct PoolRegistryBuilder {
    pools: Vec<WorkerPoolConfig>,
    booster: Option<BoosterConfig>,
}

impl PoolRegistryBuilder {
    /// Adds a pool. A later config for the same class replaces the earlier one.
    pub fn pool(mut self, config: WorkerPoolConfig) -> Self {
        self.pools.retain(|existing| existing.class != config.class);
        self.pools.push(config);
        self
    }

    pub fn booster(mut self, config: BoosterConfig) -> Self {
        self.booster = Some(config);
        self
    }

    /// Starts the booster and every pool.
    ///
    /// # Errors
    ///
    /// Fails if any configuration is invalid or a thread cannot be spawned.
    /// Pools already started are stopped again.
    pub fn build(self) -> Result<PoolRegistry> {
        let booster = self.booster.map(BoosterPool::new).transpose()?;
        let mut registry = PoolRegistry {
            pools: BTreeMap::new(),
            booster,
        };

        for config in self.pools {
            let booster = registry.booster.as_ref().map(|b| Arc::clone(b.shared()));
            let pool = WorkerPool::start(config, booster);
            match pool {
                Ok(pool) => {
                    registry.pools.insert(pool.class().clone(), pool);
                }
                Err(e) => {
                    registry.shutdown();
                    return Err(e);
                }
            }
        }

        info!(
            pools = registry.pools.len(),
            booster = registry.booster.as_ref().map(|b| b.size()).unwrap_or(0),
            "pool registry ready"
        );
        Ok(registry)
    }
}

impl PoolRegistry {
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::default()
    }

    pub fn get(&self, class: &TaskClass) -> Option<Arc<WorkerPool>> {
        self.pools.get(class).cloned()
    }

    pub fn is_enabled(&self, class: &TaskClass) -> bool {
        self.pools.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &TaskClass> {
        self.pools.keys()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.values().map(|pool| pool.stats()).collect()
    }

    pub fn booster_stats(&self) -> Option<BoosterStats> {
        self.booster.as_ref().map(BoosterPool::stats)
    }

    /// Stops every pool, then the booster.
    pub fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown();
        }
        if let Some(booster) = &self.booster {
            booster.shutdown();
        }
    }
}
