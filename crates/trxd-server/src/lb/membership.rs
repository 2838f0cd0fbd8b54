use std::collections::BTreeMap;

use parking_lot::Mutex;

/// One (pool, port) registered with the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    pub pool: String,
    pub port: u16,
    pub conn_limit: u32,
    pub conn_limit_basis: String,
}

/// Ports currently registered, per pool.
///
/// A single lock guards every insert and erase, so membership changes made
/// by different listeners never interleave.
#[derive(Debug, Default)]
pub struct PoolMembership {
    pools: Mutex<BTreeMap<String, BTreeMap<u16, PoolMember>>>,
}

impl PoolMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the port was already a member of the pool.
    pub fn insert(&self, member: PoolMember) -> bool {
        let mut pools = self.pools.lock();
        let ports = pools.entry(member.pool.clone()).or_default();
        if ports.contains_key(&member.port) {
            return false;
        }
        ports.insert(member.port, member);
        true
    }

    pub fn remove(&self, pool: &str, port: u16) -> Option<PoolMember> {
        let mut pools = self.pools.lock();
        let ports = pools.get_mut(pool)?;
        let removed = ports.remove(&port);
        if ports.is_empty() {
            pools.remove(pool);
        }
        removed
    }

    pub fn contains(&self, pool: &str, port: u16) -> bool {
        self.pools
            .lock()
            .get(pool)
            .is_some_and(|ports| ports.contains_key(&port))
    }

    /// Ports registered in `pool`, ascending.
    pub fn ports(&self, pool: &str) -> Vec<u16> {
        self.pools
            .lock()
            .get(pool)
            .map(|ports| ports.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
