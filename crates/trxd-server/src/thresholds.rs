//! Process-wide limits that trigger a graceful shutdown.
//!
//! A long-running server is restarted by its supervisor once it has served
//! a configured number of transactions or grown past a memory ceiling.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ShutdownThresholds;

const PAGE_SIZE: u64 = 4096;

/// Reports the resident set size of the process.
pub trait MemorySampler: Send + Sync {
    fn resident_mb(&self) -> Option<u64>;
}

/// Reads the resident page count from `/proc/self/statm`.
#[derive(Debug, Clone)]
pub struct StatmSampler {
    path: PathBuf,
}

impl Default for StatmSampler {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/self/statm"),
        }
    }
}

impl StatmSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemorySampler for StatmSampler {
    fn resident_mb(&self) -> Option<u64> {
        let statm = std::fs::read_to_string(&self.path).ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * PAGE_SIZE / (1024 * 1024))
    }
}

/// Which limit was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdBreach {
    MaxTransactions { served: u64, max: u64 },
    Memory { resident_mb: u64, ceiling_mb: u64 },
}

impl fmt::Display for ThresholdBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxTransactions { served, max } => {
                write!(f, "served {} transactions (max {})", served, max)
            }
            Self::Memory { resident_mb, ceiling_mb } => {
                write!(f, "resident memory {} MB over ceiling {} MB", resident_mb, ceiling_mb)
            }
        }
    }
}

/// Counts served transactions and checks the limits after each one.
pub struct ThresholdMonitor {
    thresholds: ShutdownThresholds,
    sampler: Box<dyn MemorySampler>,
    served: AtomicU64,
}

impl ThresholdMonitor {
    pub fn new(thresholds: ShutdownThresholds) -> Self {
        Self::with_sampler(thresholds, Box::new(StatmSampler::new()))
    }

    pub fn with_sampler(thresholds: ShutdownThresholds, sampler: Box<dyn MemorySampler>) -> Self {
        Self {
            thresholds,
            sampler,
            served: AtomicU64::new(0),
        }
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// Counts one transaction and reports the first limit now crossed.
    pub fn record_transaction(&self) -> Option<ThresholdBreach> {
        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(max) = self.thresholds.max_transactions {
            if served >= max {
                return Some(ThresholdBreach::MaxTransactions { served, max });
            }
        }
        let ceiling_mb = self.thresholds.memory_ceiling_mb?;
        let resident_mb = self.sampler.resident_mb()?;
        (resident_mb > ceiling_mb).then_some(ThresholdBreach::Memory {
            resident_mb,
            ceiling_mb,
        })
    }
}

impl fmt::Debug for ThresholdMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdMonitor")
            .field("thresholds", &self.thresholds)
            .field("served", &self.served())
            .finish()
    }
}
