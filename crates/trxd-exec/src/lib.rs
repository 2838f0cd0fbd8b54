//! Transaction-scoped concurrent execution for trxd.
//!
//! # Overview
//!
//! - **[`WorkerPool`]**: fixed worker threads per task class, FIFO queue,
//!   front insertion for throttled retries, optional task combining
//! - **[`BoosterPool`]**: shared overflow threads lent to backlogged pools
//! - **[`PoolRegistry`]**: pools by [`TaskClass`], built once at start-up
//! - **[`Executor`]**: submit tasks, wait for all of them, first failure wins
//! - **[`ThrottlingExecutor`]**: admission control for top-level work
//! - **[`TaskContext`]** / **[`Transaction`]**: per-task context with
//!   deterministic sequence ids for diagnostics
//!
//! # Example
//!
//! ```
//! use trxd_exec::{Executor, PoolRegistry, TaskClass, Transaction, WorkerPoolConfig};
//!
//! let registry = PoolRegistry::builder()
//!     .pool(WorkerPoolConfig::new(TaskClass::TRANSACTION, 4).with_combine_tasks(true))
//!     .build()
//!     .unwrap();
//!
//! let executor = Executor::new(&registry, &TaskClass::TRANSACTION)
//!     .with_transaction(Transaction::new(1));
//! executor
//!     .execute(|ctx| {
//!         assert_eq!(ctx.sequence_id(), vec![0]);
//!         Ok(())
//!     })
//!     .unwrap();
//! executor.wait(true).unwrap();
//! registry.shutdown();
//! ```

pub mod booster;
pub mod context;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod task;
pub mod throttling;

pub use booster::{BoosterConfig, BoosterPool, BoosterStats};
pub use context::{current, current_transaction, ContextScope, TaskContext, Transaction};
pub use executor::Executor;
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig};
pub use registry::{PoolRegistry, PoolRegistryBuilder};
pub use task::{Task, TaskClass, TaskFn};
pub use throttling::{Admission, ThrottlingExecutor};
