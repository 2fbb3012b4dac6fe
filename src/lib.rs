//! # proxy-rotor
//!
//! Keeps a pool of HTTP proxies scored and rotated for a crawler.
//!
//! Proxies are probed concurrently and scored by latency, low scorers are
//! evicted, and requests sent through [`RotationMiddleware`] each pick a
//! random fresh proxy from the pool. A failing proxy is rescored and
//! blacklisted, and the request moves on to a substitute.
//!
//! Acquisition and scoring runs are started by the [`Scheduler`] or
//! submitted on demand through [`JobRunner`]. Both are deduplicated across
//! processes with TTL locks held in a shared [`KvStore`], and a
//! [`SingletonLock`] keeps a single scheduler alive per deployment.

pub mod acquire;
pub mod blacklist;
pub mod config;
pub mod error;
pub mod jobs;
pub mod kv;
pub mod middleware;
pub mod mutex;
pub mod probe;
pub mod proxy;
pub mod rotation;
pub mod scheduler;
pub mod scorer;
pub mod store;

pub use acquire::{Acquirer, SourceListAcquirer};
pub use config::{EngineConfig, EngineConfigBuilder, FreshnessQuery, ScoringConfig};
pub use error::{NoProxyAvailable, PoolError, Result};
pub use jobs::{JobHandle, JobOutput, JobRunner, JobStatus, Submission};
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use middleware::RotationMiddleware;
pub use mutex::{DistributedMutex, JobKey, LockToken, ProcessLiveness, SingletonLock};
pub use probe::{HttpProber, Probe, ProbeResult};
pub use proxy::{NewProxy, Proxy, Score};
pub use rotation::RotationSelector;
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerState};
pub use scorer::{ProbeTarget, Scorer, ScoringReport};
pub use store::{MemoryStore, ProxyStore, SqliteStore};
