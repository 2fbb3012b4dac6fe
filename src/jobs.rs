//! Job submission: acquisition and scoring runs, deduplicated across
//! processes through job locks.

use crate::acquire::Acquirer;
use crate::error::{PoolError, Result};
use crate::mutex::{DistributedMutex, JobKey};
use crate::scorer::{Scorer, ScoringReport};
use crate::store::ProxyStore;

use log::{error, info, warn};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use uuid::Uuid;

/// Job name used for acquisition locks.
pub const ACQUISITION_JOB: &str = "collectip";

/// Identifies a submitted job within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(Uuid);

impl JobHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Acquired { found: usize, created: usize },
    Scored(ScoringReport),
    Custom(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded(JobOutput),
    Failed(String),
}

/// Answer to a deduplicated submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted(JobHandle),
    /// An identical job is already running somewhere.
    Refused,
}

impl Submission {
    pub fn handle(self) -> Option<JobHandle> {
        match self {
            Submission::Accepted(handle) => Some(handle),
            Submission::Refused => None,
        }
    }

    pub fn is_refused(self) -> bool {
        self == Submission::Refused
    }
}

type StatusTable = Arc<RwLock<HashMap<JobHandle, JobStatus>>>;

/// Runs jobs on the tokio runtime and tracks their status.
pub struct JobRunner {
    store: Arc<dyn ProxyStore>,
    scorer: Scorer,
    acquirer: Arc<dyn Acquirer>,
    mutex: DistributedMutex,
    acquisition_ttl: Duration,
    jobs: StatusTable,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        scorer: Scorer,
        acquirer: Arc<dyn Acquirer>,
        mutex: DistributedMutex,
        acquisition_ttl: Duration,
    ) -> Self {
        Self {
            store,
            scorer,
            acquirer,
            mutex,
            acquisition_ttl,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Lock key of an acquisition run for `crawl_type`.
    pub fn acquisition_key(crawl_type: &str) -> JobKey {
        JobKey::new(ACQUISITION_JOB, &json!({ "crawl_type": crawl_type }))
    }

    /// Whether an acquisition for `crawl_type` is running in any process.
    pub fn is_acquisition_running(&self, crawl_type: &str) -> Result<bool> {
        self.mutex.is_held(Self::acquisition_key(crawl_type).as_str())
    }

    /// Start an acquisition run unless one for the same crawl type is running.
    pub fn submit_acquisition(&self, crawl_type: &str) -> Result<Submission> {
        let store = Arc::clone(&self.store);
        let acquirer = Arc::clone(&self.acquirer);
        let crawl_type_owned = crawl_type.to_string();

        self.submit(&Self::acquisition_key(crawl_type), self.acquisition_ttl, move || async move {
            let found = acquirer.acquire(&crawl_type_owned).await?;
            let total = found.len();
            let mut created = 0;
            for proxy in found {
                let address = proxy.address.clone();
                match store.upsert(proxy) {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to store proxy {}: {}", address, e),
                }
            }
            info!("Acquisition stored {} proxies, {} new", total, created);
            Ok(JobOutput::Acquired {
                found: total,
                created,
            })
        })
    }

    /// Start a scoring run over the whole pool. Not deduplicated: scoring
    /// twice is harmless.
    pub fn submit_scoring(&self) -> Result<JobHandle> {
        let runtime = current_runtime()?;
        let store = Arc::clone(&self.store);
        let scorer = self.scorer.clone();
        let handle = JobHandle::new();
        self.jobs.write().insert(handle, JobStatus::Pending);

        let jobs = Arc::clone(&self.jobs);
        runtime.spawn(run_tracked(jobs, handle, async move {
            let config = store.load_config()?;
            let report = scorer.run_cycle(&*store, config.min_score()).await?;
            Ok(JobOutput::Scored(report))
        }));
        info!("Scoring job submitted: {}", handle);
        Ok(handle)
    }

    /// Start `work` under the job lock `key`, unless that lock is held.
    ///
    /// The lock is released when the work finishes, or expires after `ttl`.
    pub fn submit<F, Fut>(&self, key: &JobKey, ttl: Duration, work: F) -> Result<Submission>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput>> + Send + 'static,
    {
        let runtime = current_runtime()?;
        let Some(token) = self.mutex.acquire(key.as_str(), ttl)? else {
            warn!("Job {} is already running, skipping", key.name());
            return Ok(Submission::Refused);
        };

        let handle = JobHandle::new();
        self.jobs.write().insert(handle, JobStatus::Pending);

        let jobs = Arc::clone(&self.jobs);
        let mutex = self.mutex.clone();
        let lock_key = key.clone();
        runtime.spawn(async move {
            run_tracked(jobs, handle, work()).await;
            match mutex.release(lock_key.as_str(), &token) {
                Ok(true) => {}
                Ok(false) => warn!("Lock for job {} expired before it finished", lock_key.name()),
                Err(e) => error!("Failed to release lock for job {}: {}", lock_key.name(), e),
            }
        });
        info!("Job {} submitted: {}", key.name(), handle);
        Ok(Submission::Accepted(handle))
    }

    pub fn status(&self, handle: JobHandle) -> Option<JobStatus> {
        self.jobs.read().get(&handle).cloned()
    }

    /// Names of jobs whose locks are currently held, in any process.
    pub fn running_jobs(&self) -> Result<Vec<String>> {
        Ok(self
            .mutex
            .held_keys(JobKey::PREFIX)?
            .iter()
            .filter_map(|key| JobKey::name_of(key).map(str::to_string))
            .collect())
    }
}

pub(crate) fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| PoolError::Runtime(e.to_string()))
}

/// Run `work` in its own task so a panic is recorded as a failure.
async fn run_tracked<Fut>(jobs: StatusTable, handle: JobHandle, work: Fut)
where
    Fut: Future<Output = Result<JobOutput>> + Send + 'static,
{
    jobs.write().insert(handle, JobStatus::Running);
    let status = match tokio::spawn(work).await {
        Ok(Ok(output)) => JobStatus::Succeeded(output),
        Ok(Err(e)) => {
            error!("Job {} failed: {}", handle, e);
            JobStatus::Failed(e.to_string())
        }
        Err(e) => {
            error!("Job {} aborted: {}", handle, e);
            JobStatus::Failed(format!("job aborted: {e}"))
        }
    };
    jobs.write().insert(handle, status);
}
