//! Background loop deciding when acquisition and scoring run.

use crate::config::{EngineConfig, ScoringConfig};
use crate::error::Result;
use crate::jobs::{current_runtime, JobRunner, Submission};
use crate::mutex::{Claim, SingletonLock};
use crate::store::ProxyStore;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Starting,
    WaitInitialDelay,
    CheckSingleton,
    CheckSettings,
    MaybeRunAcquisition,
    MaybeRunScoring,
    Sleep,
    Stopped,
}

/// Shortest pause between two passes, whatever the settings say.
pub const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Time to sleep between two passes, never below [`MIN_SLEEP`].
pub fn next_sleep(config: &ScoringConfig) -> Duration {
    config
        .acquisition_interval()
        .min(config.scoring_interval())
        .max(MIN_SLEEP)
}

/// What a pass asks the loop to do next.
enum Step {
    Sleep(Duration),
    Stop,
}

pub struct Scheduler {
    store: Arc<dyn ProxyStore>,
    jobs: Arc<JobRunner>,
    singleton: SingletonLock,
    initial_delay: Duration,
    fallback_sleep: Duration,
    crawl_type: String,
    state: Arc<RwLock<SchedulerState>>,
    settings: Option<ScoringConfig>,
    last_acquisition: Option<Instant>,
    last_scoring: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        jobs: Arc<JobRunner>,
        singleton: SingletonLock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            singleton,
            initial_delay: config.initial_delay,
            fallback_sleep: config.fallback_sleep,
            crawl_type: "all".to_string(),
            state: Arc::new(RwLock::new(SchedulerState::Starting)),
            settings: None,
            last_acquisition: None,
            last_scoring: None,
        }
    }

    /// Crawl type passed to scheduled acquisitions. Defaults to `all`.
    pub fn with_crawl_type(mut self, crawl_type: impl Into<String>) -> Self {
        self.crawl_type = crawl_type.into();
        self
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn start(self) -> Result<SchedulerHandle> {
        let runtime = current_runtime()?;
        let shutdown = CancellationToken::new();
        let state = Arc::clone(&self.state);

        info!(
            "Starting scheduler (initial delay {:?}, crawl type {})",
            self.initial_delay, self.crawl_type
        );
        let task = runtime.spawn(self.run(shutdown.clone()));
        Ok(SchedulerHandle {
            state,
            shutdown,
            task,
        })
    }

    fn set_state(&self, state: SchedulerState) {
        debug!("Scheduler state: {:?}", state);
        *self.state.write() = state;
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        self.set_state(SchedulerState::WaitInitialDelay);
        let mut running = self.pause(self.initial_delay, &shutdown).await;

        while running {
            let sleep = match panic::catch_unwind(AssertUnwindSafe(|| self.pass())) {
                Ok(Ok(Step::Sleep(sleep))) => sleep,
                Ok(Ok(Step::Stop)) => break,
                Ok(Err(e)) => {
                    error!("Scheduler pass failed: {}, retrying in {:?}", e, self.fallback_sleep);
                    self.fallback_sleep
                }
                Err(_) => {
                    error!("Scheduler pass panicked, retrying in {:?}", self.fallback_sleep);
                    self.fallback_sleep
                }
            };
            self.set_state(SchedulerState::Sleep);
            debug!("Scheduler sleeping for {:?}", sleep);
            running = self.pause(sleep, &shutdown).await;
        }

        match self.singleton.release() {
            Ok(true) => info!("Singleton lock {} released", self.singleton.key()),
            Ok(false) => {}
            Err(e) => error!("Failed to release singleton lock {}: {}", self.singleton.key(), e),
        }
        self.set_state(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }

    fn pass(&mut self) -> Result<Step> {
        self.set_state(SchedulerState::CheckSingleton);
        match self.singleton.claim()? {
            Claim::Acquired => {}
            Claim::HeldBy(holder) => {
                warn!(
                    "Scheduler already running as pid {} on {}, stopping",
                    holder.pid, holder.host
                );
                return Ok(Step::Stop);
            }
            Claim::Contended => {
                warn!("Singleton lock {} is contended, retrying", self.singleton.key());
                return Ok(Step::Sleep(self.fallback_sleep));
            }
        }

        self.set_state(SchedulerState::CheckSettings);
        let settings = self.store.load_config()?;
        match &self.settings {
            Some(previous) if *previous != settings => {
                info!("Scoring settings changed: {:?} -> {:?}", previous, settings)
            }
            Some(_) => {}
            None => info!("Scoring settings loaded: {:?}", settings),
        }
        if settings.acquisition_interval_s == 0 || settings.scoring_interval_s == 0 {
            warn!(
                "Zero interval in scoring settings (acquisition {}s, scoring {}s), pacing passes at {:?}",
                settings.acquisition_interval_s, settings.scoring_interval_s, MIN_SLEEP
            );
        }
        self.settings = Some(settings.clone());
        let now = Instant::now();

        self.set_state(SchedulerState::MaybeRunAcquisition);
        if settings.auto_acquisition && due(self.last_acquisition, settings.acquisition_interval(), now) {
            if self.jobs.is_acquisition_running(&self.crawl_type)? {
                info!("Acquisition already running, skipping");
            } else {
                match self.jobs.submit_acquisition(&self.crawl_type)? {
                    Submission::Accepted(handle) => {
                        info!("Scheduled acquisition {}", handle);
                        self.last_acquisition = Some(now);
                    }
                    Submission::Refused => info!("Acquisition already running, skipping"),
                }
            }
        }

        self.set_state(SchedulerState::MaybeRunScoring);
        if settings.auto_scoring && due(self.last_scoring, settings.scoring_interval(), now) {
            let handle = self.jobs.submit_scoring()?;
            info!("Scheduled scoring {}", handle);
            self.last_scoring = Some(now);
        }

        Ok(Step::Sleep(next_sleep(&settings)))
    }
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        Some(last) => now.duration_since(last) >= interval,
        None => true,
    }
}

/// Running scheduler loop.
pub struct SchedulerHandle {
    state: Arc<RwLock<SchedulerState>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Interrupt the loop and wait until it has released the singleton lock.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
    }
}
