//! Configuration for the engine.
//!
//! [`EngineConfig`] is fixed at construction time. [`ScoringConfig`] is the
//! persisted operator-facing half, re-read by the scheduler every cycle.

use crate::proxy::Score;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Filter used to build the candidate list from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessQuery {
    /// Lowest score a proxy may have to be returned.
    pub min_score: Score,
    /// Proxies not updated within this window are skipped.
    pub max_age: Duration,
    /// Accepted locales. Empty means any locale.
    pub locales: Vec<String>,
    /// Maximum number of addresses returned.
    pub limit: usize,
}

impl FreshnessQuery {
    /// The strict query used to build the candidate list.
    pub fn primary() -> Self {
        Self {
            min_score: Score::new(80),
            max_age: Duration::from_secs(3600),
            locales: vec!["China".to_string(), "Japan".to_string(), "Korea".to_string()],
            limit: 50,
        }
    }

    /// The looser query issued when the primary one comes back empty.
    pub fn fallback() -> Self {
        Self {
            min_score: Score::new(50),
            max_age: Duration::from_secs(2 * 3600),
            locales: Vec::new(),
            limit: 20,
        }
    }
}

/// Configuration for probing, rotation and scheduling.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout of a single probe call.
    pub probe_timeout: Duration,
    /// Plain HTTP reference endpoints, always probed.
    pub plain_probe_urls: Vec<String>,
    /// HTTPS reference endpoints, probed only for SSL-capable proxies.
    pub tls_probe_urls: Vec<String>,
    /// Successful calls needed before a proxy gets a non-zero score.
    pub min_successful_probes: usize,
    /// Number of proxies probed concurrently by the scorer.
    pub scorer_concurrency: usize,
    /// How long a candidate list is served before it is rebuilt.
    pub refresh_window: Duration,
    /// How long a failed address stays excluded from candidate lists.
    pub blacklist_ttl: Duration,
    /// Query used to build the candidate list.
    pub primary_query: FreshnessQuery,
    /// Query used when the primary one returns nothing.
    pub fallback_query: FreshnessQuery,
    /// Number of times the middleware retries a request with a substitute proxy.
    pub retry_count: usize,
    /// Log a usage summary every this many selections.
    pub summary_interval: usize,
    /// Grace period after start before the scheduler runs any job.
    pub initial_delay: Duration,
    /// Sleep used after a failed scheduler cycle.
    pub fallback_sleep: Duration,
    /// TTL of the scheduler singleton lock.
    pub singleton_ttl: Duration,
    /// TTL of the acquisition job-dedup lock.
    pub acquisition_lock_ttl: Duration,
}

impl EngineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::new().build()
    }
}

/// Builder for `EngineConfig`.
pub struct EngineConfigBuilder {
    probe_timeout: Option<Duration>,
    plain_probe_urls: Option<Vec<String>>,
    tls_probe_urls: Option<Vec<String>>,
    min_successful_probes: Option<usize>,
    scorer_concurrency: Option<usize>,
    refresh_window: Option<Duration>,
    blacklist_ttl: Option<Duration>,
    primary_query: Option<FreshnessQuery>,
    fallback_query: Option<FreshnessQuery>,
    retry_count: Option<usize>,
    summary_interval: Option<usize>,
    initial_delay: Option<Duration>,
    fallback_sleep: Option<Duration>,
    singleton_ttl: Option<Duration>,
    acquisition_lock_ttl: Option<Duration>,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            probe_timeout: None,
            plain_probe_urls: None,
            tls_probe_urls: None,
            min_successful_probes: None,
            scorer_concurrency: None,
            refresh_window: None,
            blacklist_ttl: None,
            primary_query: None,
            fallback_query: None,
            retry_count: None,
            summary_interval: None,
            initial_delay: None,
            fallback_sleep: None,
            singleton_ttl: None,
            acquisition_lock_ttl: None,
        }
    }

    /// Set the timeout of a single probe call.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set the plain HTTP reference endpoints.
    pub fn plain_probe_urls(mut self, urls: Vec<impl Into<String>>) -> Self {
        self.plain_probe_urls = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Set the HTTPS reference endpoints.
    pub fn tls_probe_urls(mut self, urls: Vec<impl Into<String>>) -> Self {
        self.tls_probe_urls = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Set how many probe calls must succeed for a non-zero score.
    pub fn min_successful_probes(mut self, count: usize) -> Self {
        self.min_successful_probes = Some(count);
        self
    }

    /// Set how many proxies the scorer probes at once.
    pub fn scorer_concurrency(mut self, workers: usize) -> Self {
        self.scorer_concurrency = Some(workers);
        self
    }

    /// Set how long a candidate list is served before a rebuild.
    pub fn refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = Some(window);
        self
    }

    /// Set how long a failed address stays blacklisted.
    pub fn blacklist_ttl(mut self, ttl: Duration) -> Self {
        self.blacklist_ttl = Some(ttl);
        self
    }

    /// Set the primary candidate query.
    pub fn primary_query(mut self, query: FreshnessQuery) -> Self {
        self.primary_query = Some(query);
        self
    }

    /// Set the fallback candidate query.
    pub fn fallback_query(mut self, query: FreshnessQuery) -> Self {
        self.fallback_query = Some(query);
        self
    }

    /// Set the number of times to retry a request with different proxies.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Set how many selections pass between usage summaries.
    pub fn summary_interval(mut self, selections: usize) -> Self {
        self.summary_interval = Some(selections);
        self
    }

    /// Set the scheduler's grace period after start.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the sleep used after a failed scheduler cycle.
    pub fn fallback_sleep(mut self, sleep: Duration) -> Self {
        self.fallback_sleep = Some(sleep);
        self
    }

    /// Set the TTL of the scheduler singleton lock.
    pub fn singleton_ttl(mut self, ttl: Duration) -> Self {
        self.singleton_ttl = Some(ttl);
        self
    }

    /// Set the TTL of the acquisition job lock.
    pub fn acquisition_lock_ttl(mut self, ttl: Duration) -> Self {
        self.acquisition_lock_ttl = Some(ttl);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        EngineConfig {
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(10)),
            plain_probe_urls: self.plain_probe_urls.unwrap_or_else(|| {
                vec![
                    "http://httpbin.org/ip".to_string(),
                    "http://www.httpbin.org/get".to_string(),
                ]
            }),
            tls_probe_urls: self.tls_probe_urls.unwrap_or_else(|| {
                vec![
                    "https://httpbin.org/ip".to_string(),
                    "https://www.httpbin.org/get".to_string(),
                ]
            }),
            min_successful_probes: self.min_successful_probes.unwrap_or(1).max(1),
            scorer_concurrency: self.scorer_concurrency.unwrap_or(10).max(1),
            refresh_window: self.refresh_window.unwrap_or(Duration::from_secs(300)),
            blacklist_ttl: self.blacklist_ttl.unwrap_or(Duration::from_secs(1800)),
            primary_query: self.primary_query.unwrap_or_else(FreshnessQuery::primary),
            fallback_query: self.fallback_query.unwrap_or_else(FreshnessQuery::fallback),
            retry_count: self.retry_count.unwrap_or(3),
            summary_interval: self.summary_interval.unwrap_or(100).max(1),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_secs(300)),
            fallback_sleep: self.fallback_sleep.unwrap_or(Duration::from_secs(300)),
            singleton_ttl: self.singleton_ttl.unwrap_or(Duration::from_secs(3600)),
            acquisition_lock_ttl: self.acquisition_lock_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted scheduling settings. One row exists per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub acquisition_interval_s: u64,
    pub scoring_interval_s: u64,
    /// Proxies scoring below this are evicted after a scoring pass.
    pub min_score: u8,
    pub auto_acquisition: bool,
    pub auto_scoring: bool,
    /// Consumed by the crawler, stored alongside.
    pub max_captcha_retries: u32,
}

impl ScoringConfig {
    pub fn acquisition_interval(&self) -> Duration {
        Duration::from_secs(self.acquisition_interval_s)
    }

    pub fn scoring_interval(&self) -> Duration {
        Duration::from_secs(self.scoring_interval_s)
    }

    pub fn min_score(&self) -> Score {
        Score::new(i64::from(self.min_score))
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            acquisition_interval_s: 3600,
            scoring_interval_s: 1800,
            min_score: 10,
            auto_acquisition: true,
            auto_scoring: true,
            max_captcha_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let config = EngineConfig::builder()
            .probe_timeout(Duration::from_secs(5))
            .scorer_concurrency(0)
            .build();

        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.scorer_concurrency, 1);
        assert_eq!(config.plain_probe_urls.len(), 2);
        assert_eq!(config.tls_probe_urls.len(), 2);
        assert_eq!(config.refresh_window, Duration::from_secs(300));
        assert_eq!(config.primary_query.limit, 50);
        assert!(config.fallback_query.locales.is_empty());
        assert!(config.fallback_query.min_score < config.primary_query.min_score);
    }

    #[test]
    fn scoring_config_round_trips_through_json() {
        let config = ScoringConfig {
            min_score: 25,
            auto_scoring: false,
            ..ScoringConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ScoringConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.scoring_interval(), Duration::from_secs(1800));
    }
}
