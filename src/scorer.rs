//! Bulk scoring of the pool over a bounded worker pool, and eviction.

use crate::error::Result;
use crate::probe::{Probe, ProbeResult};
use crate::proxy::{Proxy, Score};
use crate::store::ProxyStore;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// One proxy to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub address: String,
    pub ssl_capable: bool,
}

impl ProbeTarget {
    pub fn new(address: impl Into<String>, ssl_capable: bool) -> Self {
        Self {
            address: address.into(),
            ssl_capable,
        }
    }
}

impl From<&Proxy> for ProbeTarget {
    fn from(proxy: &Proxy) -> Self {
        Self::new(proxy.address.clone(), proxy.ssl_support)
    }
}

/// Summary of one scoring pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoringReport {
    pub scored: usize,
    pub written: usize,
    pub write_failures: usize,
    pub evicted: usize,
    /// Whether the eviction pass itself failed.
    pub eviction_failed: bool,
}

/// Fans probes out over at most `concurrency` proxies at a time.
#[derive(Clone)]
pub struct Scorer {
    probe: Arc<dyn Probe>,
    concurrency: usize,
}

impl Scorer {
    pub fn new(probe: Arc<dyn Probe>, concurrency: usize) -> Self {
        Self {
            probe,
            concurrency: concurrency.max(1),
        }
    }

    pub fn probe(&self) -> &Arc<dyn Probe> {
        &self.probe
    }

    /// Probe every target independently.
    ///
    /// A worker that dies yields score 0 for its own address only.
    pub async fn score_all(
        &self,
        targets: impl IntoIterator<Item = ProbeTarget>,
    ) -> HashMap<String, ProbeResult> {
        stream::iter(targets)
            .map(|target| {
                let probe = Arc::clone(&self.probe);
                async move {
                    let address = target.address.clone();
                    let worker = tokio::spawn(async move {
                        probe.probe(&target.address, target.ssl_capable).await
                    });
                    let result = match worker.await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!("Scoring worker for {} failed: {}", address, e);
                            ProbeResult::failed(format!("worker failed: {e}"))
                        }
                    };
                    (address, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// Score `targets`, write each score back, then evict below `min_score`.
    ///
    /// Writes are independent: one failing row does not stop the others.
    /// Eviction runs after every write, so it sees the new scores.
    pub async fn score_and_evict(
        &self,
        store: &dyn ProxyStore,
        targets: impl IntoIterator<Item = ProbeTarget>,
        min_score: Score,
    ) -> ScoringReport {
        let results = self.score_all(targets).await;
        let mut report = ScoringReport {
            scored: results.len(),
            ..ScoringReport::default()
        };

        for (address, result) in &results {
            match store.write_score(address, result.stored_score(), result.mean_latency) {
                Ok(true) => report.written += 1,
                Ok(false) => debug!("Proxy {} vanished before its score was written", address),
                Err(e) => {
                    warn!("Failed to write score for {}: {}", address, e);
                    report.write_failures += 1;
                }
            }
        }

        match store.delete_below(min_score) {
            Ok(evicted) => {
                report.evicted = evicted;
                if evicted > 0 {
                    warn!("Evicted {} proxies scoring below {}", evicted, min_score);
                }
            }
            Err(e) => {
                warn!("Eviction pass failed: {}", e);
                report.eviction_failed = true;
            }
        }

        info!(
            "Scoring completed: {} scored, {} written, {} evicted",
            report.scored, report.written, report.evicted
        );
        report
    }

    /// Score every stored proxy. Fails only if the pool cannot be listed.
    pub async fn run_cycle(&self, store: &dyn ProxyStore, min_score: Score) -> Result<ScoringReport> {
        let proxies = store.all()?;
        if proxies.is_empty() {
            warn!("Proxy pool is empty, nothing to score");
            return Ok(ScoringReport::default());
        }
        let targets: Vec<ProbeTarget> = proxies.iter().map(ProbeTarget::from).collect();
        Ok(self.score_and_evict(store, targets, min_score).await)
    }

    /// Probe one proxy and write its score back.
    pub async fn rescore(&self, store: &dyn ProxyStore, target: ProbeTarget) -> Result<ProbeResult> {
        let result = self.probe.probe(&target.address, target.ssl_capable).await;
        store.write_score(&target.address, result.stored_score(), result.mean_latency)?;
        debug!("Rescored {} to {}", target.address, result.stored_score());
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::NewProxy;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Probe returning fixed scores, optionally slow, counting concurrency.
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub scores: Mutex<HashMap<String, f64>>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl FakeProbe {
        pub(crate) fn with_scores(scores: &[(&str, f64)]) -> Self {
            Self {
                scores: Mutex::new(scores.iter().map(|(a, s)| (a.to_string(), *s)).collect()),
                ..Self::default()
            }
        }

        pub(crate) fn set(&self, address: &str, score: f64) {
            self.scores.lock().insert(address.to_string(), score);
        }
    }

    #[async_trait]
    impl Probe for FakeProbe {
        async fn probe(&self, address: &str, _ssl_capable: bool) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if address.starts_with("panic") {
                panic!("probe blew up");
            }
            let score = self.scores.lock().get(address).copied().unwrap_or(0.0);
            ProbeResult {
                score,
                successes: usize::from(score > 0.0),
                attempts: 2,
                mean_latency: (score > 0.0).then_some(1.0),
                last_error: None,
            }
        }
    }

    fn targets(addresses: &[&str]) -> Vec<ProbeTarget> {
        addresses.iter().map(|a| ProbeTarget::new(*a, false)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_is_bounded() {
        let probe = Arc::new(FakeProbe {
            delay: Some(Duration::from_secs(10)),
            ..FakeProbe::default()
        });
        let scorer = Scorer::new(probe.clone(), 10);
        let addresses: Vec<String> = (0..25).map(|i| format!("10.0.0.{i}:80")).collect();
        let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();

        let started = tokio::time::Instant::now();
        let results = scorer.score_all(targets(&refs)).await;

        assert_eq!(results.len(), 25);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 10);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn a_failing_worker_only_zeroes_its_own_address() {
        let probe = Arc::new(FakeProbe::with_scores(&[("good:1", 80.0)]));
        let scorer = Scorer::new(probe, 4);
        let results = scorer.score_all(targets(&["good:1", "panic:1"])).await;

        assert_eq!(results["good:1"].score, 80.0);
        assert_eq!(results["panic:1"].score, 0.0);
        assert!(results["panic:1"].last_error.is_some());
    }

    #[tokio::test]
    async fn scores_are_written_and_low_scores_evicted() {
        let store = MemoryStore::new();
        for address in ["a:1", "b:1", "c:1"] {
            store.upsert(NewProxy::new(address)).unwrap();
        }
        let probe = Arc::new(FakeProbe::with_scores(&[("a:1", 70.0), ("b:1", 8.0)]));
        let scorer = Scorer::new(probe, 10);

        let report = scorer.run_cycle(&store, Score::new(10)).await.unwrap();

        assert_eq!(report.scored, 3);
        assert_eq!(report.written, 3);
        assert_eq!(report.evicted, 2);
        assert_eq!(store.get("a:1").unwrap().unwrap().score, Score::new(70));
        assert!(store.get("b:1").unwrap().is_none());
        assert!(store.get("c:1").unwrap().is_none());
        assert!(store.all().unwrap().iter().all(|p| p.score >= Score::new(10)));
    }

    #[tokio::test]
    async fn rescoring_is_idempotent() {
        let store = MemoryStore::new();
        store.upsert(NewProxy::new("a:1")).unwrap();
        let scorer = Scorer::new(Arc::new(FakeProbe::with_scores(&[("a:1", 64.4)])), 1);

        scorer.rescore(&store, ProbeTarget::new("a:1", false)).await.unwrap();
        let first = store.get("a:1").unwrap().unwrap().score;
        scorer.rescore(&store, ProbeTarget::new("a:1", false)).await.unwrap();
        let second = store.get("a:1").unwrap().unwrap().score;

        assert_eq!(first, Score::new(64));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_pool_is_a_no_op() {
        let store = MemoryStore::new();
        let probe = Arc::new(FakeProbe::default());
        let scorer = Scorer::new(probe.clone(), 10);
        let report = scorer.run_cycle(&store, Score::new(10)).await.unwrap();
        assert_eq!(report, ScoringReport::default());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
