//! Request-time proxy rotation consumed by the crawler.

use crate::blacklist::Blacklist;
use crate::config::{EngineConfig, FreshnessQuery};
use crate::proxy::ProxyUsage;
use crate::scorer::{ProbeTarget, Scorer};
use crate::store::ProxyStore;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct CandidateList {
    addresses: Vec<String>,
    built_at: Option<Instant>,
}

/// Hands out proxies from a periodically rebuilt snapshot of the store.
///
/// Failed proxies are rescored right away and blacklisted for the configured
/// TTL. Successful ones are rescored in the background.
pub struct RotationSelector {
    store: Arc<dyn ProxyStore>,
    scorer: Scorer,
    primary: FreshnessQuery,
    fallback: FreshnessQuery,
    refresh_window: Duration,
    summary_interval: usize,
    candidates: RwLock<CandidateList>,
    blacklist: Mutex<Blacklist>,
    usage: Mutex<HashMap<String, ProxyUsage>>,
    selections: AtomicUsize,
}

impl RotationSelector {
    pub fn new(store: Arc<dyn ProxyStore>, scorer: Scorer, config: &EngineConfig) -> Self {
        Self {
            store,
            scorer,
            primary: config.primary_query.clone(),
            fallback: config.fallback_query.clone(),
            refresh_window: config.refresh_window,
            summary_interval: config.summary_interval,
            candidates: RwLock::new(CandidateList::default()),
            blacklist: Mutex::new(Blacklist::new(config.blacklist_ttl)),
            usage: Mutex::new(HashMap::new()),
            selections: AtomicUsize::new(0),
        }
    }

    /// Pick a random usable proxy, rebuilding the candidate list if needed.
    pub fn select(&self) -> Option<String> {
        let needs_refresh = {
            let list = self.candidates.read();
            match list.built_at {
                Some(built_at) => {
                    built_at.elapsed() >= self.refresh_window || self.usable(&list).is_empty()
                }
                None => true,
            }
        };
        if needs_refresh {
            self.refresh();
        }

        let chosen = {
            let list = self.candidates.read();
            let usable = self.usable(&list);
            if usable.is_empty() {
                return None;
            }
            let idx = rand::rng().random_range(0..usable.len());
            usable[idx].clone()
        };

        self.usage.lock().entry(chosen.clone()).or_default().uses += 1;
        let selections = self.selections.fetch_add(1, Ordering::Relaxed) + 1;
        if selections % self.summary_interval == 0 {
            self.log_summary();
        }
        Some(chosen)
    }

    /// Candidates that are not currently blacklisted.
    fn usable<'a>(&self, list: &'a CandidateList) -> Vec<&'a String> {
        let mut blacklist = self.blacklist.lock();
        list.addresses
            .iter()
            .filter(|address| !blacklist.contains(address))
            .collect()
    }

    /// Rebuild the candidate list from the store.
    ///
    /// The fallback query is issued only when the primary one leaves nothing.
    pub fn refresh(&self) {
        let mut addresses = self.query(&self.primary, false);
        if addresses.is_empty() {
            debug!("Primary proxy query returned nothing, trying fallback");
            addresses = self.query(&self.fallback, true);
        }
        info!("Candidate list rebuilt with {} proxies", addresses.len());

        *self.candidates.write() = CandidateList {
            addresses,
            built_at: Some(Instant::now()),
        };
    }

    fn query(&self, query: &FreshnessQuery, fallback: bool) -> Vec<String> {
        let found = if fallback {
            self.store.query_fresh_fallback(query)
        } else {
            self.store.query_fresh(query)
        };
        match found {
            Ok(addresses) => {
                let mut blacklist = self.blacklist.lock();
                addresses
                    .into_iter()
                    .filter(|address| !blacklist.contains(address))
                    .collect()
            }
            Err(e) => {
                warn!("Failed to update proxy list: {}", e);
                Vec::new()
            }
        }
    }

    /// Record a failed request, rescore and blacklist the proxy, and hand
    /// back a replacement.
    pub async fn report_failure(&self, address: &str) -> Option<String> {
        self.usage.lock().entry(address.to_string()).or_default().failures += 1;
        self.blacklist.lock().insert(address);
        warn!("Proxy failed: {}", address);

        let target = self.target_for(address);
        match self.scorer.rescore(&*self.store, target).await {
            Ok(result) => debug!("Failed proxy {} rescored to {:.1}", address, result.score),
            Err(e) => warn!("Failed to update score of {}: {}", address, e),
        }

        self.select()
    }

    /// Record a successful request and refresh the proxy's score in the
    /// background. Without a tokio runtime only the counter is updated.
    pub fn report_success(&self, address: &str) {
        self.usage.lock().entry(address.to_string()).or_default().successes += 1;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping rescoring of {}", address);
            return;
        };
        let target = self.target_for(address);
        let store = Arc::clone(&self.store);
        let scorer = self.scorer.clone();
        runtime.spawn(async move {
            if let Err(e) = scorer.rescore(&*store, target).await {
                warn!("Background rescoring failed: {}", e);
            }
        });
    }

    fn target_for(&self, address: &str) -> ProbeTarget {
        let ssl = match self.store.get(address) {
            Ok(Some(proxy)) => proxy.ssl_support,
            _ => false,
        };
        ProbeTarget::new(address, ssl)
    }

    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.blacklist.lock().contains(address)
    }

    /// Snapshot of the current candidate list.
    pub fn candidates(&self) -> Vec<String> {
        self.candidates.read().addresses.clone()
    }

    /// Per-address counters collected so far.
    pub fn usage(&self) -> HashMap<String, ProxyUsage> {
        self.usage.lock().clone()
    }

    fn log_summary(&self) {
        let usage = self.usage.lock();
        let (uses, successes, failures) = usage.values().fold((0, 0, 0), |acc, u| {
            (acc.0 + u.uses, acc.1 + u.successes, acc.2 + u.failures)
        });
        info!(
            "Proxy usage: {} proxies, {} uses, {} successes, {} failures",
            usage.len(),
            uses,
            successes,
            failures
        );
        let mut busiest: Vec<_> = usage.iter().collect();
        busiest.sort_by(|a, b| b.1.uses.cmp(&a.1.uses));
        for (address, u) in busiest.into_iter().take(3) {
            debug!(
                "  {}: {} uses, success rate {:.2}",
                address,
                u.uses,
                u.success_rate()
            );
        }
    }
}
