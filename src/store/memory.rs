//! In-process store, for tests and single-process deployments.

use super::{rank, ProxyStore};
use crate::config::{FreshnessQuery, ScoringConfig};
use crate::error::Result;
use crate::proxy::{NewProxy, Proxy, Score};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// A [`ProxyStore`] kept in memory behind a read-write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    proxies: RwLock<HashMap<String, Proxy>>,
    config: RwLock<Option<ScoringConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a full record, timestamps included.
    pub fn insert(&self, proxy: Proxy) {
        self.proxies.write().insert(proxy.address.clone(), proxy);
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    fn matching(&self, min_score: Score, max_age: Duration, locales: &[String]) -> Vec<Proxy> {
        let cutoff = cutoff(max_age);
        self.proxies
            .read()
            .values()
            .filter(|p| p.score >= min_score && p.updated_at >= cutoff)
            .filter(|p| locales.is_empty() || locales.contains(&p.locale))
            .cloned()
            .collect()
    }
}

fn cutoff(max_age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl ProxyStore for MemoryStore {
    fn query_fresh(&self, query: &FreshnessQuery) -> Result<Vec<String>> {
        let mut found = self.matching(query.min_score, query.max_age, &query.locales);
        found.sort_by(rank);
        Ok(found
            .into_iter()
            .take(query.limit)
            .map(|p| p.address)
            .collect())
    }

    fn query_fresh_fallback(&self, query: &FreshnessQuery) -> Result<Vec<String>> {
        let mut found = self.matching(query.min_score, query.max_age, &[]);
        found.sort_by(|a, b| b.score.cmp(&a.score));
        Ok(found
            .into_iter()
            .take(query.limit)
            .map(|p| p.address)
            .collect())
    }

    fn write_score(&self, address: &str, score: Score, latency: Option<f64>) -> Result<bool> {
        let mut proxies = self.proxies.write();
        let Some(proxy) = proxies.get_mut(address) else {
            return Ok(false);
        };
        proxy.score = score;
        if latency.is_some() {
            proxy.last_ping = latency;
        }
        proxy.updated_at = Utc::now();
        Ok(true)
    }

    fn delete_below(&self, min_score: Score) -> Result<usize> {
        let mut proxies = self.proxies.write();
        let before = proxies.len();
        proxies.retain(|_, p| p.score >= min_score);
        Ok(before - proxies.len())
    }

    fn upsert(&self, proxy: NewProxy) -> Result<bool> {
        let now = Utc::now();
        let mut proxies = self.proxies.write();
        match proxies.get_mut(&proxy.address) {
            Some(existing) => {
                existing.ssl_support = proxy.ssl_support;
                existing.kind = proxy.kind;
                existing.locale = proxy.locale;
                if proxy.speed.is_some() {
                    existing.last_speed = proxy.speed;
                }
                existing.updated_at = now;
                Ok(false)
            }
            None => {
                proxies.insert(proxy.address.clone(), Proxy::from_sighting(proxy, now));
                Ok(true)
            }
        }
    }

    fn get(&self, address: &str) -> Result<Option<Proxy>> {
        Ok(self.proxies.read().get(address).cloned())
    }

    fn all(&self) -> Result<Vec<Proxy>> {
        Ok(self.proxies.read().values().cloned().collect())
    }

    fn load_config(&self) -> Result<ScoringConfig> {
        Ok(self.config.read().clone().unwrap_or_default())
    }

    fn save_config(&self, config: &ScoringConfig) -> Result<()> {
        *self.config.write() = Some(config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests as shared;

    #[test]
    fn fresh_query_filters_and_orders() {
        shared::fresh_query_filters_and_orders(&MemoryStore::new());
    }

    #[test]
    fn fallback_ignores_locale() {
        shared::fallback_ignores_locale(&MemoryStore::new());
    }

    #[test]
    fn eviction_removes_low_scores() {
        shared::eviction_removes_low_scores(&MemoryStore::new());
    }

    #[test]
    fn upsert_keeps_score() {
        shared::upsert_keeps_score(&MemoryStore::new());
    }

    #[test]
    fn config_defaults_then_persists() {
        shared::config_defaults_then_persists(&MemoryStore::new());
    }

    #[test]
    fn stale_proxies_are_not_fresh() {
        let store = MemoryStore::new();
        shared::stale_proxies_are_not_fresh(&store, |address, when| {
            let mut proxy = store.get(address).unwrap().unwrap();
            proxy.updated_at = when;
            store.insert(proxy);
        });
    }
}
