//! Narrow interface over the persistent proxy table and the settings row.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{FreshnessQuery, ScoringConfig};
use crate::error::Result;
use crate::proxy::{NewProxy, Proxy, Score};

use std::cmp::Ordering;

/// Persistent proxy pool and settings, shared between processes.
///
/// Every operation is an independent row-level call. Errors mean the store
/// is unavailable; callers log them and skip the affected step.
pub trait ProxyStore: Send + Sync {
    /// Addresses matching score, freshness and locale filters, best first.
    fn query_fresh(&self, query: &FreshnessQuery) -> Result<Vec<String>>;

    /// Looser lookup used when [`query_fresh`](Self::query_fresh) is empty.
    /// Locales are ignored and results are ordered by score only.
    fn query_fresh_fallback(&self, query: &FreshnessQuery) -> Result<Vec<String>>;

    /// Write a new score (and latency, if measured). Returns false when the
    /// address is not stored.
    fn write_score(&self, address: &str, score: Score, latency: Option<f64>) -> Result<bool>;

    /// Delete every proxy scoring below `min_score`, returning the count.
    fn delete_below(&self, min_score: Score) -> Result<usize>;

    /// Insert a first sighting, or refresh the metadata of a known proxy.
    /// Returns true when the proxy is new.
    fn upsert(&self, proxy: NewProxy) -> Result<bool>;

    fn get(&self, address: &str) -> Result<Option<Proxy>>;

    fn all(&self) -> Result<Vec<Proxy>>;

    /// The settings row, or defaults when none was saved yet.
    fn load_config(&self) -> Result<ScoringConfig>;

    fn save_config(&self, config: &ScoringConfig) -> Result<()>;
}

/// Missing measurements sort after present ones.
fn cmp_optional(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Score descending, then latency ascending, then throughput ascending.
pub(crate) fn rank(a: &Proxy, b: &Proxy) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| cmp_optional(a.last_ping, b.last_ping))
        .then_with(|| cmp_optional(a.last_speed, b.last_speed))
}

#[cfg(test)]
pub(crate) mod tests {
    //! Behaviour shared by every store implementation.

    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    pub(crate) fn seeded(store: &dyn ProxyStore) {
        for (address, locale) in [
            ("10.0.0.1:80", "China"),
            ("10.0.0.2:80", "Japan"),
            ("10.0.0.3:80", "Germany"),
            ("10.0.0.4:80", "Korea"),
        ] {
            store.upsert(NewProxy::new(address).with_locale(locale)).unwrap();
        }
        store.write_score("10.0.0.1:80", Score::new(90), Some(0.4)).unwrap();
        store.write_score("10.0.0.2:80", Score::new(90), Some(0.2)).unwrap();
        store.write_score("10.0.0.3:80", Score::new(95), Some(0.1)).unwrap();
        store.write_score("10.0.0.4:80", Score::new(60), Some(0.1)).unwrap();
    }

    fn query(min: i64, locales: &[&str], limit: usize) -> FreshnessQuery {
        FreshnessQuery {
            min_score: Score::new(min),
            max_age: Duration::from_secs(3600),
            locales: locales.iter().map(|l| l.to_string()).collect(),
            limit,
        }
    }

    pub(crate) fn fresh_query_filters_and_orders(store: &dyn ProxyStore) {
        seeded(store);
        let found = store
            .query_fresh(&query(80, &["China", "Japan", "Korea"], 50))
            .unwrap();
        assert_eq!(found, vec!["10.0.0.2:80", "10.0.0.1:80"]);

        let any_locale = store.query_fresh(&query(0, &[], 2)).unwrap();
        assert_eq!(any_locale, vec!["10.0.0.3:80", "10.0.0.2:80"]);
    }

    pub(crate) fn fallback_ignores_locale(store: &dyn ProxyStore) {
        seeded(store);
        let found = store
            .query_fresh_fallback(&query(50, &["Nowhere"], 20))
            .unwrap();
        assert_eq!(found.len(), 4);
        assert_eq!(found[0], "10.0.0.3:80");
        assert_eq!(found[3], "10.0.0.4:80");
    }

    pub(crate) fn eviction_removes_low_scores(store: &dyn ProxyStore) {
        seeded(store);
        store.write_score("10.0.0.1:80", Score::new(8), None).unwrap();
        let removed = store.delete_below(Score::new(10)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("10.0.0.1:80").unwrap().is_none());
        assert!(store
            .all()
            .unwrap()
            .iter()
            .all(|p| p.score >= Score::new(10)));
    }

    pub(crate) fn upsert_keeps_score(store: &dyn ProxyStore) {
        assert!(store.upsert(NewProxy::new("10.0.0.9:8080")).unwrap());
        let created = store.get("10.0.0.9:8080").unwrap().unwrap();
        assert_eq!(created.score, Score::MAX);

        store.write_score("10.0.0.9:8080", Score::new(42), Some(1.5)).unwrap();
        assert!(!store
            .upsert(NewProxy::new("10.0.0.9:8080").with_ssl(true))
            .unwrap());
        let seen_again = store.get("10.0.0.9:8080").unwrap().unwrap();
        assert_eq!(seen_again.score, Score::new(42));
        assert_eq!(seen_again.last_ping, Some(1.5));
        assert!(seen_again.ssl_support);
        assert!(!store.write_score("missing:1", Score::new(1), None).unwrap());
    }

    pub(crate) fn config_defaults_then_persists(store: &dyn ProxyStore) {
        assert_eq!(store.load_config().unwrap(), ScoringConfig::default());
        let changed = ScoringConfig {
            scoring_interval_s: 600,
            auto_acquisition: false,
            ..ScoringConfig::default()
        };
        store.save_config(&changed).unwrap();
        assert_eq!(store.load_config().unwrap(), changed);
    }

    pub(crate) fn stale_proxies_are_not_fresh(store: &dyn ProxyStore, age_back: impl Fn(&str, chrono::DateTime<Utc>)) {
        seeded(store);
        age_back("10.0.0.2:80", Utc::now() - ChronoDuration::hours(3));
        let found = store.query_fresh(&query(0, &[], 50)).unwrap();
        assert!(!found.contains(&"10.0.0.2:80".to_string()));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn rank_puts_missing_latency_last() {
        let now = Utc::now();
        let mut a = Proxy::from_sighting(NewProxy::new("a:1"), now);
        let mut b = Proxy::from_sighting(NewProxy::new("b:1"), now);
        b.last_ping = Some(0.5);
        assert_eq!(rank(&a, &b), Ordering::Greater);
        a.score = Score::new(99);
        assert_eq!(rank(&a, &b), Ordering::Greater);
        b.score = Score::new(50);
        assert_eq!(rank(&a, &b), Ordering::Less);
    }
}
