//! Proxy records and per-address usage counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quality score of a proxy, always within `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(u8);

impl Score {
    pub const MIN: Score = Score(0);
    pub const MAX: Score = Score(100);

    /// Build a score from any integer, clamping into range.
    pub fn new(value: i64) -> Self {
        Score(value.clamp(0, 100) as u8)
    }

    /// Build a score from a probe average, rounding to the nearest integer.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Score::MIN;
        }
        Score::new(value.round() as i64)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Score {
    /// Freshly sighted proxies start at full score.
    fn default() -> Self {
        Score::MAX
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored proxy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    /// `host:port` of the relay.
    pub address: String,
    /// Whether the proxy can tunnel TLS traffic.
    pub ssl_support: bool,
    /// Protocol/type label reported by the source (e.g. "HTTP", "HTTPS").
    pub kind: String,
    /// Country or region the proxy is located in.
    pub locale: String,
    pub score: Score,
    /// Mean latency of the last successful probe round, in seconds.
    pub last_ping: Option<f64>,
    /// Throughput figure reported by the source.
    pub last_speed: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// Create a record for a first sighting.
    pub fn from_sighting(new: NewProxy, now: DateTime<Utc>) -> Self {
        Self {
            address: new.address,
            ssl_support: new.ssl_support,
            kind: new.kind,
            locale: new.locale,
            score: Score::default(),
            last_ping: None,
            last_speed: new.speed,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A proxy as reported by an acquisition source, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProxy {
    pub address: String,
    pub ssl_support: bool,
    pub kind: String,
    pub locale: String,
    pub speed: Option<f64>,
}

impl NewProxy {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ssl_support: false,
            kind: "HTTP".to_string(),
            locale: "Unknown".to_string(),
            speed: None,
        }
    }

    pub fn with_ssl(mut self, ssl_support: bool) -> Self {
        self.ssl_support = ssl_support;
        self.kind = if ssl_support { "HTTPS" } else { "HTTP" }.to_string();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }
}

/// Usage counters for one address, kept for observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyUsage {
    /// Number of times the address was handed out.
    pub uses: usize,
    /// Number of successful requests made through this proxy.
    pub successes: usize,
    /// Number of failed requests made through this proxy.
    pub failures: usize,
}

impl ProxyUsage {
    /// Calculate the success rate of this proxy.
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.successes as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_clamps_into_range() {
        assert_eq!(Score::new(-5).value(), 0);
        assert_eq!(Score::new(250).value(), 100);
        assert_eq!(Score::from_f64(69.6).value(), 70);
        assert_eq!(Score::from_f64(f64::NAN), Score::MIN);
        assert_eq!(Score::default(), Score::MAX);
    }

    #[test]
    fn success_rate_handles_no_traffic() {
        let mut usage = ProxyUsage::default();
        assert_eq!(usage.success_rate(), 0.0);
        usage.successes = 3;
        usage.failures = 1;
        assert_eq!(usage.success_rate(), 0.75);
    }
}
