//! Active health probing of a single proxy.

use crate::config::EngineConfig;
use crate::proxy::Score;

use async_trait::async_trait;
use log::{debug, warn};
use std::time::{Duration, Instant};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Outcome of one reference call through a proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The call returned a 2xx or redirect status after `elapsed`.
    Success { elapsed: Duration },
    /// The call errored, timed out or returned another status.
    Failure(String),
}

/// Aggregated result of probing one proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Mean of the successful call scores, or 0.
    pub score: f64,
    pub successes: usize,
    pub attempts: usize,
    /// Mean latency of the successful calls, in seconds.
    pub mean_latency: Option<f64>,
    /// Reason of the most recent failed call, if any.
    pub last_error: Option<String>,
}

impl ProbeResult {
    /// A result for a proxy that could not be probed at all.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            successes: 0,
            attempts: 0,
            mean_latency: None,
            last_error: Some(reason.into()),
        }
    }

    /// The integer score written back to the store.
    pub fn stored_score(&self) -> Score {
        Score::from_f64(self.score)
    }
}

/// Score of a single successful call: linear in the time left before timeout.
pub fn latency_score(timeout: Duration, elapsed: Duration) -> f64 {
    let timeout = timeout.as_secs_f64();
    if timeout <= 0.0 {
        return 0.0;
    }
    ((timeout - elapsed.as_secs_f64()) / timeout * 100.0).clamp(0.0, 100.0)
}

/// Fold call outcomes into a [`ProbeResult`].
///
/// Failed calls are excluded from the mean. With fewer than `min_successes`
/// successful calls the score is 0.
pub fn aggregate(outcomes: &[ProbeOutcome], timeout: Duration, min_successes: usize) -> ProbeResult {
    let mut scores = Vec::with_capacity(outcomes.len());
    let mut latencies = Vec::with_capacity(outcomes.len());
    let mut last_error = None;

    for outcome in outcomes {
        match outcome {
            ProbeOutcome::Success { elapsed } => {
                scores.push(latency_score(timeout, *elapsed));
                latencies.push(elapsed.as_secs_f64());
            }
            ProbeOutcome::Failure(reason) => last_error = Some(reason.clone()),
        }
    }

    let successes = scores.len();
    let enough = successes > 0 && successes >= min_successes;
    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;

    ProbeResult {
        score: if enough { mean(&scores) } else { 0.0 },
        successes,
        attempts: outcomes.len(),
        mean_latency: if successes > 0 { Some(mean(&latencies)) } else { None },
        last_error,
    }
}

/// Something that can measure the quality of a proxy.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probe `address` (`host:port`), including TLS endpoints when `ssl_capable`.
    async fn probe(&self, address: &str, ssl_capable: bool) -> ProbeResult;
}

/// Probes proxies by sending reference requests through them with reqwest.
#[derive(Debug, Clone)]
pub struct HttpProber {
    timeout: Duration,
    plain_urls: Vec<String>,
    tls_urls: Vec<String>,
    min_successes: usize,
}

impl HttpProber {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timeout: config.probe_timeout,
            plain_urls: config.plain_probe_urls.clone(),
            tls_urls: config.tls_probe_urls.clone(),
            min_successes: config.min_successful_probes,
        }
    }

    fn client_for(&self, address: &str) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{address}"))?)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
    }

    async fn call(&self, client: &reqwest::Client, url: &str) -> ProbeOutcome {
        let start = Instant::now();
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                ProbeOutcome::Success { elapsed: start.elapsed() }
            }
            Ok(resp) => ProbeOutcome::Failure(format!("{url} returned {}", resp.status())),
            Err(e) => ProbeOutcome::Failure(format!("{url}: {e}")),
        }
    }
}

#[async_trait]
impl Probe for HttpProber {
    async fn probe(&self, address: &str, ssl_capable: bool) -> ProbeResult {
        if !address.contains(':') {
            warn!("Malformed proxy address: {}", address);
            return ProbeResult::failed(format!("malformed address {address}"));
        }

        let client = match self.client_for(address) {
            Ok(client) => client,
            Err(e) => return ProbeResult::failed(format!("client for {address}: {e}")),
        };

        let tls_urls: &[String] = if ssl_capable { &self.tls_urls } else { &[] };
        let mut outcomes = Vec::with_capacity(self.plain_urls.len() + tls_urls.len());
        for url in self.plain_urls.iter().chain(tls_urls) {
            let outcome = self.call(&client, url).await;
            if let ProbeOutcome::Failure(reason) = &outcome {
                debug!("Probe through {} failed: {}", address, reason);
            }
            outcomes.push(outcome);
        }

        let result = aggregate(&outcomes, self.timeout, self.min_successes);
        debug!(
            "Proxy {} scored {:.1} ({}/{} calls succeeded)",
            address, result.score, result.successes, result.attempts
        );
        result
    }
}
