//! Middleware implementation for reqwest.

use crate::config::EngineConfig;
use crate::error::NoProxyAvailable;
use crate::rotation::RotationSelector;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;
use std::time::Duration;

/// Middleware that routes every request through a rotated proxy.
///
/// A failed attempt (transport error or non-success status) is reported to
/// the selector, which hands back a substitute for the next attempt.
#[derive(Clone)]
pub struct RotationMiddleware {
    selector: Arc<RotationSelector>,
    retry_count: usize,
    timeout: Duration,
}

impl RotationMiddleware {
    pub fn new(selector: Arc<RotationSelector>, config: &EngineConfig) -> Self {
        Self {
            selector,
            retry_count: config.retry_count,
            timeout: config.probe_timeout,
        }
    }

    pub fn selector(&self) -> &Arc<RotationSelector> {
        &self.selector
    }

    fn client_for(&self, address: &str) -> std::result::Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{address}"))?)
            .timeout(self.timeout)
            .build()
    }
}

#[async_trait]
impl Middleware for RotationMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        let mut current = self.selector.select();

        loop {
            let Some(address) = current.take() else {
                warn!("No proxy available after {} attempts", attempt);
                return Err(Error::Middleware(anyhow!(NoProxyAvailable)));
            };

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;

            info!("Using proxy: {} (attempt {})", address, attempt + 1);

            let client = match self.client_for(&address) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", address, e);
                    current = self.selector.report_failure(&address).await;
                    attempt += 1;
                    if attempt > self.retry_count {
                        return Err(Error::Reqwest(e));
                    }
                    continue;
                }
            };

            match client.execute(proxied_request).await {
                Ok(response) if response.status().is_success() => {
                    self.selector.report_success(&address);
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(
                        "Proxy {} answered {} (attempt {})",
                        address,
                        response.status(),
                        attempt + 1
                    );
                    current = self.selector.report_failure(&address).await;
                    attempt += 1;
                    if attempt > self.retry_count {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    warn!(
                        "Request failed with proxy {} (attempt {}): {}",
                        address,
                        attempt + 1,
                        err
                    );
                    current = self.selector.report_failure(&address).await;
                    attempt += 1;
                    if attempt > self.retry_count {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }
    }
}
