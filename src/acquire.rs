//! Proxy acquisition from plain-text proxy lists.

use crate::error::{PoolError, Result};
use crate::proxy::NewProxy;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use std::collections::HashSet;
use url::Url;

/// Finds new proxies. The crawl type is `all`, `http` or `https`.
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, crawl_type: &str) -> Result<Vec<NewProxy>>;
}

/// Reads proxy lists from URLs or local files.
///
/// Each line holds `host:port`, optionally prefixed by `http://` or
/// `https://` (the latter marks SSL support) and followed by a locale.
/// Lines starting with `#` are ignored.
pub struct SourceListAcquirer {
    sources: Vec<String>,
    client: Client,
}

impl SourceListAcquirer {
    pub fn new(sources: Vec<impl Into<String>>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            client: Client::new(),
        }
    }

    async fn fetch(&self, source: &str) -> Result<String> {
        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                let response = self.client.get(url).send().await?.error_for_status()?;
                Ok(response.text().await?)
            }
            _ => Ok(tokio::fs::read_to_string(source).await?),
        }
    }
}

#[async_trait]
impl Acquirer for SourceListAcquirer {
    async fn acquire(&self, crawl_type: &str) -> Result<Vec<NewProxy>> {
        info!("Fetching proxies from {} sources", self.sources.len());

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut failures = 0;

        for source in &self.sources {
            match self.fetch(source).await {
                Ok(content) => {
                    let parsed = parse_proxy_list(&content);
                    info!("Fetched {} proxies from {}", parsed.len(), source);
                    for proxy in parsed {
                        if matches_crawl_type(crawl_type, &proxy) && seen.insert(proxy.address.clone()) {
                            found.push(proxy);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", source, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.sources.len() {
            return Err(PoolError::Source {
                source_name: self.sources.join(", "),
                reason: "every source failed".to_string(),
            });
        }

        info!("Found {} unique {} proxies", found.len(), crawl_type);
        Ok(found)
    }
}

fn matches_crawl_type(crawl_type: &str, proxy: &NewProxy) -> bool {
    match crawl_type.to_ascii_lowercase().as_str() {
        "https" => proxy.ssl_support,
        "http" => !proxy.ssl_support,
        _ => true,
    }
}

/// Parse the text content of a proxy list.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<NewProxy> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let endpoint = fields.next()?;
            let (ssl, address) = match endpoint.split_once("://") {
                Some(("https", rest)) => (true, rest),
                Some(("http", rest)) => (false, rest),
                Some(_) => return None,
                None => (false, endpoint),
            };
            let address = address.trim_end_matches('/');
            let (host, port) = address.rsplit_once(':')?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            let proxy = NewProxy::new(address).with_ssl(ssl);
            Some(match fields.next() {
                Some(locale) => proxy.with_locale(locale),
                None => proxy,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LIST: &str = "\
# free proxies
1.2.3.4:8080 China
https://5.6.7.8:443 Japan
http://9.9.9.9:3128/
socks5://1.1.1.1:1080
garbage
10.0.0.1:notaport
";

    #[test]
    fn parses_supported_lines_only() {
        let parsed = parse_proxy_list(LIST);
        let addresses: Vec<&str> = parsed.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(addresses, vec!["1.2.3.4:8080", "5.6.7.8:443", "9.9.9.9:3128"]);
        assert_eq!(parsed[0].locale, "China");
        assert!(parsed[1].ssl_support);
        assert_eq!(parsed[1].kind, "HTTPS");
        assert_eq!(parsed[2].locale, "Unknown");
    }

    #[tokio::test]
    async fn reads_files_and_filters_by_crawl_type() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(LIST.as_bytes()).unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let acquirer = SourceListAcquirer::new(vec![path.clone(), path]);

        let all = acquirer.acquire("all").await.unwrap();
        assert_eq!(all.len(), 3);
        let https = acquirer.acquire("https").await.unwrap();
        assert_eq!(https.len(), 1);
        assert_eq!(https[0].address, "5.6.7.8:443");
        let http = acquirer.acquire("HTTP").await.unwrap();
        assert_eq!(http.len(), 2);
    }

    #[tokio::test]
    async fn all_sources_failing_is_an_error() {
        let acquirer = SourceListAcquirer::new(vec!["/nonexistent/proxies.txt"]);
        assert!(matches!(
            acquirer.acquire("all").await,
            Err(PoolError::Source { .. })
        ));
    }
}
