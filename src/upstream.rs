//! Backend HTTP client.
//!
//! A thin wrapper over a shared `reqwest::Client`: the proxy core hands it a
//! fully-translated wire body plus headers and gets back the raw response.
//! Unary calls are bounded by the `total` timeout; streaming calls rely on
//! the connect and read timeouts so long generations are not cut off.

use crate::config::TimeoutConfig;
use crate::error::ProxyError;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    total_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .build()
            .map_err(|err| ProxyError::internal(format!("http client construction failed: {err}")))?;
        Ok(Self { http, total_timeout: timeouts.total })
    }

    /// POST a JSON body. `stream` requests skip the total deadline.
    pub async fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !stream {
            request = request.timeout(self.total_timeout);
        }
        request.send().await.map_err(ProxyError::from)
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> TimeoutConfig {
        TimeoutConfig {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(60),
            write: Duration::from_secs(60),
            total: Duration::from_secs(120),
        }
    }

    #[test]
    fn client_builds_from_timeouts() {
        assert!(UpstreamClient::new(&timeouts()).is_ok());
    }

    #[test]
    fn retry_after_seconds_parse() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "30".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }
}
