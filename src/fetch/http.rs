use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{config::HttpConfig, error::FetchError};

/// Minimal response view the fetcher needs.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Capability seam over the HTTP stack so tests can fake upstreams.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<HttpResponse, FetchError>;
}

/// Production transport: pooled reqwest client, TLS verification on,
/// explicit connect/read timeouts and a polite User-Agent.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                msg: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<HttpResponse, FetchError> {
        let request = self.client.get(url).send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FetchError::Cancelled { url: url.to_string() });
            }
            result = request => result.map_err(|e| classify_reqwest_error(url, e))?,
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FetchError::Cancelled { url: url.to_string() });
            }
            result = response.bytes() => result.map_err(|e| classify_reqwest_error(url, e))?,
        };

        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::DeadlineExceeded {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            msg: e.to_string(),
        }
    }
}
