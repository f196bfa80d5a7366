use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const PROXY_POOL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProxyPoolError {
    #[error("proxy pool request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// A proxy address handed out by the pool for the duration of one fetch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    pub address: String,
}

#[derive(Debug, Deserialize)]
struct ProxyGetResponse {
    #[serde(default)]
    proxy: Option<String>,
}

/// Client for the external proxy pool service (`GET /get/`, `GET /delete?proxy=`).
#[derive(Debug, Clone)]
pub struct ProxyPool {
    base_url: String,
    client: reqwest::Client,
}

impl ProxyPool {
    /// `base_url` is used as a prefix verbatim and is expected to end with `/`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProxyPoolError> {
        let client = reqwest::Client::builder()
            .timeout(PROXY_POOL_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    /// Asks the pool for a proxy. Any failure, including an empty answer, yields `None`.
    pub async fn acquire(&self) -> Option<ProxyLease> {
        match self.try_acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                tracing::debug!(
                    event = "proxy_pool_acquire_failed",
                    error = %err,
                    "proxy pool did not answer"
                );
                None
            }
        }
    }

    async fn try_acquire(&self) -> Result<Option<ProxyLease>, ProxyPoolError> {
        let response: ProxyGetResponse = self
            .client
            .get(format!("{}get/", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .proxy
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .map(|address| ProxyLease { address }))
    }

    /// Fire-and-forget removal notice for a proxy that exhausted a fetch's attempts.
    pub async fn report_dead(&self, lease: &ProxyLease) {
        let result = self
            .client
            .get(format!("{}delete", self.base_url))
            .query(&[("proxy", lease.address.as_str())])
            .send()
            .await;

        if let Err(err) = result {
            tracing::debug!(
                event = "proxy_pool_delete_failed",
                proxy = %lease.address,
                error = %err,
                "ignoring proxy removal failure"
            );
        }
    }
}
