pub mod error;
pub mod proxy;
pub mod spoof;

use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::RateLimiter;
use reqwest::header::{CONTENT_LENGTH, USER_AGENT};
use tokio_util::sync::CancellationToken;

use crate::retry::{run_with_retry, RetryPolicy};

pub use error::FetchClientError;
pub use proxy::{ProxyLease, ProxyPool, ProxyPoolError};
pub use spoof::{HeaderSpoofer, SpoofError};

const FORWARDED_FOR: &str = "X-Forwarded-For";

/// Shared process-local limiter enforcing one request budget across every worker pool.
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Per-call behavior of the resilient fetch client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub use_proxy: bool,
    /// Proceed unproxied when the pool has nothing to lend instead of waiting for a lease.
    pub allow_fallback: bool,
    /// Report a proxy to the pool once a call exhausts its attempts through it.
    pub allow_delete: bool,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub retry_backoff: Duration,
    pub lease_retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            use_proxy: false,
            allow_fallback: false,
            allow_delete: false,
            max_attempts: 3,
            timeout: Duration::from_secs(3),
            retry_backoff: Duration::from_secs(1),
            lease_retry_delay: Duration::from_secs(1),
        }
    }
}

/// A fully received, length-verified response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP GET client shared by every fetcher pool.
///
/// Holds no per-call state: a proxy lease lives only for the duration of one `fetch`.
pub struct FetchClient {
    policy: FetchPolicy,
    direct: reqwest::Client,
    proxy_pool: Option<ProxyPool>,
    spoofer: HeaderSpoofer,
    rate_limiter: Option<GlobalRateLimiter>,
    shutdown: CancellationToken,
}

impl FetchClient {
    pub fn new(
        policy: FetchPolicy,
        proxy_pool: Option<ProxyPool>,
        spoofer: HeaderSpoofer,
        shutdown: CancellationToken,
    ) -> Result<Self, FetchClientError> {
        let direct = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .map_err(FetchClientError::ClientBuild)?;

        Ok(Self {
            policy,
            direct,
            proxy_pool,
            spoofer,
            rate_limiter: None,
            shutdown,
        })
    }

    /// Every attempt, retries included, waits on `limiter` before going out.
    pub fn with_rate_limiter(mut self, limiter: GlobalRateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Fetches `url` through a proxy lease when `use_proxy` is set and the client has a pool.
    pub async fn fetch_proxied(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchClientError> {
        self.fetch(url, params, self.policy.use_proxy).await
    }

    /// Issues a GET with up to `max_attempts` attempts separated by a fixed backoff.
    ///
    /// Non-success statuses and declared-vs-received length mismatches count as failed attempts.
    pub async fn fetch(
        &self,
        url: &str,
        params: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<FetchedResponse, FetchClientError> {
        let lease = if use_proxy {
            self.acquire_lease().await?
        } else {
            None
        };

        let client = match &lease {
            Some(lease) => self.proxied_client(lease)?,
            None => self.direct.clone(),
        };

        let retry_policy =
            RetryPolicy::constant(self.policy.max_attempts, self.policy.retry_backoff);
        let client = &client;
        let outcome = run_with_retry(
            &retry_policy,
            0,
            move |attempt| async move {
                self.attempt(client, url, params).await.map_err(|err| {
                    tracing::debug!(
                        event = "fetch_attempt_failed",
                        url,
                        attempt,
                        error = %err,
                        "fetch attempt failed"
                    );
                    err
                })
            },
            move |err: &FetchClientError| err.is_transient() && !self.shutdown.is_cancelled(),
        )
        .await;

        match outcome {
            Ok((response, _attempts)) => Ok(response),
            Err(terminal) => {
                if terminal.exhausted_retryable && self.policy.allow_delete {
                    if let (Some(pool), Some(lease)) = (&self.proxy_pool, &lease) {
                        tracing::warn!(
                            event = "proxy_reported_dead",
                            proxy = %lease.address,
                            url,
                            "removing proxy after exhausted attempts"
                        );
                        pool.report_dead(lease).await;
                    }
                }
                Err(terminal.error)
            }
        }
    }

    /// Takes a lease from the pool, waiting for one unless fallback is allowed.
    ///
    /// The wait has no attempt limit; it ends on a lease or on shutdown.
    async fn acquire_lease(&self) -> Result<Option<ProxyLease>, FetchClientError> {
        let Some(pool) = &self.proxy_pool else {
            return Ok(None);
        };

        loop {
            if let Some(lease) = pool.acquire().await {
                return Ok(Some(lease));
            }
            if self.policy.allow_fallback {
                tracing::warn!(
                    event = "proxy_lease_fallback",
                    "no proxy available, proceeding without one"
                );
                return Ok(None);
            }

            tracing::warn!(
                event = "proxy_lease_unavailable",
                retry_in_ms = self.policy.lease_retry_delay.as_millis() as u64,
                "no proxy available, waiting"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(FetchClientError::Cancelled),
                _ = tokio::time::sleep(self.policy.lease_retry_delay) => {}
            }
        }
    }

    fn proxied_client(&self, lease: &ProxyLease) -> Result<reqwest::Client, FetchClientError> {
        let proxy = reqwest::Proxy::all(format!("http://{}", lease.address))
            .map_err(FetchClientError::ClientBuild)?;
        reqwest::Client::builder()
            .timeout(self.policy.timeout)
            .proxy(proxy)
            .build()
            .map_err(FetchClientError::ClientBuild)
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchClientError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let transport = |source| FetchClientError::Transport {
            url: url.to_string(),
            source,
        };

        let response = client
            .get(url)
            .query(params)
            .header(USER_AGENT, self.spoofer.random_user_agent())
            .header(FORWARDED_FOR, self.spoofer.random_regional_ip())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchClientError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.bytes().await.map_err(transport)?;

        if let Some(declared) = declared {
            if declared != body.len() as u64 {
                return Err(FetchClientError::Incomplete {
                    url: url.to_string(),
                    declared,
                    received: body.len(),
                });
            }
        }

        Ok(FetchedResponse {
            url: url.to_string(),
            body: body.to_vec(),
        })
    }
}
