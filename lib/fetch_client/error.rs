use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("incomplete response from {url}: declared {declared} bytes, received {received}")]
    Incomplete {
        url: String,
        declared: u64,
        received: usize,
    },

    #[error("failed to configure http client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("shutdown requested while waiting for a proxy lease")]
    Cancelled,
}

impl FetchClientError {
    /// Whether another attempt of the same request might succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ClientBuild(_))
    }
}
