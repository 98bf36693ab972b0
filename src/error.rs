use reqwest::StatusCode;
use thiserror::Error;

/// Failures reaching or decoding the remote price source. All of these are
/// recovered from by falling back to the cache.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request limit exceeded ({0})")]
    RateLimited(StatusCode),

    #[error("unexpected response status: {0}")]
    Status(StatusCode),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("source returned no rates")]
    Empty,
}

/// Failures of the durable key/value layer under the rate cache.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    /// Nothing was fetched and nothing is cached.
    #[error("no data available, check the network connection")]
    NoData,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
