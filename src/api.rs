use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::models::RateRecord;

/// Where fresh rates come from.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rates(&self) -> Result<Vec<RateRecord>, SourceError>;
}

/// Fetches the rate list from an HTTP endpoint returning a JSON array.
pub struct HttpRateSource {
    http: Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder().timeout(timeout).build().unwrap_or_else(|err| {
            warn!(error = %err, "Failed to build HTTP client, using defaults");
            Client::new()
        });

        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch_rates(&self) -> Result<Vec<RateRecord>, SourceError> {
        let response = self.http.get(&self.url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let rates: Vec<RateRecord> = serde_json::from_str(&body)?;
                if rates.is_empty() {
                    return Err(SourceError::Empty);
                }
                debug!(count = rates.len(), "fetched rates");
                Ok(rates)
            }
            status @ (StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) => {
                Err(SourceError::RateLimited(status))
            }
            status => Err(SourceError::Status(status)),
        }
    }
}
