//! Subscription fetching.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::SubscriptionConfig;
use crate::subscription::SubscriptionError;

/// Where subscription bodies come from.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Fetch the raw body behind `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SubscriptionError>;
}

/// HTTP(S) source.
pub struct HttpSubscriptionSource {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpSubscriptionSource {
    pub fn new(config: &SubscriptionConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl SubscriptionSource for HttpSubscriptionSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SubscriptionError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SubscriptionError::Fetch(format!("timed out fetching {}", url))
            } else {
                SubscriptionError::Fetch(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubscriptionError::Fetch(format!("{} returned {}", url, status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SubscriptionError::Fetch(e.to_string()))?;
        if body.len() > self.max_body_bytes {
            return Err(SubscriptionError::Fetch(format!(
                "body of {} bytes exceeds limit of {}",
                body.len(),
                self.max_body_bytes
            )));
        }

        tracing::debug!(url = %url, bytes = body.len(), "Fetched subscription");
        Ok(body.to_vec())
    }
}
