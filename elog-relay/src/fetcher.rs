use crate::types::FetchConfig;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use interfaces::SourceError;
use reqwest::header::COOKIE;
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// HTTP access to one logbook server. Every request is bounded by the
/// configured timeout; transport errors and 5xx answers are retried with
/// exponential backoff before surfacing as `SourceUnreachable`.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            last_request: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn get_text(&self, url: &Url, cookie: Option<&str>) -> Result<String, SourceError> {
        let response = self.get(url, cookie).await?;
        response
            .text()
            .await
            .map_err(|e| SourceError::SourceUnreachable(format!("{url}: {e}")))
    }

    pub async fn get_bytes(&self, url: &Url, cookie: Option<&str>) -> Result<Vec<u8>, SourceError> {
        let response = self.get(url, cookie).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::SourceUnreachable(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn get(&self, url: &Url, cookie: Option<&str>) -> Result<Response, SourceError> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.retry_delay_ms),
            initial_interval: Duration::from_millis(self.config.retry_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_delay_ms * 32),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            self.apply_rate_limit(url).await;
            debug!("GET {} (attempt {})", url, attempt + 1);

            let mut request = self.client.get(url.clone());
            if let Some(cookie) = cookie {
                request = request.header(COOKIE, cookie);
            }

            let error = match request.send().await {
                Ok(response) => match response.status() {
                    status if status.is_success() => return Ok(response),
                    status if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                        return Err(SourceError::AuthenticationFailed { url: url.to_string() });
                    }
                    status if status.is_server_error() => format!("HTTP {status}"),
                    status => {
                        return Err(SourceError::SourceUnreachable(format!("{url}: HTTP {status}")));
                    }
                },
                Err(e) => e.to_string(),
            };

            if attempt < self.config.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Attempt {} failed for {}: {}; retrying in {:?}", attempt + 1, url, error, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            }
            return Err(SourceError::SourceUnreachable(format!(
                "{url}: {error} (after {} attempts)",
                attempt + 1
            )));
        }
    }

    /// Keeps a minimum spacing between requests to the same host.
    async fn apply_rate_limit(&self, url: &Url) {
        let host = url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.min_request_interval_ms);

        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = last_request.get(&host) {
            let elapsed = previous.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!("Rate limiting {}: waiting {:?}", host, wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        last_request.insert(host, Instant::now());
    }
}
