use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use interfaces::{ChatBackend, ChatMessageId, OutgoingMessage, PublishError};
use tracing::{debug, warn};

/// Body posted when an entry renders to nothing at all.
pub const EMPTY_MESSAGE: &str = "(no content)";

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Attempts per backend call, counting the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// A downloaded attachment waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBlob {
    pub name: String,
    pub data: Vec<u8>,
}

/// Posts rendered entries through a [`ChatBackend`].
///
/// Transient failures are retried here with exponential backoff; every other
/// failure is returned to the caller unchanged so it can decide how far the
/// error reaches.
pub struct ChatPublisher {
    backend: Arc<dyn ChatBackend>,
    config: PublisherConfig,
}

impl ChatPublisher {
    pub fn new(backend: Arc<dyn ChatBackend>, config: PublisherConfig) -> Self {
        Self { backend, config }
    }

    /// Uploads `attachments`, then posts `body` chunk by chunk followed by a
    /// message linking the uploads. Only the first message carries
    /// `reply_to`; its id is returned and serves as the entry's anchor.
    pub async fn post(
        &self,
        stream: &str,
        topic: &str,
        body: &[String],
        attachments: Vec<AttachmentBlob>,
        reply_to: Option<ChatMessageId>,
    ) -> Result<ChatMessageId, PublishError> {
        let mut links = Vec::new();
        for blob in &attachments {
            let uploaded = self
                .call("upload", || self.backend.upload_file(&blob.name, blob.data.clone()))
                .await;
            match uploaded {
                Ok(uri) => links.push(format!("[{}]({})", blob.name, uri)),
                Err(e @ (PublishError::RateLimited { .. } | PublishError::TransientNetworkError(_))) => {
                    return Err(e);
                }
                Err(e) => warn!("Upload of {} rejected, posting without it: {}", blob.name, e),
            }
        }

        let mut contents: Vec<String> = body.iter().filter(|c| !c.trim().is_empty()).cloned().collect();
        if !links.is_empty() {
            contents.push(links.join("\n"));
        }
        if contents.is_empty() {
            contents.push(EMPTY_MESSAGE.to_string());
        }

        let mut anchor = None;
        for (index, content) in contents.into_iter().enumerate() {
            let message = OutgoingMessage {
                stream: stream.to_string(),
                topic: topic.to_string(),
                content,
                reply_to: if index == 0 { reply_to } else { None },
            };
            let sent = self.call("send", || self.backend.send_message(&message)).await;
            match sent {
                Ok(id) => {
                    debug!("Posted part {} to {} / {} as {}", index + 1, stream, topic, id);
                    anchor.get_or_insert(id);
                }
                Err(e) => {
                    if index > 0 {
                        warn!("{} parts already posted to {} / {} before failure", index, stream, topic);
                    }
                    return Err(e);
                }
            }
        }

        anchor.ok_or_else(|| PublishError::TransientNetworkError("nothing was posted".to_string()))
    }

    async fn call<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let mut backoff = ExponentialBackoff {
            current_interval: self.config.initial_backoff,
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.config.call_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(PublishError::TransientNetworkError(format!(
                    "{what} timed out after {:?}",
                    self.config.call_timeout
                ))),
            };

            match result {
                Err(PublishError::TransientNetworkError(reason)) if attempt < self.config.max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    warn!(
                        "Chat {} attempt {} failed: {}; retrying in {:?}",
                        what, attempt, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
