use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use interfaces::{ChatBackend, ChatMessageId, OutgoingMessage, PublishError};
use tracing::info;

/// Logs what would be sent and hands out increasing fake message ids.
pub struct DryRunBackend {
    next_id: AtomicU64,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for DryRunBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatBackend for DryRunBackend {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<ChatMessageId, PublishError> {
        let id = ChatMessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            "[dry-run] message {} to {} / {} (reply to {:?}):\n{}",
            id, message.stream, message.topic, message.reply_to, message.content
        );
        Ok(id)
    }

    async fn upload_file(&self, name: &str, data: Vec<u8>) -> Result<String, PublishError> {
        info!("[dry-run] upload {} ({} bytes)", name, data.len());
        Ok(format!("dry-run://{name}"))
    }
}
