use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Logbook-assigned entry number. Unique within one logbook and increasing
/// with creation time, so it doubles as the incremental fetch marker.
pub type EntryId = u64;

/// Identifier the chat backend hands back for a posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatMessageId(pub u64);

impl fmt::Display for ChatMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Insertion-ordered attribute mapping of a logbook entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Sets `name`, keeping its original position if it was already present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

/// A file attached to an entry. `blob_ref` is whatever the source needs to
/// download it again (for elog: an absolute URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub blob_ref: String,
}

/// Canonical logbook record, independent of how the logbook was scraped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub parent_id: Option<EntryId>,
    pub attributes: Attributes,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub source_url: String,
}

impl Entry {
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// One message as handed to the chat backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub stream: String,
    pub topic: String,
    pub content: String,
    pub reply_to: Option<ChatMessageId>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("authentication failed for {url}")]
    AuthenticationFailed { url: String },

    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("malformed entry {entry}: {reason}")]
    MalformedPage { entry: EntryId, reason: String },
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::AuthenticationFailed { .. } => "AuthenticationFailed",
            SourceError::SourceUnreachable(_) => "SourceUnreachable",
            SourceError::MalformedPage { .. } => "MalformedPage",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("rate limited by chat backend")]
    RateLimited { retry_after: Option<Duration> },

    #[error("stream not found: {stream}")]
    StreamNotFound { stream: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transient network error: {0}")]
    TransientNetworkError(String),

    /// The backend refused this one message (bad topic, oversized content).
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl PublishError {
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::RateLimited { .. } => "RateLimited",
            PublishError::StreamNotFound { .. } => "StreamNotFound",
            PublishError::PermissionDenied(_) => "PermissionDenied",
            PublishError::TransientNetworkError(_) => "TransientNetworkError",
            PublishError::Rejected(_) => "Rejected",
        }
    }
}

/// Entries ordered oldest first. Detail reads happen as the stream is polled.
pub type EntryStream<'a> = BoxStream<'a, Result<Entry, SourceError>>;

/// Incremental read access to one logbook.
#[async_trait]
pub trait EntrySource: Send + Sync {
    /// Human-readable name used in log lines.
    fn source_name(&self) -> String;

    /// Entries with an id strictly greater than `marker` (all entries when
    /// `marker` is `None`). Listing happens before this returns, so bad
    /// credentials and an unreachable logbook surface here rather than
    /// mid-stream.
    async fn fetch_since<'a>(&'a self, marker: Option<EntryId>) -> Result<EntryStream<'a>, SourceError>;

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, SourceError>;
}

/// Write access to a stream/topic based chat platform.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<ChatMessageId, PublishError>;

    /// Uploads a file and returns a URI that can be linked from a message.
    async fn upload_file(&self, name: &str, data: Vec<u8>) -> Result<String, PublishError>;
}
