use std::fmt;

use interfaces::{EntryId, PublishError, SourceError};
use url::Url;

use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::render::TemplateError;

/// One configured logbook → chat topic relay stream. Built once from the
/// configuration file and never modified afterwards.
#[derive(Debug, Clone)]
pub struct Section {
    pub id: String,
    pub source_url: Url,
    pub credentials: Option<Credentials>,
    pub chat_stream: String,
    pub ledger_table: String,
    pub templates: RenderTemplates,
    pub quote: bool,
    pub show_header: bool,
    pub only_latest: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Expression templates evaluated against an entry's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTemplates {
    pub prefix: String,
    pub subject: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_redirects: usize,
    pub min_request_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "elog-relay/0.1".to_string(),
            timeout_seconds: 30,
            max_retries: 2,
            retry_delay_ms: 1_000,
            max_redirects: 5,
            min_request_interval_ms: 200,
        }
    }
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Already handled; treat as success.
    Benign,
    /// Skip the one entry and continue the batch.
    EntryScoped,
    /// Abort this section's cycle; the next cycle resumes from the ledger.
    Retryable,
    /// Stop the section until an operator intervenes.
    SectionFatal,
    /// Stop the process.
    ProcessFatal,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Config(_) => ErrorClass::ProcessFatal,
            RelayError::Source(SourceError::AuthenticationFailed { .. }) => ErrorClass::SectionFatal,
            RelayError::Source(SourceError::SourceUnreachable(_)) => ErrorClass::Retryable,
            RelayError::Source(SourceError::MalformedPage { .. }) => ErrorClass::EntryScoped,
            RelayError::Publish(PublishError::RateLimited { .. })
            | RelayError::Publish(PublishError::TransientNetworkError(_)) => ErrorClass::Retryable,
            RelayError::Publish(PublishError::StreamNotFound { .. })
            | RelayError::Publish(PublishError::PermissionDenied(_)) => ErrorClass::SectionFatal,
            RelayError::Ledger(LedgerError::DuplicateRecord { .. }) => ErrorClass::Benign,
            RelayError::Ledger(LedgerError::Unavailable(_)) => ErrorClass::Retryable,
            RelayError::Ledger(LedgerError::InvalidTable(_)) => ErrorClass::ProcessFatal,
            RelayError::Publish(PublishError::Rejected(_)) => ErrorClass::EntryScoped,
            RelayError::Template(_) => ErrorClass::EntryScoped,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "ConfigError",
            RelayError::Source(e) => e.kind(),
            RelayError::Publish(e) => e.kind(),
            RelayError::Ledger(e) => e.kind(),
            RelayError::Template(_) => "TemplateError",
        }
    }

    /// The entry an entry-scoped error refers to, when the error carries one.
    pub fn entry(&self) -> Option<EntryId> {
        match self {
            RelayError::Source(SourceError::MalformedPage { entry, .. }) => Some(*entry),
            RelayError::Ledger(LedgerError::DuplicateRecord { entry, .. }) => Some(*entry),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
