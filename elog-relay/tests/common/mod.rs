#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use elog_relay::ledger::{Ledger, LedgerError, MemoryLedger};
use elog_relay::publisher::{ChatPublisher, PublisherConfig};
use elog_relay::render::DEFAULT_SUBJECT_TEMPLATE;
use elog_relay::types::{RenderTemplates, Section};
use futures::stream::{self, StreamExt};
use interfaces::{
    Attachment, Attributes, ChatBackend, ChatMessageId, Entry, EntryId, EntrySource, EntryStream, OutgoingMessage,
    PublishError, SourceError,
};
use tokio_util::sync::CancellationToken;
use url::Url;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn entry(id: EntryId, parent_id: Option<EntryId>, attributes: &[(&str, &str)], body: &str) -> Entry {
    Entry {
        id,
        parent_id,
        attributes: attributes.iter().map(|(k, v)| (*k, *v)).collect::<Attributes>(),
        body: body.to_string(),
        attachments: Vec::new(),
        source_url: format!("https://elog.test/book/{id}"),
    }
}

/// Entry whose subject is `entry-<id>`, handy for matching posted content.
pub fn simple_entry(id: EntryId) -> Entry {
    let subject = format!("entry-{id}");
    entry(id, None, &[("Author", "John"), ("Subject", subject.as_str())], "body text")
}

pub fn section(id: &str) -> Section {
    Section {
        id: id.to_string(),
        source_url: Url::parse("https://elog.test/book/").unwrap(),
        credentials: None,
        chat_stream: "logbook".to_string(),
        ledger_table: "published".to_string(),
        templates: RenderTemplates {
            prefix: String::new(),
            subject: DEFAULT_SUBJECT_TEMPLATE.to_string(),
            topic: String::new(),
        },
        quote: false,
        show_header: false,
        only_latest: false,
    }
}

pub fn fast_publisher(backend: Arc<dyn ChatBackend>) -> Arc<ChatPublisher> {
    Arc::new(ChatPublisher::new(
        backend,
        PublisherConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        },
    ))
}

/// In-memory logbook.
#[derive(Default)]
pub struct FakeSource {
    entries: Mutex<Vec<Entry>>,
    ignore_marker: AtomicBool,
    fetch_error: Mutex<Option<SourceError>>,
    entry_errors: Mutex<HashMap<EntryId, SourceError>>,
    blobs: Mutex<HashMap<String, Result<Vec<u8>, SourceError>>>,
    markers: Mutex<Vec<Option<EntryId>>>,
}

impl FakeSource {
    pub fn new(entries: Vec<Entry>) -> Self {
        let source = Self::default();
        *source.entries.lock().unwrap() = entries;
        source
    }

    pub fn push(&self, entry: Entry) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Returns every entry regardless of the requested marker.
    pub fn ignoring_marker(self) -> Self {
        self.ignore_marker.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_fetch(&self, error: Option<SourceError>) {
        *self.fetch_error.lock().unwrap() = error;
    }

    pub fn fail_entry(&self, id: EntryId, error: SourceError) {
        self.entry_errors.lock().unwrap().insert(id, error);
    }

    pub fn set_blob(&self, blob_ref: &str, data: Result<Vec<u8>, SourceError>) {
        self.blobs.lock().unwrap().insert(blob_ref.to_string(), data);
    }

    /// Markers passed to `fetch_since`, one per fetch.
    pub fn markers(&self) -> Vec<Option<EntryId>> {
        self.markers.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntrySource for FakeSource {
    fn source_name(&self) -> String {
        "fake".to_string()
    }

    async fn fetch_since<'a>(&'a self, marker: Option<EntryId>) -> Result<EntryStream<'a>, SourceError> {
        self.markers.lock().unwrap().push(marker);
        if let Some(error) = self.fetch_error.lock().unwrap().clone() {
            return Err(error);
        }

        let ignore_marker = self.ignore_marker.load(Ordering::SeqCst);
        let mut entries: Vec<Entry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| ignore_marker || marker.map_or(true, |m| e.id > m))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);

        let errors = self.entry_errors.lock().unwrap().clone();
        let items: Vec<Result<Entry, SourceError>> = entries
            .into_iter()
            .map(|e| match errors.get(&e.id) {
                Some(error) => Err(error.clone()),
                None => Ok(e),
            })
            .collect();
        Ok(stream::iter(items).boxed())
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, SourceError> {
        match self.blobs.lock().unwrap().get(&attachment.blob_ref) {
            Some(result) => result.clone(),
            None => Ok(attachment.name.as_bytes().to_vec()),
        }
    }
}

struct Failure {
    needle: String,
    error: PublishError,
    remaining: usize,
}

/// Chat backend that records everything it is asked to send.
pub struct RecordingBackend {
    next_id: AtomicU64,
    sent: Mutex<Vec<(ChatMessageId, OutgoingMessage)>>,
    uploads: Mutex<Vec<String>>,
    attempts: AtomicU64,
    failures: Mutex<Vec<Failure>>,
    upload_error: Mutex<Option<PublishError>>,
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            sent: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
            upload_error: Mutex::new(None),
            cancel_on: Mutex::new(None),
        }
    }

    /// The next `times` messages whose content contains `needle` fail.
    pub fn fail_when(&self, needle: &str, error: PublishError, times: usize) {
        self.failures.lock().unwrap().push(Failure {
            needle: needle.to_string(),
            error,
            remaining: times,
        });
    }

    pub fn fail_uploads(&self, error: PublishError) {
        *self.upload_error.lock().unwrap() = Some(error);
    }

    /// Cancels `token` once a message containing `needle` has been sent.
    pub fn cancel_on(&self, needle: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((needle.to_string(), token));
    }

    pub fn sent(&self) -> Vec<(ChatMessageId, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    /// Number of `send_message` calls, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for RecordingBackend {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<ChatMessageId, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(failure) = failures
                .iter_mut()
                .find(|f| f.remaining > 0 && message.content.contains(&f.needle))
            {
                failure.remaining -= 1;
                return Err(failure.error.clone());
            }
        }

        let id = ChatMessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().push((id, message.clone()));

        if let Some((needle, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if message.content.contains(needle.as_str()) {
                token.cancel();
            }
        }
        Ok(id)
    }

    async fn upload_file(&self, name: &str, _data: Vec<u8>) -> Result<String, PublishError> {
        if let Some(error) = self.upload_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.uploads.lock().unwrap().push(name.to_string());
        Ok(format!("/user_uploads/{name}"))
    }
}

/// Ledger whose writes or reads can be switched off.
#[derive(Default)]
pub struct FailingLedger {
    inner: MemoryLedger,
    fail_record: AtomicBool,
    fail_reads: AtomicBool,
}

impl FailingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryLedger {
        &self.inner
    }

    pub fn fail_record(&self, fail: bool) {
        self.fail_record.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), LedgerError> {
        if flag.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for FailingLedger {
    async fn has_published(&self, section: &str, entry: EntryId) -> Result<bool, LedgerError> {
        self.check(&self.fail_reads)?;
        self.inner.has_published(section, entry).await
    }

    async fn record_published(
        &self,
        section: &str,
        entry: EntryId,
        chat_message_id: ChatMessageId,
    ) -> Result<(), LedgerError> {
        self.check(&self.fail_record)?;
        self.inner.record_published(section, entry, chat_message_id).await
    }

    async fn lookup_chat_message_id(
        &self,
        section: &str,
        entry: EntryId,
    ) -> Result<Option<ChatMessageId>, LedgerError> {
        self.check(&self.fail_reads)?;
        self.inner.lookup_chat_message_id(section, entry).await
    }

    async fn max_marker(&self, section: &str) -> Result<Option<EntryId>, LedgerError> {
        self.check(&self.fail_reads)?;
        self.inner.max_marker(section).await
    }
}
