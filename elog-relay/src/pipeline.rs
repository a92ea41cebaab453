//! Per-section relay cycle and the orchestrator that runs every section.
//!
//! A cycle walks `Fetching → Filtering → Publishing(entry) →
//! Committing(entry)` over the un-ledgered entries of one section, oldest
//! first. The fetch marker is re-derived from the ledger at the start of
//! every cycle, so an aborted cycle simply resumes from the last committed
//! entry next time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use interfaces::{ChatMessageId, Entry, EntryId, EntrySource, PublishError, SourceError};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ledger::{Ledger, LedgerError};
use crate::publisher::{AttachmentBlob, ChatPublisher};
use crate::render::Renderer;
use crate::types::{ErrorClass, RelayError, Section};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every listed entry was handled.
    Completed,
    /// Cancellation was requested between two entries.
    Interrupted,
    /// The cycle stopped early; the next one resumes from the ledger.
    Aborted(&'static str),
    /// The section is switched off until the process restarts.
    Disabled(&'static str),
    /// A rate limit hint has not elapsed yet; nothing was attempted.
    Deferred,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Completed => write!(f, "completed"),
            CycleOutcome::Interrupted => write!(f, "interrupted"),
            CycleOutcome::Aborted(kind) => write!(f, "aborted ({kind})"),
            CycleOutcome::Disabled(kind) => write!(f, "disabled ({kind})"),
            CycleOutcome::Deferred => write!(f, "deferred"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub section: String,
    /// Highest committed entry id once the cycle ended.
    pub marker: Option<EntryId>,
    pub published: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(section: &str) -> Self {
        Self {
            section: section.to_string(),
            marker: None,
            published: 0,
            skipped: 0,
            duplicates: 0,
            outcome: CycleOutcome::Completed,
        }
    }
}

/// Why a cycle stopped before the end of the batch.
struct Halt {
    entry: Option<EntryId>,
    error: RelayError,
}

impl Halt {
    fn cycle(error: impl Into<RelayError>) -> Self {
        Self {
            entry: None,
            error: error.into(),
        }
    }

    fn entry(entry: EntryId, error: impl Into<RelayError>) -> Self {
        Self {
            entry: Some(entry),
            error: error.into(),
        }
    }
}

/// Drives one section. Holds the only mutable state a section has across
/// cycles: whether it has been disabled and whether it is backing off.
pub struct SectionWorker {
    section: Section,
    source: Arc<dyn EntrySource>,
    ledger: Arc<dyn Ledger>,
    publisher: Arc<ChatPublisher>,
    renderer: Arc<Renderer>,
    disabled: Option<&'static str>,
    not_before: Option<Instant>,
}

impl SectionWorker {
    pub fn new(
        section: Section,
        source: Arc<dyn EntrySource>,
        ledger: Arc<dyn Ledger>,
        publisher: Arc<ChatPublisher>,
        renderer: Arc<Renderer>,
    ) -> Self {
        Self {
            section,
            source,
            ledger,
            publisher,
            renderer,
            disabled: None,
            not_before: None,
        }
    }

    pub fn section(&self) -> &Section {
        &self.section
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::new(&self.section.id);

        if let Some(kind) = self.disabled {
            debug!("[{}] disabled after {}, not polling", self.section.id, kind);
            report.outcome = CycleOutcome::Disabled(kind);
            return report;
        }
        if let Some(until) = self.not_before {
            if Instant::now() < until {
                debug!("[{}] rate limited, waiting until {:?}", self.section.id, until);
                report.outcome = CycleOutcome::Deferred;
                return report;
            }
            self.not_before = None;
        }

        report.outcome = match self.drive(cancel, &mut report).await {
            Ok(outcome) => outcome,
            Err(halt) => self.halt(halt),
        };

        info!(
            "[{}] cycle {}: {} published, {} skipped, {} duplicates, marker {:?}",
            report.section, report.outcome, report.published, report.skipped, report.duplicates, report.marker
        );
        report
    }

    async fn drive(&self, cancel: &CancellationToken, report: &mut CycleReport) -> Result<CycleOutcome, Halt> {
        let section = self.section.id.as_str();

        let marker = self.ledger.max_marker(section).await.map_err(Halt::cycle)?;
        report.marker = marker;
        debug!("[{}] fetching from {} after {:?}", section, self.source.source_name(), marker);

        let mut entries = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(CycleOutcome::Interrupted),
            fetched = self.source.fetch_since(marker) => fetched.map_err(Halt::cycle)?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(CycleOutcome::Interrupted),
                next = entries.next() => next,
            };
            let Some(next) = next else {
                break;
            };

            let entry = match next {
                Ok(entry) => entry,
                Err(e) => {
                    let error = RelayError::from(e);
                    if error.class() == ErrorClass::EntryScoped {
                        warn!(
                            "[{}] entry {}: skipped ({}): {}",
                            section,
                            label(error.entry()),
                            error.kind(),
                            error
                        );
                        report.skipped += 1;
                        continue;
                    }
                    return Err(Halt {
                        entry: error.entry(),
                        error,
                    });
                }
            };

            if self
                .ledger
                .has_published(section, entry.id)
                .await
                .map_err(|e| Halt::entry(entry.id, e))?
            {
                debug!("[{}] entry {}: already published", section, entry.id);
                report.duplicates += 1;
                continue;
            }

            let chat_id = match self.publish(&entry).await {
                Ok(id) => id,
                Err(error) if error.class() == ErrorClass::EntryScoped => {
                    warn!("[{}] entry {}: skipped ({}): {}", section, entry.id, error.kind(), error);
                    report.skipped += 1;
                    continue;
                }
                Err(error) => return Err(Halt::entry(entry.id, error)),
            };

            match self.ledger.record_published(section, entry.id, chat_id).await {
                Ok(()) => {
                    info!("[{}] entry {}: published as message {}", section, entry.id, chat_id);
                    report.published += 1;
                    report.marker = report.marker.max(Some(entry.id));
                }
                Err(LedgerError::DuplicateRecord { .. }) => {
                    warn!("[{}] entry {}: recorded concurrently, keeping existing row", section, entry.id);
                    report.duplicates += 1;
                }
                Err(e) => {
                    error!(
                        "[{}] entry {}: PUBLISHED BUT NOT RECORDED as message {} ({}): {}",
                        section,
                        entry.id,
                        chat_id,
                        e.kind(),
                        e
                    );
                    return Err(Halt::entry(entry.id, e));
                }
            }
        }

        Ok(CycleOutcome::Completed)
    }

    /// Renders, resolves the reply anchor, fetches attachments and posts.
    async fn publish(&self, entry: &Entry) -> Result<ChatMessageId, RelayError> {
        let section = self.section.id.as_str();
        let rendered = self.renderer.render_message(&self.section, entry)?;

        let reply_to = match entry.parent_id {
            Some(parent) => {
                let anchor = self.ledger.lookup_chat_message_id(section, parent).await?;
                if anchor.is_none() {
                    warn!(
                        "[{}] entry {}: parent {} has no recorded message, posting unthreaded",
                        section, entry.id, parent
                    );
                }
                anchor
            }
            None => None,
        };

        let mut blobs = Vec::with_capacity(entry.attachments.len());
        for attachment in &entry.attachments {
            match self.source.download_attachment(attachment).await {
                Ok(data) => blobs.push(AttachmentBlob {
                    name: attachment.name.clone(),
                    data,
                }),
                Err(e @ SourceError::AuthenticationFailed { .. }) => return Err(e.into()),
                Err(e) => warn!(
                    "[{}] entry {}: attachment {} omitted ({}): {}",
                    section,
                    entry.id,
                    attachment.name,
                    e.kind(),
                    e
                ),
            }
        }

        let id = self
            .publisher
            .post(&self.section.chat_stream, &rendered.topic, &rendered.chunks, blobs, reply_to)
            .await?;
        Ok(id)
    }

    fn halt(&mut self, halt: Halt) -> CycleOutcome {
        let Halt { entry, error } = halt;
        let section = self.section.id.as_str();
        let kind = error.kind();

        match error.class() {
            ErrorClass::SectionFatal => {
                if let RelayError::Source(SourceError::AuthenticationFailed { .. }) = error {
                    error!(
                        "[{}] entry {}: {} ({}), skipping section this cycle",
                        section,
                        label(entry),
                        error,
                        kind
                    );
                    return CycleOutcome::Aborted(kind);
                }
                error!(
                    "[{}] entry {}: {} ({}), disabling section until restart",
                    section,
                    label(entry),
                    error,
                    kind
                );
                self.disabled = Some(kind);
                CycleOutcome::Disabled(kind)
            }
            ErrorClass::Retryable => {
                if let RelayError::Publish(PublishError::RateLimited {
                    retry_after: Some(delay),
                }) = error
                {
                    self.not_before = Some(Instant::now() + delay);
                    warn!(
                        "[{}] entry {}: rate limited, next attempt in {:?}",
                        section,
                        label(entry),
                        delay
                    );
                } else {
                    warn!(
                        "[{}] entry {}: {} ({}), retrying next cycle",
                        section,
                        label(entry),
                        error,
                        kind
                    );
                }
                CycleOutcome::Aborted(kind)
            }
            ErrorClass::Benign | ErrorClass::EntryScoped | ErrorClass::ProcessFatal => {
                error!("[{}] entry {}: {} ({})", section, label(entry), error, kind);
                CycleOutcome::Aborted(kind)
            }
        }
    }

    /// Polls every `interval` until `cancel` fires. A cycle in progress
    /// finishes its current entry before the loop exits.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle(&cancel).await;
                }
            }
        }
        info!("[{}] stopped", self.section.id);
    }
}

fn label(entry: Option<EntryId>) -> String {
    entry.map_or_else(|| "-".to_string(), |id| id.to_string())
}

/// Runs every configured section independently of the others.
pub struct Orchestrator {
    workers: Vec<SectionWorker>,
    renderer: Arc<Renderer>,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            workers: Vec::new(),
            renderer: Arc::new(Renderer::new()),
            poll_interval,
        }
    }

    pub fn add_section(
        &mut self,
        section: Section,
        source: Arc<dyn EntrySource>,
        ledger: Arc<dyn Ledger>,
        publisher: Arc<ChatPublisher>,
    ) {
        info!("Adding section {} ({})", section.id, source.source_name());
        self.workers.push(SectionWorker::new(
            section,
            source,
            ledger,
            publisher,
            self.renderer.clone(),
        ));
    }

    pub fn section_count(&self) -> usize {
        self.workers.len()
    }

    /// One cycle of every section, concurrently. Reports follow the order in
    /// which sections were added.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Vec<CycleReport> {
        join_all(self.workers.iter_mut().map(|worker| worker.run_cycle(cancel))).await
    }

    /// Polls all sections until `cancel` fires, one task per section.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Relaying {} sections every {:?}",
            self.workers.len(),
            self.poll_interval
        );

        let mut tasks = JoinSet::new();
        for worker in self.workers {
            tasks.spawn(worker.run(self.poll_interval, cancel.clone()));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Section task failed: {}", e);
            }
        }
        info!("All sections stopped");
    }
}
